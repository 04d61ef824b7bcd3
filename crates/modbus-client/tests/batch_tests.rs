use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use modbus_client::{read_batched, ChunkSource, ClientConfig, ClientError};

enum Step {
    Fail,
    Hang,
}

/// Answers every request with register addresses as values unless a scripted step says otherwise.
#[derive(Default)]
struct ScriptedSource {
    script: VecDeque<Step>,
    calls: Vec<(u8, u16, u16)>,
    call_times: Vec<Instant>,
}

impl ScriptedSource {
    fn with_script(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: steps.into_iter().collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl ChunkSource for ScriptedSource {
    async fn read_holding(&mut self, unit_id: u8, start: u16, count: u16) -> io::Result<Vec<u16>> {
        self.calls.push((unit_id, start, count));
        self.call_times.push(Instant::now());
        match self.script.pop_front() {
            Some(Step::Fail) => Err(io::Error::new(io::ErrorKind::Other, "illegal data address")),
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Vec::new())
            }
            None => Ok((0..count).map(|offset| start.wrapping_add(offset)).collect()),
        }
    }
}

fn config() -> ClientConfig {
    ClientConfig {
        timeout_ms: 200,
        retry_count: 2,
        retry_backoff_ms: 1,
        retry_max_backoff_ms: 2,
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn splits_reads_into_batches() {
    let mut source = ScriptedSource::default();
    let config = ClientConfig {
        max_batch_size: Some(10),
        ..config()
    };

    let values = read_batched(&mut source, &config, 3, 0x0100, 33)
        .await
        .expect("read");

    assert_eq!(values, (0x0100..0x0121).collect::<Vec<u16>>());
    assert_eq!(
        source.calls,
        vec![
            (3, 0x0100, 10),
            (3, 0x010A, 10),
            (3, 0x0114, 10),
            (3, 0x011E, 3),
        ]
    );
}

#[tokio::test]
async fn unbatched_read_is_one_request() {
    let mut source = ScriptedSource::default();

    let values = read_batched(&mut source, &config(), 1, 0x000A, 16)
        .await
        .expect("read");

    assert_eq!(values.len(), 16);
    assert_eq!(source.calls, vec![(1, 0x000A, 16)]);
}

#[tokio::test]
async fn zero_count_skips_the_bus() {
    let mut source = ScriptedSource::default();

    let values = read_batched(&mut source, &config(), 1, 0x0100, 0)
        .await
        .expect("read");

    assert!(values.is_empty());
    assert!(source.calls.is_empty());
}

#[tokio::test]
async fn range_past_last_register_overflows() {
    let mut source = ScriptedSource::default();
    let config = ClientConfig {
        max_batch_size: Some(16),
        ..config()
    };

    let err = read_batched(&mut source, &config, 1, 0xFFF0, 32)
        .await
        .expect_err("overflow");

    assert!(matches!(err, ClientError::AddressOverflow));
    assert_eq!(source.calls, vec![(1, 0xFFF0, 16)]);
}

#[tokio::test]
async fn pauses_between_batches() {
    let mut source = ScriptedSource::default();
    let config = ClientConfig {
        max_batch_size: Some(1),
        inter_read_delay_ms: Some(40),
        ..config()
    };

    read_batched(&mut source, &config, 1, 0x0100, 3)
        .await
        .expect("read");

    assert_eq!(source.call_times.len(), 3);
    for pair in source.call_times.windows(2) {
        assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(40));
    }
}

#[tokio::test]
async fn retries_until_the_device_answers() {
    let mut source = ScriptedSource::with_script([Step::Fail, Step::Fail]);

    let values = read_batched(&mut source, &config(), 1, 0x0100, 2)
        .await
        .expect("read after retries");

    assert_eq!(values, vec![0x0100, 0x0101]);
    assert_eq!(source.calls.len(), 3);
}

#[tokio::test]
async fn gives_up_after_retry_count() {
    let mut source = ScriptedSource::with_script([Step::Fail, Step::Fail, Step::Fail]);

    let err = read_batched(&mut source, &config(), 1, 0x0100, 2)
        .await
        .expect_err("retries exhausted");

    assert!(matches!(err, ClientError::Modbus(_)));
    assert_eq!(source.calls.len(), 3);
}

#[tokio::test]
async fn silent_device_times_out() {
    let mut source = ScriptedSource::with_script([Step::Hang]);
    let config = ClientConfig {
        timeout_ms: 20,
        retry_count: 0,
        ..config()
    };

    let err = read_batched(&mut source, &config, 1, 0x0100, 2)
        .await
        .expect_err("timeout");

    assert!(matches!(err, ClientError::Timeout { timeout_ms: 20 }));
    assert!(err.is_no_response());
    assert_eq!(source.calls.len(), 1);
}
