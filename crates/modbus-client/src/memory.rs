//! In-memory register bank standing in for a controller on the bus.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{ClientError, RegisterReader};

/// Answers reads for the units it holds registers for and times out for everyone else.
#[derive(Debug, Default)]
pub struct MemoryRegisters {
    units: Mutex<HashMap<u8, HashMap<u16, u16>>>,
    silent: Mutex<HashSet<u8>>,
    scripted_failures: Mutex<VecDeque<ClientError>>,
    reads: Mutex<Vec<(u8, u16, u16)>>,
}

impl MemoryRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_block(&self, unit_id: u8, start: u16, values: &[u16]) {
        let mut units = self.units.lock().unwrap_or_else(|err| err.into_inner());
        let bank = units.entry(unit_id).or_default();
        for (offset, value) in values.iter().enumerate() {
            bank.insert(start.wrapping_add(offset as u16), *value);
        }
    }

    /// Stop answering on `unit_id` until [`MemoryRegisters::wake`] is called.
    pub fn silence(&self, unit_id: u8) {
        self.silent
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .insert(unit_id);
    }

    pub fn wake(&self, unit_id: u8) {
        self.silent
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .remove(&unit_id);
    }

    /// Queue an error returned by the next read regardless of unit.
    pub fn fail_next(&self, error: ClientError) {
        self.scripted_failures
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push_back(error);
    }

    pub fn reads(&self) -> Vec<(u8, u16, u16)> {
        self.reads.lock().unwrap_or_else(|err| err.into_inner()).clone()
    }
}

#[async_trait]
impl RegisterReader for MemoryRegisters {
    async fn read_range(&self, unit_id: u8, start: u16, count: u16) -> Result<Vec<u16>, ClientError> {
        self.reads
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push((unit_id, start, count));

        if let Some(error) = self
            .scripted_failures
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .pop_front()
        {
            return Err(error);
        }

        if self
            .silent
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .contains(&unit_id)
        {
            return Err(ClientError::Timeout { timeout_ms: 0 });
        }

        let units = self.units.lock().unwrap_or_else(|err| err.into_inner());
        let bank = units
            .get(&unit_id)
            .ok_or(ClientError::Timeout { timeout_ms: 0 })?;
        let end = u32::from(start) + u32::from(count);
        if end > u32::from(u16::MAX) + 1 {
            return Err(ClientError::AddressOverflow);
        }
        Ok((u32::from(start)..end)
            .map(|address| bank.get(&(address as u16)).copied().unwrap_or(0))
            .collect())
    }
}
