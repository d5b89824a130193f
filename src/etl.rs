//! Sorted collect-then-load buffer, the narrow contract unwind needs from
//! the external spill collector: entries load in key order and the first
//! value collected for a key wins (oldest-entry semantics).

use crate::error::Result;
use std::collections::BTreeMap;

#[derive(Default)]
pub struct Collector {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collect(&mut self, key: &[u8], value: &[u8]) {
        self.entries
            .entry(key.to_vec())
            .or_insert_with(|| value.to_vec());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn load(self, mut f: impl FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        for (key, value) in &self.entries {
            f(key, value)?;
        }
        Ok(())
    }
}
