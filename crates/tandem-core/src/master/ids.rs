//! Id range allocation

use crate::master::{IdAllocation, IdType};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Ids handed out per request
pub const DEFAULT_GRAB_SIZE: u64 = 1000;

/// Hands out disjoint id ranges per [`IdType`]
#[derive(Debug)]
pub struct IdAllocator {
    grab_size: u64,
    next: Mutex<HashMap<IdType, u64>>,
}

impl IdAllocator {
    /// Allocator handing out `grab_size` ids at a time
    pub fn new(grab_size: u64) -> Self {
        Self {
            grab_size: grab_size.max(1),
            next: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve the next range for `id_type`
    pub fn allocate(&self, id_type: IdType) -> IdAllocation {
        let mut next = self.next.lock();
        let start = next.entry(id_type).or_insert(0);
        let allocation = IdAllocation {
            start: *start,
            length: self.grab_size,
            highest_id_in_use: *start + self.grab_size - 1,
            defrag_count: 0,
        };
        *start += self.grab_size;
        allocation
    }

    /// Ids handed out so far for `id_type`
    pub fn high_id(&self, id_type: IdType) -> u64 {
        self.next.lock().get(&id_type).copied().unwrap_or(0)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_GRAB_SIZE)
    }
}
