//! Cluster-wide locks held on behalf of slave transactions
//!
//! Every lock request names a set of resources and is granted all or
//! nothing. A requester that would have to wait on a transaction which
//! (transitively) waits on it gets `DeadLocked` instead of blocking.

use crate::context::SlaveContext;
use crate::master::LockResult;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

/// Identity of a slave transaction: `(session_id, machine_id, event_identifier)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxKey {
    /// Slave session
    pub session_id: i64,
    /// Slave machine id
    pub machine_id: i32,
    /// Slave transaction counter
    pub event_identifier: i32,
}

impl From<&SlaveContext> for TxKey {
    fn from(context: &SlaveContext) -> Self {
        Self {
            session_id: context.session_id,
            machine_id: context.machine_id,
            event_identifier: context.event_identifier,
        }
    }
}

impl fmt::Display for TxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tx({}, {}, {})",
            self.session_id, self.machine_id, self.event_identifier
        )
    }
}

/// A lockable resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceId {
    /// Node by id
    Node(u64),
    /// Relationship by id
    Relationship(u64),
    /// Entry of a named index
    IndexEntry {
        /// Index name
        index: String,
        /// Entry key
        key: String,
    },
}

/// Shared or exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared
    Read,
    /// Exclusive
    Write,
}

#[derive(Debug, Default)]
struct LockEntry {
    writer: Option<TxKey>,
    readers: HashSet<TxKey>,
}

impl LockEntry {
    fn is_free(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }

    /// Other transactions standing in the way of `owner`
    fn blockers(&self, owner: TxKey, mode: LockMode, into: &mut HashSet<TxKey>) {
        if let Some(writer) = self.writer {
            if writer != owner {
                into.insert(writer);
            }
        }
        if mode == LockMode::Write {
            into.extend(self.readers.iter().copied().filter(|r| *r != owner));
        }
    }
}

#[derive(Debug, Default)]
struct LockTable {
    entries: HashMap<ResourceId, LockEntry>,
    held: HashMap<TxKey, HashSet<ResourceId>>,
    waiting_on: HashMap<TxKey, HashSet<TxKey>>,
}

impl LockTable {
    fn blockers(&self, owner: TxKey, resources: &[ResourceId], mode: LockMode) -> HashSet<TxKey> {
        let mut blockers = HashSet::new();
        for resource in resources {
            if let Some(entry) = self.entries.get(resource) {
                entry.blockers(owner, mode, &mut blockers);
            }
        }
        blockers
    }

    /// True when some blocker transitively waits on `owner`
    fn closes_cycle(&self, owner: TxKey, blockers: &HashSet<TxKey>) -> bool {
        let mut stack: Vec<TxKey> = blockers.iter().copied().collect();
        let mut seen = HashSet::new();
        while let Some(tx) = stack.pop() {
            if tx == owner {
                return true;
            }
            if !seen.insert(tx) {
                continue;
            }
            if let Some(next) = self.waiting_on.get(&tx) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }

    fn grant(&mut self, owner: TxKey, resources: &[ResourceId], mode: LockMode) {
        let held = self.held.entry(owner).or_default();
        for resource in resources {
            let entry = self.entries.entry(resource.clone()).or_default();
            match mode {
                LockMode::Write => entry.writer = Some(owner),
                LockMode::Read => {
                    entry.readers.insert(owner);
                }
            }
            held.insert(resource.clone());
        }
    }
}

/// Lock manager of the master
#[derive(Debug)]
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    timeout: Duration,
}

impl LockManager {
    /// Create a manager; requests give up after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Lock every resource in `resources` for `owner`, or none of them
    ///
    /// Locks already held by `owner` are granted again. A write request by
    /// the only reader upgrades in place.
    pub fn acquire(&self, owner: TxKey, resources: &[ResourceId], mode: LockMode) -> LockResult {
        let deadline = Instant::now() + self.timeout;
        let mut table = self.table.lock();
        loop {
            let blockers = table.blockers(owner, resources, mode);
            if blockers.is_empty() {
                table.waiting_on.remove(&owner);
                table.grant(owner, resources, mode);
                return LockResult::locked();
            }

            if table.closes_cycle(owner, &blockers) {
                table.waiting_on.remove(&owner);
                tracing::debug!("{} would deadlock waiting on {:?}", owner, blockers);
                return LockResult::dead_locked(format!(
                    "{} would deadlock on {} resource(s)",
                    owner,
                    resources.len()
                ));
            }

            table.waiting_on.insert(owner, blockers);
            if self.released.wait_until(&mut table, deadline).timed_out() {
                table.waiting_on.remove(&owner);
                self.released.notify_all();
                return LockResult::not_locked(format!(
                    "{} timed out after {:?} waiting for {:?} lock",
                    owner, self.timeout, mode
                ));
            }
        }
    }

    /// Release every lock held by `owner`
    ///
    /// Returns the number of resources released.
    pub fn release_all(&self, owner: TxKey) -> usize {
        let mut table = self.table.lock();
        table.waiting_on.remove(&owner);
        let Some(held) = table.held.remove(&owner) else {
            return 0;
        };
        for resource in &held {
            let now_free = match table.entries.get_mut(resource) {
                Some(entry) => {
                    if entry.writer == Some(owner) {
                        entry.writer = None;
                    }
                    entry.readers.remove(&owner);
                    entry.is_free()
                }
                None => false,
            };
            if now_free {
                table.entries.remove(resource);
            }
        }
        self.released.notify_all();
        held.len()
    }

    /// Number of resources `owner` holds
    pub fn held_by(&self, owner: TxKey) -> usize {
        self.table.lock().held.get(&owner).map_or(0, |held| held.len())
    }

    /// Number of locked resources
    pub fn locked_resources(&self) -> usize {
        self.table.lock().entries.len()
    }
}
