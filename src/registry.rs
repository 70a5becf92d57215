//! Bookkeeping of launched workers.
//!
//! The daemon has no reliable exit notification for workers (they are
//! reparented to init by the double fork), so liveness is probed lazily with
//! signal 0 whenever the table is about to be read or grown.

use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::{Pid, Uid};

use crate::protocol::WorkerRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Worker {
    pub uid: Uid,
    pub pid: Pid,
}

/// Bounded table of live workers. Entries are appended on launch and
/// compacted on prune; the bound keeps daemon memory fixed no matter how
/// many launches a client attempts.
#[derive(Debug)]
pub struct Registry {
    workers: Vec<Worker>,
    capacity: usize,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Registry {
            workers: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.workers.len() >= self.capacity
    }

    /// Appends a worker. Callers prune and check `is_full` first.
    pub fn insert(&mut self, uid: Uid, pid: Pid) {
        debug_assert!(!self.is_full());
        self.workers.push(Worker { uid, pid });
    }

    /// Drops entries whose process has vanished. Dead slots are filled by
    /// swapping in the last entry; order of the table is irrelevant.
    pub fn prune(&mut self) {
        for i in (0..self.workers.len()).rev() {
            if !process_exists(self.workers[i].pid) {
                self.workers.swap_remove(i);
            }
        }
    }

    /// All entries belonging to the given user, in wire form.
    pub fn list_for(&self, uid: Uid) -> Vec<WorkerRecord> {
        self.workers
            .iter()
            .filter(|worker| worker.uid == uid)
            .map(|worker| WorkerRecord {
                uid: worker.uid.as_raw(),
                pid: worker.pid.as_raw(),
            })
            .collect()
    }
}

fn process_exists(pid: Pid) -> bool {
    // Signal 0 performs the permission and existence checks without
    // delivering anything. EPERM still means the process exists.
    match signal::kill(pid, None) {
        Ok(_) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use nix::unistd;

    fn own_uid() -> Uid {
        unistd::getuid()
    }

    #[test]
    fn test_insert_and_list_for() {
        let mut registry = Registry::new(8);
        registry.insert(own_uid(), unistd::getpid());
        registry.insert(Uid::from_raw(0), Pid::from_raw(1));

        let mine = registry.list_for(own_uid());
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].uid, own_uid().as_raw());
        assert_eq!(mine[0].pid, unistd::getpid().as_raw());
    }

    #[test]
    fn test_list_is_filtered_by_uid() {
        let mut registry = Registry::new(8);
        registry.insert(Uid::from_raw(1000), unistd::getpid());
        registry.insert(Uid::from_raw(1001), unistd::getpid());

        for record in registry.list_for(Uid::from_raw(1000)) {
            assert_eq!(record.uid, 1000);
        }
        assert_eq!(registry.list_for(Uid::from_raw(1000)).len(), 1);
    }

    #[test]
    fn test_prune_removes_dead_entries() {
        let mut registry = Registry::new(8);
        // The test process itself is alive; i32::MAX is far past pid_max.
        registry.insert(own_uid(), unistd::getpid());
        registry.insert(own_uid(), Pid::from_raw(i32::MAX));
        registry.insert(own_uid(), Pid::from_raw(i32::MAX - 1));

        registry.prune();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.list_for(own_uid())[0].pid, unistd::getpid().as_raw());
    }

    #[test]
    fn test_prune_keeps_init() {
        let mut registry = Registry::new(8);
        // Sending signal 0 to pid 1 fails with EPERM for non-root, which
        // still proves existence.
        registry.insert(Uid::from_raw(0), Pid::from_raw(1));
        registry.prune();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_capacity_bound() {
        let mut registry = Registry::new(2);
        registry.insert(own_uid(), unistd::getpid());
        assert!(!registry.is_full());
        registry.insert(own_uid(), unistd::getpid());
        assert!(registry.is_full());
    }

    #[test]
    fn test_repeated_prune_is_stable() {
        let mut registry = Registry::new(8);
        registry.insert(own_uid(), unistd::getpid());
        registry.prune();
        let first = registry.list_for(own_uid());
        registry.prune();
        let second = registry.list_for(own_uid());
        assert_eq!(first, second);
    }
}
