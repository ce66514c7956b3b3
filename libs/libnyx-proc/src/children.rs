//! Local child registry
//!
//! Per-instance pool of child entries with two singly linked lists threaded
//! through it by index: the active list (known, unreaped children) and the
//! free list. Every slot is on exactly one of them.

use std::sync::Arc;

use crate::error::{ProcError, Result};
use crate::signal::Termination;
use crate::table::Pid;

/// A known, unreaped child
#[derive(Debug, Clone)]
pub struct ChildEntry {
    pub pid: Pid,
    /// Host process identifier of the child
    pub native_pid: u32,
    /// Shared with the signal subsystem, which flips it on native exit
    pub termination: Arc<Termination>,
}

impl ChildEntry {
    pub fn is_terminated(&self) -> bool {
        self.termination.is_terminated()
    }
}

#[derive(Debug)]
struct Slot {
    entry: Option<ChildEntry>,
    next: Option<usize>,
}

/// Position of an active entry, as needed to unlink it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    prev: Option<usize>,
    index: usize,
}

/// Fixed-capacity set of children
#[derive(Debug)]
pub struct ChildRegistry {
    slots: Vec<Slot>,
    active_head: Option<usize>,
    free_head: Option<usize>,
    active_count: usize,
}

impl ChildRegistry {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|i| Slot {
                entry: None,
                next: (i + 1 < capacity).then_some(i + 1),
            })
            .collect();

        Self {
            slots,
            active_head: None,
            free_head: (capacity > 0).then_some(0),
            active_count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn active_count(&self) -> usize {
        self.active_count
    }

    pub fn is_full(&self) -> bool {
        self.free_head.is_none()
    }

    /// Move a free slot to the active list and fill it
    pub fn insert(&mut self, entry: ChildEntry) -> Result<()> {
        let index = self.free_head.ok_or(ProcError::ChildPoolFull {
            capacity: self.capacity(),
        })?;

        let slot = &mut self.slots[index];
        self.free_head = slot.next;
        slot.entry = Some(entry);
        slot.next = self.active_head;
        self.active_head = Some(index);
        self.active_count += 1;
        Ok(())
    }

    /// Find the active entry for `pid`
    pub fn find(&self, pid: Pid) -> Option<Cursor> {
        self.find_by(|entry| entry.pid == pid)
    }

    /// Find the first terminated entry in active-list order
    pub fn find_terminated(&self) -> Option<Cursor> {
        self.find_by(ChildEntry::is_terminated)
    }

    fn find_by(&self, mut pred: impl FnMut(&ChildEntry) -> bool) -> Option<Cursor> {
        let mut prev = None;
        let mut cur = self.active_head;
        while let Some(index) = cur {
            let slot = &self.slots[index];
            if slot.entry.as_ref().is_some_and(&mut pred) {
                return Some(Cursor { prev, index });
            }
            prev = cur;
            cur = slot.next;
        }
        None
    }

    /// Entry under `cursor`
    pub fn get(&self, cursor: Cursor) -> Option<&ChildEntry> {
        self.slots.get(cursor.index)?.entry.as_ref()
    }

    /// Unlink the entry under `cursor` and return its slot to the free list.
    ///
    /// The cursor must come from this registry with no mutation in between.
    pub fn remove(&mut self, cursor: Cursor) -> Option<ChildEntry> {
        let next = self.slots[cursor.index].next;
        match cursor.prev {
            Some(prev) => {
                debug_assert_eq!(self.slots[prev].next, Some(cursor.index));
                self.slots[prev].next = next;
            }
            None => {
                debug_assert_eq!(self.active_head, Some(cursor.index));
                self.active_head = next;
            }
        }

        let slot = &mut self.slots[cursor.index];
        let entry = slot.entry.take();
        slot.next = self.free_head;
        self.free_head = Some(cursor.index);
        self.active_count -= 1;
        entry
    }

    /// Active entries in list order
    pub fn iter(&self) -> impl Iterator<Item = &ChildEntry> + '_ {
        let mut cur = self.active_head;
        std::iter::from_fn(move || {
            let index = cur?;
            let slot = &self.slots[index];
            cur = slot.next;
            slot.entry.as_ref()
        })
    }

    /// Verify that every slot sits on exactly one list
    pub fn check_lists(&self) -> bool {
        let mut seen = vec![false; self.slots.len()];
        let mut walk = |head: Option<usize>, active: bool| -> Option<usize> {
            let mut count = 0;
            let mut cur = head;
            while let Some(index) = cur {
                if seen[index] || self.slots[index].entry.is_some() != active {
                    return None;
                }
                seen[index] = true;
                count += 1;
                cur = self.slots[index].next;
            }
            Some(count)
        };

        match (walk(self.active_head, true), walk(self.free_head, false)) {
            (Some(active), Some(free)) => {
                active == self.active_count && active + free == self.slots.len()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pid: Pid) -> ChildEntry {
        ChildEntry {
            pid,
            native_pid: 1000 + pid as u32,
            termination: Termination::new(),
        }
    }

    #[test]
    fn test_new_registry() {
        let reg = ChildRegistry::new(4);
        assert_eq!(reg.active_count(), 0);
        assert!(!reg.is_full());
        assert!(reg.check_lists());
        assert_eq!(reg.iter().count(), 0);
    }

    #[test]
    fn test_insert_and_find() {
        let mut reg = ChildRegistry::new(4);
        reg.insert(entry(5)).unwrap();
        reg.insert(entry(6)).unwrap();
        assert_eq!(reg.active_count(), 2);

        let cursor = reg.find(5).unwrap();
        assert_eq!(reg.get(cursor).unwrap().native_pid, 1005);
        assert!(reg.find(7).is_none());
        assert!(reg.check_lists());
    }

    #[test]
    fn test_pool_exhaustion_is_fatal() {
        let mut reg = ChildRegistry::new(2);
        reg.insert(entry(2)).unwrap();
        reg.insert(entry(3)).unwrap();
        assert!(reg.is_full());

        let err = reg.insert(entry(4)).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, ProcError::ChildPoolFull { capacity: 2 }));
        assert!(reg.check_lists());
    }

    #[test]
    fn test_remove_from_middle() {
        let mut reg = ChildRegistry::new(4);
        for pid in [2, 3, 4] {
            reg.insert(entry(pid)).unwrap();
        }

        let removed = reg.remove(reg.find(3).unwrap()).unwrap();
        assert_eq!(removed.pid, 3);
        assert_eq!(reg.active_count(), 2);
        assert!(reg.find(3).is_none());
        assert!(reg.check_lists());

        let mut pids: Vec<_> = reg.iter().map(|e| e.pid).collect();
        pids.sort();
        assert_eq!(pids, vec![2, 4]);
    }

    #[test]
    fn test_slots_recycled() {
        let mut reg = ChildRegistry::new(1);
        for pid in 2..10 {
            reg.insert(entry(pid)).unwrap();
            let removed = reg.remove(reg.find(pid).unwrap()).unwrap();
            assert_eq!(removed.pid, pid);
            assert!(reg.check_lists());
        }
        assert_eq!(reg.active_count(), 0);
    }

    #[test]
    fn test_find_terminated() {
        let mut reg = ChildRegistry::new(4);
        let a = entry(2);
        let b = entry(3);
        let a_term = a.termination.clone();
        reg.insert(a).unwrap();
        reg.insert(b).unwrap();

        assert!(reg.find_terminated().is_none());
        a_term.mark_exited(0);
        let cursor = reg.find_terminated().unwrap();
        assert_eq!(reg.get(cursor).unwrap().pid, 2);
    }
}
