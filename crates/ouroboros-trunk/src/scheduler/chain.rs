//! Execution chain for scheduled entries
//!
//! Entries live in an arena of slots with stable indices; a singly linked
//! chain threaded through those indices orders them by `next_call_time`.
//! The arena itself is never sorted, only the chain, so slot indices held by
//! the chain stay valid across inserts and deletes.

use tracing::{debug, warn};

use super::entry::ScheduleEntry;

struct Slot {
    entry: ScheduleEntry,
    next: Option<usize>,
}

#[derive(Default)]
pub(crate) struct ScheduleChain {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    count: usize,
}

impl ScheduleChain {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Build a chain from entries whose `next_call_time` is already set
    pub(crate) fn with_entries(entries: Vec<ScheduleEntry>) -> Self {
        let mut chain = Self::new();
        chain.merge(entries);
        chain
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Earliest pending fire time
    pub(crate) fn head_time(&self) -> Option<i64> {
        self.head.map(|idx| self.slot(idx).entry.next_call_time)
    }

    /// Merge a batch: an entry whose id is already scheduled replaces it in
    /// place, anything else is appended. Returns `(added, replaced)`.
    pub(crate) fn merge(&mut self, entries: Vec<ScheduleEntry>) -> (usize, usize) {
        let mut added = 0;
        let mut replaced = 0;

        for entry in entries {
            match self.find(entry.id) {
                Some(idx) => {
                    self.slot_mut(idx).entry = entry;
                    replaced += 1;
                }
                None => {
                    self.insert(entry);
                    added += 1;
                }
            }
        }

        debug!("schedule add entries: {}, replace entries: {}", added, replaced);
        self.make_chain();
        (added, replaced)
    }

    /// Remove the entry with `id`, returning whether it was scheduled
    pub(crate) fn remove(&mut self, id: u32) -> bool {
        let Some(idx) = self.find(id) else {
            return false;
        };

        self.slots[idx] = None;
        self.free.push(idx);
        self.count -= 1;
        debug!("delete task id: {}, current schedule count: {}", id, self.count);

        self.make_chain();
        true
    }

    /// Ids in execution order
    pub(crate) fn ids_in_order(&self) -> Vec<u32> {
        let mut ids = Vec::with_capacity(self.count);
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let slot = self.slot(idx);
            ids.push(slot.entry.id);
            cursor = slot.next;
        }
        ids
    }

    pub(crate) fn next_call_time_of(&self, id: u32) -> Option<i64> {
        self.find(id).map(|idx| self.slot(idx).entry.next_call_time)
    }

    /// Run every entry due at `now` in chain order and re-thread the chain.
    ///
    /// `keep_going` is consulted before each task so a stop request is
    /// honoured between tasks. Returns the number of tasks executed.
    pub(crate) fn run_due(&mut self, now: i64, keep_going: impl Fn() -> bool) -> usize {
        let mut exec_count = 0;
        let mut cursor = self.head;

        while let Some(idx) = cursor {
            if !keep_going() {
                break;
            }
            let slot = self.slot_mut(idx);
            if slot.entry.next_call_time > now {
                break;
            }

            if let Err(e) = (slot.entry.task)() {
                warn!("Scheduled task {} failed: {}", slot.entry.id, e);
            }
            slot.entry.next_call_time = now + slot.entry.interval as i64;
            cursor = slot.next;
            exec_count += 1;
        }

        self.rethread(exec_count, cursor);
        exec_count
    }

    /// Restore chain order after the first `exec_count` nodes fired.
    ///
    /// `first_unfired` is the node the execution walk stopped at.
    fn rethread(&mut self, exec_count: usize, first_unfired: Option<usize>) {
        if exec_count == 0 || self.count == 1 {
            return;
        }

        if exec_count > self.count / 2 || first_unfired.is_none() {
            self.make_chain();
            return;
        }

        let mut node = self.head;
        self.head = first_unfired;

        for _ in 0..exec_count {
            let Some(idx) = node else { break };
            let saved_next = self.slot(idx).next;
            let time = self.slot(idx).entry.next_call_time;

            let tail = match self.tail {
                Some(tail) => tail,
                None => break,
            };
            if time >= self.slot(tail).entry.next_call_time {
                self.slot_mut(tail).next = Some(idx);
                self.slot_mut(idx).next = None;
                self.tail = Some(idx);
                node = saved_next;
                continue;
            }

            let mut previous = None;
            let mut until = self.head;
            while let Some(u) = until {
                if time <= self.slot(u).entry.next_call_time {
                    break;
                }
                previous = Some(u);
                until = self.slot(u).next;
            }

            match previous {
                None => self.head = Some(idx),
                Some(p) => self.slot_mut(p).next = Some(idx),
            }
            self.slot_mut(idx).next = until;
            node = saved_next;
        }
    }

    /// Full re-sort of the chain by `next_call_time`
    fn make_chain(&mut self) {
        let mut order: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|_| idx))
            .collect();
        order.sort_by_key(|&idx| self.slot(idx).entry.next_call_time);

        self.head = order.first().copied();
        self.tail = order.last().copied();
        for pair in order.windows(2) {
            self.slot_mut(pair[0]).next = Some(pair[1]);
        }
        if let Some(tail) = self.tail {
            self.slot_mut(tail).next = None;
        }
    }

    fn insert(&mut self, entry: ScheduleEntry) {
        let slot = Some(Slot { entry, next: None });
        match self.free.pop() {
            Some(idx) => self.slots[idx] = slot,
            None => self.slots.push(slot),
        }
        self.count += 1;
    }

    fn find(&self, id: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Some(s) if s.entry.id == id))
    }

    // Chain indices always point at occupied slots
    fn slot(&self, idx: usize) -> &Slot {
        match &self.slots[idx] {
            Some(slot) => slot,
            None => unreachable!("schedule chain references empty slot {}", idx),
        }
    }

    fn slot_mut(&mut self, idx: usize) -> &mut Slot {
        match &mut self.slots[idx] {
            Some(slot) => slot,
            None => unreachable!("schedule chain references empty slot {}", idx),
        }
    }
}
