//! The connection-slot table of the egress loop. All slots in one state
//! occupy a contiguous segment of a single id array, so a state change is
//! a handful of O(1) boundary swaps. The wait-for-connection segment sits
//! first and doubles as a min-heap on the time each slot entered it, which
//! is what lets the loop evict stalled peers eagerly.

use crate::egress::ConnectionId;
use crate::support::{PipeError, PipeResult};
use std::time::Instant;

pub const NUM_STATES: usize = 6;

/// Slot states, in segment order. `WaitConn` must stay first: its segment
/// carries the eviction heap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SlotState {
    WaitConn = 0,
    WaitData = 1,
    Ready = 2,
    Raising = 3,
    Error = 4,
    Finished = 5,
}

struct Entry<T> {
    payload: T,
    index: usize,
    wait_since: Instant,
}

pub struct SlotTable<T> {
    slots: Vec<Option<Entry<T>>>,
    list: Vec<ConnectionId>,
    limits: [usize; NUM_STATES],
}

impl<T> SlotTable<T> {
    pub fn new(capacity: usize) -> SlotTable<T> {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(None);
        }

        SlotTable {
            slots,
            list: Vec::with_capacity(capacity),
            limits: [0; NUM_STATES],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[inline]
    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.slots
            .get(conn as usize)
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    pub fn insert(&mut self, conn: ConnectionId, payload: T, state: SlotState, now: Instant) -> PipeResult<()> {
        if conn as usize >= self.slots.len() {
            return Err(PipeError::InvalidArgument);
        }
        if self.slots[conn as usize].is_some() {
            return Err(PipeError::InvalidArgument);
        }

        // New slots land at the tail of the last segment, then take the
        // regular transition path to their requested state.
        self.list.push(conn);
        self.limits[NUM_STATES - 1] += 1;
        self.slots[conn as usize] = Some(Entry {
            payload,
            index: self.list.len() - 1,
            wait_since: now,
        });

        self.set_state(conn, state, now)
    }

    pub fn remove(&mut self, conn: ConnectionId) -> Option<T> {
        if !self.contains(conn) {
            return None;
        }

        // Walk the slot to the last segment, swap it to the array tail and
        // pop it off.
        let now = self.slots[conn as usize].as_ref().map(|e| e.wait_since)?;
        self.set_state(conn, SlotState::Finished, now).ok()?;

        let index = self.slots[conn as usize].as_ref().map(|e| e.index)?;
        let last = self.list.len() - 1;
        self.swap(index, last);
        self.list.pop();
        self.limits[NUM_STATES - 1] -= 1;

        self.slots[conn as usize].take().map(|entry| entry.payload)
    }

    pub fn state_of(&self, conn: ConnectionId) -> Option<SlotState> {
        let index = self.slots.get(conn as usize)?.as_ref()?.index;
        Some(self.state_at(index))
    }

    fn state_at(&self, index: usize) -> SlotState {
        const STATES: [SlotState; NUM_STATES] = [
            SlotState::WaitConn,
            SlotState::WaitData,
            SlotState::Ready,
            SlotState::Raising,
            SlotState::Error,
            SlotState::Finished,
        ];

        for (state, &limit) in STATES.iter().zip(self.limits.iter()) {
            if index < limit {
                return *state;
            }
        }

        panic!("Slot index outside every segment");
    }

    #[inline]
    pub fn get_mut(&mut self, conn: ConnectionId) -> Option<&mut T> {
        self.slots
            .get_mut(conn as usize)?
            .as_mut()
            .map(|entry| &mut entry.payload)
    }

    /// The connection ids currently in a state. Copied out so the caller
    /// may transition slots while walking them.
    pub fn in_state(&self, state: SlotState) -> Vec<ConnectionId> {
        let segment = state as usize;
        let begin = if segment == 0 { 0 } else { self.limits[segment - 1] };

        self.list[begin..self.limits[segment]].to_vec()
    }

    /// Moves a slot to a new state with chained segment-boundary swaps.
    pub fn set_state(&mut self, conn: ConnectionId, state: SlotState, now: Instant) -> PipeResult<()> {
        let current = self.state_of(conn).ok_or(PipeError::InvalidArgument)?;

        if current == state {
            return Ok(());
        }

        if current == SlotState::WaitConn {
            self.heap_remove(conn);
        }

        let mut segment = current as usize;
        let target = state as usize;

        while segment < target {
            let index = self.index_of(conn);
            let end = self.limits[segment] - 1;
            self.swap(index, end);
            self.limits[segment] -= 1;
            segment += 1;
        }

        while segment > target {
            let index = self.index_of(conn);
            let begin = self.limits[segment - 1];
            self.swap(index, begin);
            self.limits[segment - 1] += 1;
            segment -= 1;
        }

        if state == SlotState::WaitConn {
            if let Some(entry) = self.slots[conn as usize].as_mut() {
                entry.wait_since = now;
            }
            let index = self.index_of(conn);
            self.sift_up(index);
        }

        Ok(())
    }

    /// The oldest slot waiting on the connection, if any.
    pub fn heap_root(&self) -> Option<(ConnectionId, Instant)> {
        if self.limits[0] == 0 {
            return None;
        }

        let conn = self.list[0];
        let since = self.slots[conn as usize].as_ref()?.wait_since;
        Some((conn, since))
    }

    fn index_of(&self, conn: ConnectionId) -> usize {
        self.slots[conn as usize]
            .as_ref()
            .expect("Slot disappeared mid-transition")
            .index
    }

    fn key_at(&self, index: usize) -> Instant {
        let conn = self.list[index];
        self.slots[conn as usize]
            .as_ref()
            .expect("Heap references a dead slot")
            .wait_since
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }

        self.list.swap(a, b);

        let conn_a = self.list[a];
        let conn_b = self.list[b];
        self.slots[conn_a as usize].as_mut().expect("Dead slot in list").index = a;
        self.slots[conn_b as usize].as_mut().expect("Dead slot in list").index = b;
    }

    fn heap_remove(&mut self, conn: ConnectionId) {
        let index = self.index_of(conn);
        let last = self.limits[0] - 1;

        if index != last {
            self.swap(index, last);
            self.sift_down(index, last);
            self.sift_up(index);
        }
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.key_at(index) < self.key_at(parent) {
                self.swap(index, parent);
                index = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut index: usize, len: usize) {
        loop {
            let left = index * 2 + 1;
            let right = index * 2 + 2;
            let mut smallest = index;

            if left < len && self.key_at(left) < self.key_at(smallest) {
                smallest = left;
            }
            if right < len && self.key_at(right) < self.key_at(smallest) {
                smallest = right;
            }

            if smallest == index {
                break;
            }

            self.swap(index, smallest);
            index = smallest;
        }
    }

    /// Structural self-check used by the tests: segments contiguous and
    /// ordered, indices consistent, heap property intact.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        let mut previous = 0;
        for &limit in self.limits.iter() {
            assert!(limit >= previous, "Segment limits must not decrease");
            previous = limit;
        }
        assert_eq!(self.limits[NUM_STATES - 1], self.list.len());

        for (index, &conn) in self.list.iter().enumerate() {
            let entry = self.slots[conn as usize].as_ref().expect("Dead slot in list");
            assert_eq!(entry.index, index, "Slot index out of sync");
        }

        for index in 1..self.limits[0] {
            let parent = (index - 1) / 2;
            assert!(
                self.key_at(parent) <= self.key_at(index),
                "Heap property violated"
            );
        }
    }
}
