//! Fixed pool of capture slots.
//!
//! A slot pairs one GPU readback region with a CPU conversion buffer. The pool
//! is allocated once at session start; slots then circulate between the render
//! thread, the in-flight fence queue and the streaming workers and are never
//! created or destroyed mid-session. Ownership of a [`Slot`] value is the
//! exclusive right to touch its buffers.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{PipelineError, PipelineResult};
use crate::gpu::ReadbackBuffer;

/// Where a slot is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Capturing,
    ReadyForConversion,
    Converting,
    Draining,
}

impl SlotState {
    fn can_advance_to(self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Free, Capturing)
                | (Capturing, ReadyForConversion)
                | (ReadyForConversion, Converting)
                | (ReadyForConversion, Draining)
                | (Converting, Draining)
                | (Draining, Free)
        )
    }
}

/// Number of slots in each state at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotCensus {
    pub free: usize,
    pub capturing: usize,
    pub ready: usize,
    pub converting: usize,
    pub draining: usize,
}

impl SlotCensus {
    pub fn total(&self) -> usize {
        self.free + self.capturing + self.ready + self.converting + self.draining
    }

    /// Slots that are not free.
    pub fn in_flight(&self) -> usize {
        self.total() - self.free
    }
}

/// Shared record of every slot's state.
#[derive(Debug)]
struct SlotLedger {
    states: Mutex<Vec<SlotState>>,
}

impl SlotLedger {
    fn new(count: usize) -> Self {
        Self {
            states: Mutex::new(vec![SlotState::Free; count]),
        }
    }

    fn transition(&self, id: usize, next: SlotState) {
        let mut states = self.states.lock();
        let current = states[id];
        if !current.can_advance_to(next) {
            log::error!(
                "[POOL] Illegal slot transition for slot {}: {:?} -> {:?}",
                id,
                current,
                next
            );
            debug_assert!(false, "illegal slot transition {:?} -> {:?}", current, next);
        }
        states[id] = next;
    }

    fn state(&self, id: usize) -> SlotState {
        self.states.lock()[id]
    }

    fn census(&self) -> SlotCensus {
        let states = self.states.lock();
        let mut census = SlotCensus::default();
        for state in states.iter() {
            match state {
                SlotState::Free => census.free += 1,
                SlotState::Capturing => census.capturing += 1,
                SlotState::ReadyForConversion => census.ready += 1,
                SlotState::Converting => census.converting += 1,
                SlotState::Draining => census.draining += 1,
            }
        }
        census
    }
}

/// One reusable capture slot.
pub struct Slot<R> {
    id: usize,
    readback: R,
    converted: Vec<u8>,
    ledger: Arc<SlotLedger>,
}

impl<R: ReadbackBuffer> Slot<R> {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> SlotState {
        self.ledger.state(self.id)
    }

    pub(crate) fn set_state(&self, next: SlotState) {
        self.ledger.transition(self.id, next);
    }

    pub fn readback(&self) -> &R {
        &self.readback
    }

    pub fn readback_mut(&mut self) -> &mut R {
        &mut self.readback
    }

    /// Readback region and conversion buffer, split for in-place conversion.
    pub fn buffers_mut(&mut self) -> (&R, &mut Vec<u8>) {
        (&self.readback, &mut self.converted)
    }

    pub fn converted(&self) -> &[u8] {
        &self.converted
    }
}

impl<R> std::fmt::Debug for Slot<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("converted_len", &self.converted.len())
            .finish()
    }
}

struct PoolState<R> {
    free: VecDeque<Slot<R>>,
    aborted: Option<String>,
}

/// Free-list of slots, shared between the render thread and the writer.
pub struct SlotPool<R> {
    state: Mutex<PoolState<R>>,
    available: Condvar,
    ledger: Arc<SlotLedger>,
    capacity: usize,
}

impl<R: ReadbackBuffer> SlotPool<R> {
    /// Build a pool from pre-allocated readback regions.
    ///
    /// `converted_size` is the size of the per-slot conversion buffer, zero
    /// when captured bytes are streamed as-is.
    pub fn new(readbacks: Vec<R>, converted_size: usize) -> Self {
        let capacity = readbacks.len();
        let ledger = Arc::new(SlotLedger::new(capacity));
        let free = readbacks
            .into_iter()
            .enumerate()
            .map(|(id, readback)| Slot {
                id,
                readback,
                converted: vec![0u8; converted_size],
                ledger: Arc::clone(&ledger),
            })
            .collect();

        log::debug!(
            "[POOL] Allocated {} slots ({} conversion bytes each)",
            capacity,
            converted_size
        );

        Self {
            state: Mutex::new(PoolState {
                free,
                aborted: None,
            }),
            available: Condvar::new(),
            ledger,
            capacity,
        }
    }

    /// Take a free slot, blocking until one is released.
    ///
    /// Fails once the pool has been aborted.
    pub fn acquire(&self) -> PipelineResult<Slot<R>> {
        let mut state = self.state.lock();
        loop {
            if let Some(reason) = &state.aborted {
                return Err(PipelineError::PipelineFailed(reason.clone()));
            }
            if let Some(slot) = state.free.pop_front() {
                slot.set_state(SlotState::Capturing);
                return Ok(slot);
            }
            log::trace!("[POOL] No free slot, waiting for the writer");
            self.available.wait(&mut state);
        }
    }

    /// Return a drained slot to the free list.
    pub fn release(&self, slot: Slot<R>) {
        slot.set_state(SlotState::Free);
        let mut state = self.state.lock();
        let was_empty = state.free.is_empty();
        state.free.push_back(slot);
        drop(state);

        if was_empty {
            self.available.notify_one();
        }
    }

    /// Wake every waiter and make further `acquire` calls fail.
    pub fn abort(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.aborted.is_none() {
            log::warn!("[POOL] Aborting slot pool: {}", reason);
            state.aborted = Some(reason.to_string());
        }
        drop(state);
        self.available.notify_all();
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn census(&self) -> SlotCensus {
        self.ledger.census()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Bytes(Vec<u8>);

    impl ReadbackBuffer for Bytes {
        fn with_bytes<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
            f(&self.0)
        }

        fn recycle(&mut self) {}
    }

    fn pool(count: usize) -> SlotPool<Bytes> {
        SlotPool::new((0..count).map(|_| Bytes::default()).collect(), 0)
    }

    /// Walk a slot through the full passthrough lifecycle.
    fn drain(pool: &SlotPool<Bytes>, slot: Slot<Bytes>) {
        slot.set_state(SlotState::ReadyForConversion);
        slot.set_state(SlotState::Draining);
        pool.release(slot);
    }

    #[test]
    fn test_acquire_hands_out_distinct_slots() {
        let pool = pool(3);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        let mut ids = vec![a.id(), b.id(), c.id()];
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.census().capturing, 3);
    }

    #[test]
    fn test_census_always_sums_to_capacity() {
        let pool = pool(4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        a.set_state(SlotState::ReadyForConversion);
        a.set_state(SlotState::Converting);
        b.set_state(SlotState::ReadyForConversion);

        let census = pool.census();
        assert_eq!(census.total(), 4);
        assert_eq!(census.free, 2);
        assert_eq!(census.converting, 1);
        assert_eq!(census.ready, 1);
        assert_eq!(census.in_flight(), 2);

        a.set_state(SlotState::Draining);
        pool.release(a);
        b.set_state(SlotState::Draining);
        pool.release(b);
        assert_eq!(pool.census().free, 4);
    }

    #[test]
    fn test_release_wakes_blocked_acquire() {
        let pool = Arc::new(pool(1));
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire().map(|slot| slot.id()))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        drain(&pool, held);
        assert_eq!(waiter.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_abort_fails_blocked_acquire() {
        let pool = Arc::new(pool(1));
        let _held = pool.acquire().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire().map(|slot| slot.id()))
        };

        thread::sleep(Duration::from_millis(20));
        pool.abort("encoder died");
        let err = waiter.join().unwrap().unwrap_err();
        assert!(err.to_string().contains("encoder died"));
    }

    #[test]
    fn test_conversion_buffers_are_preallocated() {
        let pool = SlotPool::new(vec![Bytes::default(), Bytes::default()], 16);
        let mut slot = pool.acquire().unwrap();
        assert_eq!(slot.converted().len(), 16);
        let (_, converted) = slot.buffers_mut();
        converted[0] = 9;
        assert_eq!(slot.converted()[0], 9);
    }
}
