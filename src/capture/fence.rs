//! In-flight readback queue.
//!
//! Every issued readback is queued with its fence in submission order. The
//! render thread retires entries from the front: a retired slot is marked
//! ready and handed to the streaming workers.
//!
//! Retirement stops at the first unsignaled fence. This assumes the GPU
//! completes readbacks in submission order, which holds for a single queue.

use std::collections::VecDeque;

use super::pool::{Slot, SlotState};
use crate::error::PipelineResult;
use crate::gpu::{GpuBackend, ReadbackBuffer};

/// How hard `retire` tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retire {
    /// Only retire fences that have already signaled.
    Poll,
    /// Block on the oldest fence, then poll the rest.
    WaitFirst,
    /// Block on every fence.
    WaitAll,
}

impl Retire {
    fn blocks_on(self, index: usize) -> bool {
        match self {
            Retire::Poll => false,
            Retire::WaitFirst => index == 0,
            Retire::WaitAll => true,
        }
    }
}

/// Submission-ordered queue of `(slot, fence)` pairs.
pub struct FenceTracker<R, F> {
    pending: VecDeque<(Slot<R>, F)>,
}

impl<R: ReadbackBuffer, F> FenceTracker<R, F> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(capacity),
        }
    }

    pub fn track(&mut self, slot: Slot<R>, fence: F) {
        self.pending.push_back((slot, fence));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Retire signaled readbacks from the front of the queue.
    ///
    /// Each retired slot is marked ready and passed to `ready` in submission
    /// order. Returns how many slots were retired.
    pub fn retire<B>(
        &mut self,
        backend: &B,
        mode: Retire,
        mut ready: impl FnMut(Slot<R>) -> PipelineResult<()>,
    ) -> PipelineResult<usize>
    where
        B: GpuBackend<Buffer = R, Fence = F>,
    {
        let mut retired = 0;

        while let Some((_, fence)) = self.pending.front() {
            if mode.blocks_on(retired) {
                backend.wait(fence)?;
            } else if !backend.is_signaled(fence)? {
                break;
            }

            let Some((slot, _fence)) = self.pending.pop_front() else {
                break;
            };
            slot.set_state(SlotState::ReadyForConversion);
            ready(slot)?;
            retired += 1;
        }

        if retired > 0 {
            log::trace!(
                "[CAPTURE] Retired {} readbacks ({:?}), {} in flight",
                retired,
                mode,
                self.pending.len()
            );
        }
        Ok(retired)
    }
}
