use alloc::{sync::Arc, vec::Vec};
use core::{
    cell::UnsafeCell,
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    task::{Context, Poll},
};

use futures::task::AtomicWaker;

use crate::{FrameResult, TransferError, backend::uhci::transfer::Completion};

/// What a control, bulk or interrupt transfer reports: its status and the
/// number of bytes it did not move.
pub type TransferOutcome = (Result<(), TransferError>, u32);
pub type IsochOutcome = (Result<(), TransferError>, Vec<FrameResult>);

struct Slot<C> {
    finished: AtomicBool,
    waker: AtomicWaker,
    data: UnsafeCell<Option<C>>,
}

unsafe impl<C: Send> Send for Slot<C> {}
unsafe impl<C: Send> Sync for Slot<C> {}

impl<C> Slot<C> {
    fn new() -> Self {
        Self {
            finished: AtomicBool::new(false),
            waker: AtomicWaker::new(),
            data: UnsafeCell::new(None),
        }
    }

    fn set(&self, value: C) {
        // Only the completion writes, and it runs once.
        unsafe { *self.data.get() = Some(value) };
        self.finished.store(true, Ordering::Release);
        self.waker.wake();
    }

    fn take(&self) -> Option<C> {
        if !self.finished.swap(false, Ordering::AcqRel) {
            return None;
        }
        unsafe { (*self.data.get()).take() }
    }
}

/// Future resolving once the paired completion has fired.
pub struct TransferWaiter<C> {
    slot: Arc<Slot<C>>,
}

impl<C> TransferWaiter<C> {
    /// Non-blocking check, for pollers that do not run an executor.
    pub fn try_take(&mut self) -> Option<C> {
        self.slot.take()
    }
}

impl<C> Future for TransferWaiter<C> {
    type Output = C;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(res) = this.slot.take() {
            return Poll::Ready(res);
        }
        this.slot.waker.register(cx.waker());
        // Completed between the check and the registration.
        if let Some(res) = this.slot.take() {
            return Poll::Ready(res);
        }
        Poll::Pending
    }
}

/// A completion callback and the future that observes it.
pub fn completion_waiter() -> (Completion, TransferWaiter<TransferOutcome>) {
    let slot = Arc::new(Slot::new());
    let writer = slot.clone();
    let completion = Completion::new(move |status, remaining| writer.set((status, remaining)));
    (completion, TransferWaiter { slot })
}

pub fn isoch_waiter() -> (Completion, TransferWaiter<IsochOutcome>) {
    let slot = Arc::new(Slot::new());
    let writer = slot.clone();
    let completion = Completion::isoch(move |status, frames| writer.set((status, frames.to_vec())));
    (completion, TransferWaiter { slot })
}
