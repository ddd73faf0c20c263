//! Transfer completion queues.
//!
//! Completion callbacks run at low level; the controller reports
//! completions at dispatch. The completion queue bridges the two: the
//! dispatch side appends under a spinlock and queues the sweep worker on
//! the empty-to-nonempty edge, and the worker drains at low level.

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use spin::Mutex;

use crate::platform::{KernelServices, WorkItem};
use crate::transfer::{TransferState, UsbTransfer};

pub struct CompletionQueue {
    self_ref: Weak<CompletionQueue>,
    list: Mutex<VecDeque<Arc<UsbTransfer>>>,
    /// Paging queues run their worker on the private paging work queue
    /// so completion never waits behind the page-cache path.
    paging: bool,
}

impl CompletionQueue {
    pub(crate) fn new(paging: bool) -> Arc<CompletionQueue> {
        Arc::new_cyclic(|weak| CompletionQueue {
            self_ref: weak.clone(),
            list: Mutex::new(VecDeque::new()),
            paging,
        })
    }

    /// Append a completed transfer. Dispatch-safe. Queues the worker iff
    /// the list was empty; otherwise the running worker will sweep the
    /// new entry before declaring the queue empty.
    pub(crate) fn insert(&self, transfer: Arc<UsbTransfer>, services: &Arc<dyn KernelServices>) {
        let was_empty = {
            let mut list = self.list.lock();
            let was_empty = list.is_empty();
            list.push_back(transfer);
            was_empty
        };
        if was_empty {
            let item: Arc<dyn WorkItem> = match self.self_ref.upgrade() {
                Some(queue) => queue,
                None => return,
            };
            if self.paging {
                services.queue_paging_work(item);
            } else {
                services.queue_work(item);
            }
        }
    }

    /// Drain the list and invoke callbacks. Runs at low level; never
    /// concurrently with itself (the work-queue contract).
    fn sweep(&self) {
        loop {
            let mut local = {
                let mut list = self.list.lock();
                if list.is_empty() {
                    break;
                }
                core::mem::take(&mut *list)
            };
            for transfer in local.drain(..) {
                if !transfer
                    .state
                    .try_transition(TransferState::Active, TransferState::InCallback)
                {
                    panic!(
                        "usb: transfer {:p} swept while {:?}",
                        Arc::as_ptr(&transfer),
                        transfer.state()
                    );
                }
                if let Some(callback) = transfer.callback() {
                    callback(&transfer);
                }
                // Loses to a resubmission made from within the callback,
                // which is exactly what leaves the transfer armed.
                transfer
                    .state
                    .try_transition(TransferState::InCallback, TransferState::Inactive);
                // Dropping the Arc releases the submission reference.
            }
        }
    }
}

impl WorkItem for CompletionQueue {
    fn run(&self) {
        self.sweep();
    }
}

/// The process-wide paging completion queue, published race-free by
/// compare-exchange. The winner's pointer holds one strong count; losers
/// free their candidate.
static PAGING_QUEUE: AtomicPtr<CompletionQueue> = AtomicPtr::new(ptr::null_mut());

pub(crate) fn paging_queue() -> Arc<CompletionQueue> {
    let existing = PAGING_QUEUE.load(Ordering::Acquire);
    if !existing.is_null() {
        unsafe {
            Arc::increment_strong_count(existing);
            return Arc::from_raw(existing);
        }
    }
    let candidate = CompletionQueue::new(true);
    let raw = Arc::into_raw(candidate) as *mut CompletionQueue;
    match PAGING_QUEUE.compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
    {
        Ok(_) => unsafe {
            Arc::increment_strong_count(raw);
            Arc::from_raw(raw)
        },
        Err(winner) => unsafe {
            drop(Arc::from_raw(raw));
            Arc::increment_strong_count(winner);
            Arc::from_raw(winner)
        },
    }
}

/// Drop the paging queue as part of subsystem teardown.
pub(crate) fn teardown_paging_queue() {
    let raw = PAGING_QUEUE.swap(ptr::null_mut(), Ordering::AcqRel);
    if !raw.is_null() {
        unsafe { drop(Arc::from_raw(raw)) };
    }
}
