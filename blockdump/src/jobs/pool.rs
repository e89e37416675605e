use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::model::JobKind;

/// Bounded set of worker slots for one job kind.
///
/// Jobs take a [`Ticket`] synchronously when they are submitted; a freed
/// slot goes to the oldest ticket still waiting, so jobs start in
/// submission order no matter when their tasks first get polled.
pub struct WorkerPool {
    kind: JobKind,
    size: usize,
    slots: Arc<Slots>,
}

struct Slots {
    state: Mutex<SlotState>,
}

struct SlotState {
    free: usize,
    waiters: VecDeque<oneshot::Sender<Slot>>,
    closed: bool,
}

/// A taken slot; dropping it hands the slot to the next waiter.
pub struct Slot {
    slots: Option<Arc<Slots>>,
}

/// Place in a pool's admission queue.
pub enum Ticket {
    Ready(Slot),
    Waiting(oneshot::Receiver<Slot>),
    Closed,
}

impl Slots {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(self: &Arc<Self>) {
        loop {
            let waiter = {
                let mut state = self.lock();
                match state.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        state.free += 1;
                        return;
                    }
                }
            };
            // Sent outside the lock: a refused slot must not release re-entrantly.
            match waiter.send(Slot {
                slots: Some(self.clone()),
            }) {
                Ok(()) => return,
                Err(mut refused) => {
                    refused.slots = None;
                }
            }
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.take() {
            slots.release();
        }
    }
}

impl Ticket {
    /// Wait for the slot; `None` if `cancel` fires first or the pool closed.
    pub async fn wait(self, cancel: &CancellationToken) -> Option<Slot> {
        match self {
            Ticket::Ready(slot) if !cancel.is_cancelled() => Some(slot),
            Ticket::Ready(_) | Ticket::Closed => None,
            Ticket::Waiting(rx) => tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                slot = rx => slot.ok(),
            },
        }
    }
}

impl WorkerPool {
    pub fn new(kind: JobKind, size: usize) -> Self {
        let size = size.max(1);
        Self {
            kind,
            size,
            slots: Arc::new(Slots {
                state: Mutex::new(SlotState {
                    free: size,
                    waiters: VecDeque::new(),
                    closed: false,
                }),
            }),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.slots.lock().free
    }

    /// Join the admission queue.
    pub fn enqueue(&self) -> Ticket {
        let mut state = self.slots.lock();
        if state.closed {
            return Ticket::Closed;
        }
        if state.free > 0 && state.waiters.is_empty() {
            state.free -= 1;
            return Ticket::Ready(Slot {
                slots: Some(self.slots.clone()),
            });
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        Ticket::Waiting(rx)
    }

    /// Queue and wait in one step.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<Slot> {
        self.enqueue().wait(cancel).await
    }

    /// Refuse all further admissions and wake every waiter empty-handed.
    pub fn close(&self) {
        let waiters = {
            let mut state = self.slots.lock();
            state.closed = true;
            std::mem::take(&mut state.waiters)
        };
        drop(waiters);
    }
}
