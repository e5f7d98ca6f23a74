// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Signalling Primitives
//!
//! Error reporting is best effort: producers offer into a bounded queue and the
//! value is dropped when the queue is full, so a caller that stops draining
//! never stalls the client or its workers. Cancellation is a latched flag that
//! any number of callers can raise without blocking.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

/// Capacity of every error stream.
pub const ERRORS_CAPACITY: usize = 100;

/// Receiving end of a stream owned by the client or one of its registrations.
///
/// The stream is shared: concurrent receivers each get distinct values.
pub struct Mailbox<T> {
    rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
}

impl<T> Mailbox<T> {
    /// Waits for the next value.
    ///
    /// Returns `None` only once every sender is gone, which does not happen
    /// while the owner of the stream is alive.
    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    /// Returns the next value if one is ready.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

pub(crate) fn mailbox<T>(capacity: usize) -> (mpsc::Sender<T>, Mailbox<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        tx,
        Mailbox {
            rx: tokio::sync::Mutex::new(rx),
        },
    )
}

/// Offers `value` without waiting; drops it when the queue is full.
///
/// Returns whether the value was queued.
pub(crate) fn offer<T>(tx: &mpsc::Sender<T>, value: T) -> bool {
    tx.try_send(value).is_ok()
}

/// Latched cancellation flag.
#[derive(Clone)]
pub(crate) struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        CancelSignal { tx: Arc::new(tx) }
    }

    /// Raises the flag. Idempotent and never blocks.
    pub(crate) fn cancel(&self) -> bool {
        self.tx.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        })
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is raised.
    pub(crate) async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Task handle of the worker bound to a registration.
///
/// The slot remembers the connection generation the worker was spawned for,
/// so a registration is served at most once per connection.
#[derive(Default)]
pub(crate) struct WorkerSlot {
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl WorkerSlot {
    pub(crate) fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Binds the slot to `generation` and stores the task returned by `spawn`,
    /// if any.
    ///
    /// The worker of an older generation is never interrupted: its handle is
    /// passed to `spawn` so the new worker can wait for it to finish the
    /// handoff in progress. A registration thus runs at most one worker at a
    /// time. When `spawn` returns `None` the old worker runs to its end alone.
    pub(crate) fn rebind<F>(&self, generation: u64, spawn: F)
    where
        F: FnOnce(Option<JoinHandle<()>>) -> Option<JoinHandle<()>>,
    {
        let mut state = self.state.lock();

        let previous = state.task.take().filter(|task| !task.is_finished());

        state.generation = generation;
        state.task = spawn(previous);
    }

    /// Whether a worker task is currently running.
    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.state
            .lock()
            .task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn offer_drops_when_full() {
        let (tx, inbox) = mailbox::<u32>(ERRORS_CAPACITY);

        for i in 0..ERRORS_CAPACITY as u32 {
            assert!(offer(&tx, i));
        }
        assert!(!offer(&tx, 999));

        assert_eq!(inbox.recv().await, Some(0));
        assert!(offer(&tx, 1000));
    }

    #[tokio::test]
    async fn try_recv_does_not_wait() {
        let (tx, inbox) = mailbox::<&str>(1);

        assert_eq!(inbox.try_recv(), None);
        offer(&tx, "first");
        assert_eq!(inbox.try_recv(), Some("first"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cancels_never_block() {
        let signal = CancelSignal::new();

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let signal = signal.clone();
                tokio::spawn(async move {
                    signal.cancel();
                })
            })
            .collect();

        for task in tasks {
            tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .expect("cancel blocked")
                .unwrap();
        }

        assert!(signal.is_cancelled());
        assert!(!signal.cancel());
    }

    #[tokio::test]
    async fn cancelled_resolves_for_late_waiters() {
        let signal = CancelSignal::new();
        signal.cancel();

        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("latched cancellation should resolve immediately");
    }

    #[tokio::test]
    async fn rebinding_hands_the_previous_worker_over() {
        let slot = WorkerSlot::default();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        slot.rebind(1, |previous| {
            assert!(previous.is_none());
            Some(tokio::spawn(async move {
                let _ = release_rx.await;
            }))
        });
        assert!(slot.is_running());
        assert_eq!(slot.generation(), 1);

        let mut handed_over = None;
        slot.rebind(2, |previous| {
            handed_over = previous;
            None
        });
        assert!(!slot.is_running());
        assert_eq!(slot.generation(), 2);

        let previous = handed_over.expect("running worker not handed over");
        assert!(!previous.is_finished(), "previous worker was interrupted");
        release_tx.send(()).unwrap();
        previous.await.unwrap();
    }
}
