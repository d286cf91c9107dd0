use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Single-slot coalescing mailbox: a send replaces whatever is still waiting.
///
/// The playback controller consumes through this so that only the most recent
/// state update is ever processed; an update that was superseded before the
/// consumer got to it is dropped, not queued.
pub struct Mailbox<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    notify: Notify,
}

struct Slot<T> {
    value: Option<T>,
    closed: bool,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Mailbox {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Mailbox {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    value: None,
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Replaces the pending value, if any. Never blocks. Returns whether a
    /// pending value was displaced.
    pub fn send(&self, value: T) -> bool {
        let mut slot = self.inner.slot.lock().unwrap();
        if slot.closed {
            return false;
        }
        let displaced = slot.value.replace(value).is_some();
        drop(slot);
        self.inner.notify.notify_one();
        displaced
    }

    /// Waits for the next value. Returns `None` once the mailbox is closed
    /// and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            {
                let mut slot = self.inner.slot.lock().unwrap();
                if let Some(value) = slot.value.take() {
                    return Some(value);
                }
                if slot.closed {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.inner.slot.lock().unwrap().closed = true;
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }
}
