//! Cancelable snapshot streams.
//!
//! A [`Subscription`] is a blocking iterator over full snapshots pushed by a
//! producer (a backend watch, the auth state, a fixed list of values). Each
//! subscription owns an [`Unsubscribe`] handle that releases the producer
//! side; cancelling is idempotent and also happens on drop.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

type CancelFn = Box<dyn FnOnce() + Send>;

/// Releases whatever keeps a producer alive. Runs at most once.
#[must_use = "dropping an Unsubscribe cancels it immediately"]
pub struct Unsubscribe {
    cancel: Option<CancelFn>,
}

impl Unsubscribe {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Combines several handles into one that releases all of them.
    pub fn join(parts: Vec<Unsubscribe>) -> Self {
        Self::new(move || {
            for mut part in parts {
                part.call();
            }
        })
    }

    pub fn call(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn is_spent(&self) -> bool {
        self.cancel.is_none()
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.call();
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("spent", &self.is_spent())
            .finish()
    }
}

#[derive(Debug)]
pub struct Subscription<T> {
    rx: Receiver<T>,
    unsubscribe: Unsubscribe,
    cancelled: bool,
    ended: bool,
}

impl<T> Subscription<T> {
    pub fn new(rx: Receiver<T>, unsubscribe: Unsubscribe) -> Self {
        Self {
            rx,
            unsubscribe,
            cancelled: false,
            ended: false,
        }
    }

    /// A finished stream that yields `values` and then ends.
    pub fn from_values(values: impl IntoIterator<Item = T>) -> Self {
        let (tx, rx) = mpsc::channel();
        for value in values {
            // The receiver is alive until this function returns.
            let _ = tx.send(value);
        }
        Self::new(rx, Unsubscribe::noop())
    }

    pub fn once(value: T) -> Self {
        Self::from_values([value])
    }

    /// Blocks for the next snapshot. `None` once cancelled or when the
    /// producer has gone away.
    pub fn recv(&mut self) -> Option<T> {
        if self.cancelled {
            return None;
        }
        let value = self.rx.recv().ok();
        self.ended = value.is_none();
        value
    }

    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<T> {
        if self.cancelled {
            return None;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Some(value),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.ended = true;
                None
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        if self.cancelled {
            return None;
        }
        match self.rx.try_recv() {
            Ok(value) => Some(value),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.ended = true;
                None
            }
        }
    }

    /// Drains queued snapshots and keeps the newest.
    pub fn latest(&mut self) -> Option<T> {
        let mut last = None;
        while let Some(value) = self.try_recv() {
            last = Some(value);
        }
        last
    }

    pub fn cancel(&mut self) {
        if !self.cancelled {
            trace!("cancelling subscription");
        }
        self.cancelled = true;
        self.unsubscribe.call();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// True once nothing more can arrive: cancelled, or the producer is
    /// gone and the queue was found empty.
    pub fn is_ended(&self) -> bool {
        self.cancelled || self.ended
    }
}

impl<T> Iterator for Subscription<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.recv()
    }
}

struct Listener<T> {
    id: u64,
    tx: Sender<T>,
}

/// Fan-out of state changes to any number of subscribers. Every new
/// subscriber first receives the current state.
pub struct Broadcast<T> {
    listeners: Arc<Mutex<Vec<Listener<T>>>>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> Broadcast<T> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, current: T) -> Subscription<T> {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(current);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push(Listener { id, tx });

        let listeners = Arc::downgrade(&self.listeners);
        let unsubscribe = Unsubscribe::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.lock().retain(|listener| listener.id != id);
            }
        });
        Subscription::new(rx, unsubscribe)
    }

    pub fn publish(&self, value: &T) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|listener| listener.tx.send(value.clone()).is_ok());
        trace!(listeners = listeners.len(), "published state change");
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl<T: Clone + Send + 'static> Default for Broadcast<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Broadcast<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcast")
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    use super::{Broadcast, Subscription, Unsubscribe};

    #[test]
    fn unsubscribe_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut handle = Unsubscribe::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.call();
        handle.call();
        drop(handle);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_subscription_cancels_producer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (_tx, rx) = mpsc::channel::<u8>();
        let sub = Subscription::new(
            rx,
            Unsubscribe::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_subscription_delivers_nothing() {
        let (tx, rx) = mpsc::channel();
        let mut sub = Subscription::new(rx, Unsubscribe::noop());
        tx.send(1).expect("send");
        sub.cancel();
        sub.cancel();
        tx.send(2).expect("receiver still alive");
        assert!(sub.is_cancelled());
        assert_eq!(sub.try_recv(), None);
        assert_eq!(sub.recv_timeout(Duration::from_millis(10)), None);
        assert_eq!(sub.recv(), None);
    }

    #[test]
    fn fixed_values_end_the_stream() {
        let sub = Subscription::from_values(vec![1, 2, 3]);
        assert_eq!(sub.collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn ended_only_after_the_queue_is_empty() {
        let (tx, rx) = mpsc::channel();
        let mut sub = Subscription::new(rx, Unsubscribe::noop());
        tx.send(1).expect("send");
        drop(tx);

        assert!(!sub.is_ended());
        assert_eq!(sub.recv_timeout(Duration::from_millis(10)), Some(1));
        assert!(!sub.is_ended());
        assert_eq!(sub.recv_timeout(Duration::from_millis(10)), None);
        assert!(sub.is_ended());
    }

    #[test]
    fn timeout_is_not_the_end() {
        let (_tx, rx) = mpsc::channel::<u8>();
        let mut sub = Subscription::new(rx, Unsubscribe::noop());
        assert_eq!(sub.recv_timeout(Duration::from_millis(5)), None);
        assert!(!sub.is_ended());
        sub.cancel();
        assert!(sub.is_ended());
    }

    #[test]
    fn latest_keeps_newest() {
        let mut sub = Subscription::from_values(vec!["a", "b", "c"]);
        assert_eq!(sub.latest(), Some("c"));
        assert_eq!(sub.latest(), None);
    }

    #[test]
    fn broadcast_sends_current_then_changes() {
        let hub = Broadcast::new();
        let mut first = hub.subscribe(0);
        hub.publish(&1);
        let mut second = hub.subscribe(1);
        hub.publish(&2);

        assert_eq!(first.try_recv(), Some(0));
        assert_eq!(first.try_recv(), Some(1));
        assert_eq!(first.try_recv(), Some(2));
        assert_eq!(second.try_recv(), Some(1));
        assert_eq!(second.try_recv(), Some(2));

        first.cancel();
        assert_eq!(hub.listener_count(), 1);
        drop(second);
        assert_eq!(hub.listener_count(), 0);
    }
}
