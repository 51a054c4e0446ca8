//! Admission control
//!
//! Bounds how many captures run at once. Requests that can't start right away
//! wait in per-[`FairnessKey`] FIFO buckets; whenever a slot frees up the next
//! request is taken from a bucket chosen uniformly at random among the
//! non-empty ones, so a requester flooding the queue only ever holds one
//! bucket's share of the draws.

use crate::{CaptureError, FairnessKey};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct QueueState {
    running: usize,
    queued: usize,
    next_id: u64,
    closed: bool,
    buckets: HashMap<FairnessKey, VecDeque<Waiter>>,
    /// Keys with a non-empty bucket, for O(1) uniform picks.
    active: Vec<FairnessKey>,
    positions: HashMap<FairnessKey, usize>,
}

impl QueueState {
    fn push(&mut self, key: FairnessKey, waiter: Waiter) {
        if !self.positions.contains_key(&key) {
            self.positions.insert(key.clone(), self.active.len());
            self.active.push(key.clone());
        }
        self.buckets.entry(key).or_default().push_back(waiter);
        self.queued += 1;
    }

    fn deactivate(&mut self, key: &FairnessKey) {
        self.buckets.remove(key);
        if let Some(index) = self.positions.remove(key) {
            self.active.swap_remove(index);
            if let Some(moved) = self.active.get(index) {
                self.positions.insert(moved.clone(), index);
            }
        }
    }

    /// Remove a still-queued waiter; `false` if it was already dispatched.
    fn remove(&mut self, key: &FairnessKey, id: u64) -> bool {
        let Some(bucket) = self.buckets.get_mut(key) else {
            return false;
        };
        let Some(index) = bucket.iter().position(|w| w.id == id) else {
            return false;
        };
        bucket.remove(index);
        let emptied = bucket.is_empty();
        if emptied {
            self.deactivate(key);
        }
        self.queued -= 1;
        true
    }

    fn pop_next<R: Rng>(&mut self, rng: &mut R) -> Option<Waiter> {
        if self.active.is_empty() {
            return None;
        }
        let key = self.active[rng.gen_range(0..self.active.len())].clone();
        let bucket = self.buckets.get_mut(&key)?;
        let waiter = bucket.pop_front();
        if bucket.is_empty() {
            self.deactivate(&key);
        }
        if waiter.is_some() {
            self.queued -= 1;
        }
        waiter
    }

    /// Hand free slots to queued waiters.
    fn dispatch(&mut self, capacity: usize) {
        let mut rng = rand::thread_rng();
        while self.running < capacity {
            let Some(waiter) = self.pop_next(&mut rng) else {
                break;
            };
            // a closed receiver means its ticket is gone already
            if waiter.tx.send(()).is_ok() {
                self.running += 1;
            }
        }
    }
}

/// Counting gate in front of the capture pipeline
pub struct AdmissionQueue {
    capacity: usize,
    state: Mutex<QueueState>,
}

impl AdmissionQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Requests waiting for admission.
    pub fn size(&self) -> usize {
        self.lock().queued
    }

    /// Requests currently admitted.
    pub fn running(&self) -> usize {
        self.lock().running
    }

    /// Wait for a slot, at most `wait`.
    ///
    /// The returned permit frees the slot when dropped. Cancelling this future
    /// withdraws the request from its bucket.
    pub async fn admit(
        self: &Arc<Self>,
        key: FairnessKey,
        wait: Duration,
    ) -> Result<AdmissionPermit, CaptureError> {
        let (id, rx) = {
            let mut state = self.lock();
            if state.closed {
                return Err(CaptureError::EngineUnavailable);
            }
            if state.running < self.capacity && state.queued == 0 {
                state.running += 1;
                return Ok(AdmissionPermit::new(self.clone()));
            }

            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.push(key.clone(), Waiter { id, tx });
            debug!(fairness_key = %key, queued = state.queued, "capture queued");
            (id, rx)
        };

        let mut ticket = AdmissionTicket {
            queue: self.clone(),
            key,
            id,
            rx,
            settled: false,
        };

        match tokio::time::timeout(wait, &mut ticket.rx).await {
            Ok(Ok(())) => {
                ticket.settled = true;
                Ok(AdmissionPermit::new(self.clone()))
            }
            Ok(Err(_)) => {
                ticket.settled = true;
                Err(CaptureError::EngineUnavailable)
            }
            Err(_) => Err(CaptureError::QueueTimeout(wait)),
        }
    }

    fn release(&self) {
        let mut state = self.lock();
        state.running = state.running.saturating_sub(1);
        state.dispatch(self.capacity);
    }

    /// Reject every queued and future request.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.buckets.clear();
        state.active.clear();
        state.positions.clear();
        state.queued = 0;
    }
}

/// A queued request; withdraws itself from the queue if abandoned
struct AdmissionTicket {
    queue: Arc<AdmissionQueue>,
    key: FairnessKey,
    id: u64,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.queue.lock();
        if state.remove(&self.key, self.id) {
            return;
        }
        // dispatched between the timeout firing and this drop: give the slot back
        if self.rx.try_recv().is_ok() {
            state.running = state.running.saturating_sub(1);
            state.dispatch(self.queue.capacity);
        }
    }
}

/// Proof of admission; the slot is released on drop
pub struct AdmissionPermit {
    queue: Arc<AdmissionQueue>,
}

impl AdmissionPermit {
    fn new(queue: Arc<AdmissionQueue>) -> Self {
        Self { queue }
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("capacity", &self.queue.capacity)
            .finish()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.queue.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio_test::{assert_pending, assert_ready, task};

    const WAIT: Duration = Duration::from_secs(60);

    fn key(name: &str) -> FairnessKey {
        FairnessKey::new(name)
    }

    #[tokio::test]
    async fn test_admits_up_to_capacity() {
        let queue = AdmissionQueue::new(2);
        let a = queue.admit(key("a"), WAIT).await.unwrap();
        let _b = queue.admit(key("a"), WAIT).await.unwrap();
        assert_eq!(queue.running(), 2);
        assert_eq!(queue.size(), 0);

        drop(a);
        assert_eq!(queue.running(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_admitted_on_release() {
        let queue = AdmissionQueue::new(1);
        let first = queue.admit(key("a"), WAIT).await.unwrap();

        let q = queue.clone();
        let mut second = task::spawn(async move { q.admit(key("b"), WAIT).await });
        assert_pending!(second.poll());
        assert_eq!(queue.size(), 1);

        drop(first);
        assert!(second.is_woken());
        let permit = assert_ready!(second.poll()).unwrap();
        assert_eq!(queue.running(), 1);
        assert_eq!(queue.size(), 0);
        drop(permit);
        assert_eq!(queue.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout() {
        let queue = AdmissionQueue::new(1);
        let _held = queue.admit(key("a"), WAIT).await.unwrap();

        let err = queue
            .admit(key("a"), Duration::from_millis(100))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::QueueTimeout(_)));
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.running(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_is_fifo() {
        let queue = AdmissionQueue::new(1);
        let held = queue.admit(key("a"), WAIT).await.unwrap();

        let mut waiters: Vec<_> = (0..3)
            .map(|_| {
                let q = queue.clone();
                task::spawn(async move { q.admit(key("a"), WAIT).await })
            })
            .collect();
        for waiter in waiters.iter_mut() {
            assert_pending!(waiter.poll());
        }

        drop(held);
        for i in 0..3 {
            let permit = assert_ready!(waiters[i].poll()).unwrap();
            for later in waiters.iter_mut().skip(i + 1) {
                assert_pending!(later.poll());
            }
            drop(permit);
        }
        assert_eq!(queue.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_leaves_queue() {
        let queue = AdmissionQueue::new(1);
        let held = queue.admit(key("a"), WAIT).await.unwrap();

        let q = queue.clone();
        let mut waiter = task::spawn(async move { q.admit(key("b"), WAIT).await });
        assert_pending!(waiter.poll());
        assert_eq!(queue.size(), 1);

        drop(waiter);
        assert_eq!(queue.size(), 0);
        drop(held);
        assert_eq!(queue.running(), 0);
    }

    #[test]
    fn test_buckets_are_drawn_uniformly() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut solo_first = 0;
        for _ in 0..400 {
            let mut state = QueueState::default();
            let mut receivers = Vec::new();
            for id in 0..20 {
                let (tx, rx) = oneshot::channel();
                receivers.push(rx);
                state.push(key("bulk"), Waiter { id, tx });
            }
            let (tx, _rx) = oneshot::channel();
            state.push(key("solo"), Waiter { id: 99, tx });

            if state.pop_next(&mut rng).map(|w| w.id) == Some(99) {
                solo_first += 1;
            }
        }
        // one draw per bucket, not per waiter: close to half
        assert!((140..=260).contains(&solo_first), "solo won {solo_first}/400");
    }

    #[test]
    fn test_bucket_bookkeeping() {
        let mut state = QueueState::default();
        for (id, name) in ["a", "b", "c"].iter().enumerate() {
            let (tx, _rx) = oneshot::channel();
            state.push(key(name), Waiter { id: id as u64, tx });
        }
        assert_eq!(state.active.len(), 3);

        assert!(state.remove(&key("a"), 0));
        assert!(!state.remove(&key("a"), 0));
        assert_eq!(state.active.len(), 2);
        for (k, index) in &state.positions {
            assert_eq!(&state.active[*index], k);
        }
        assert_eq!(state.queued, 2);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects() {
        let queue = AdmissionQueue::new(1);
        queue.close();
        assert!(matches!(
            queue.admit(key("a"), WAIT).await,
            Err(CaptureError::EngineUnavailable)
        ));
    }
}
