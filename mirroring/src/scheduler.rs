//! Deferred callback scheduler.
//!
//! Callbacks are registered under an identifier with a delay, and can be
//! cancelled with that identifier any time before they fire. The watch
//! demultiplexer uses this to hold back "moved from" events until it is clear
//! whether a matching "moved to" will arrive.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BinaryHeap, HashMap},
    hash::Hash,
    sync::{Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

use crate::{Error, Result};

/// Runs registered callbacks after their delay, on a dedicated thread.
///
/// Each entry is identified by an opaque key which must be unique among the
/// currently pending entries; re-adding a pending key fails with
/// [`Error::DuplicateId`]. [`Scheduler::cancel`] removes a pending entry and
/// is a no-op for unknown keys. Entries with equal deadlines fire in the
/// order they were added.
pub struct Scheduler<K> {
    inner: Arc<Inner<K>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    wakeup: Condvar,
}

struct State<K> {
    heap: BinaryHeap<HeapEntry<K>>,
    pending: HashMap<K, Pending>,
    seq: u64,
    stopped: bool,
}

struct Pending {
    seq: u64,
    callback: Box<dyn FnOnce() + Send>,
}

/// Heap entry ordered so that the earliest deadline (then the lowest
/// sequence number) is at the top of the max-heap.
struct HeapEntry<K> {
    at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for HeapEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<K> Eq for HeapEntry<K> {}

impl<K> PartialOrd for HeapEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for HeapEntry<K> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

impl<K> Scheduler<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    /// Create a scheduler. No thread is spawned until [`Scheduler::start`].
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    heap: BinaryHeap::new(),
                    pending: HashMap::new(),
                    seq: 0,
                    stopped: false,
                }),
                wakeup: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Start the dispatch thread. Starting twice is a no-op.
    pub fn start(&self) {
        let mut thread = self.thread.lock().unwrap();
        if thread.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *thread = Some(thread::spawn(move || inner.run()));
    }

    /// Register `callback` to run after `delay`, keyed by `id`.
    ///
    /// The callback runs on the scheduler thread. Entries added while the
    /// scheduler sleeps towards a later deadline preempt that wait.
    pub fn add<F>(&self, delay: Duration, id: K, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        if state.pending.contains_key(&id) {
            return Err(Error::DuplicateId);
        }
        state.seq += 1;
        let seq = state.seq;
        state.heap.push(HeapEntry {
            at: Instant::now() + delay,
            seq,
            key: id.clone(),
        });
        state.pending.insert(
            id,
            Pending {
                seq,
                callback: Box::new(callback),
            },
        );
        self.inner.wakeup.notify_all();
        Ok(())
    }

    /// Cancel the pending entry for `id`, if any.
    pub fn cancel(&self, id: &K) {
        // The stale heap entry is discarded by the dispatch loop.
        self.inner.state.lock().unwrap().pending.remove(id);
    }

    /// Stop the dispatch thread and join it. Pending entries are dropped
    /// without firing. Safe to call more than once.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.stopped = true;
            self.inner.wakeup.notify_all();
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl<K> Inner<K>
where
    K: Clone + Eq + Hash,
{
    fn run(&self) {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.stopped {
                break;
            }
            let head = state
                .heap
                .peek()
                .map(|entry| (entry.at, entry.seq, entry.key.clone()));
            let (at, seq, key) = match head {
                Some(head) => head,
                None => {
                    state = self.wakeup.wait(state).unwrap();
                    continue;
                }
            };
            let live = state
                .pending
                .get(&key)
                .map(|p| p.seq == seq)
                .unwrap_or(false);
            if !live {
                // Cancelled, or cancelled and re-added with a new deadline.
                state.heap.pop();
                continue;
            }
            let now = Instant::now();
            if at > now {
                let (guard, _) = self.wakeup.wait_timeout(state, at - now).unwrap();
                state = guard;
                continue;
            }
            state.heap.pop();
            let entry = match state.pending.remove(&key) {
                Some(entry) => entry,
                None => continue,
            };
            drop(state);
            (entry.callback)();
            state = self.state.lock().unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::mpsc;

    fn scheduler() -> Scheduler<&'static str> {
        let scheduler = Scheduler::new();
        scheduler.start();
        scheduler
    }

    fn sender(tx: &mpsc::Sender<&'static str>, tag: &'static str) -> impl FnOnce() + Send {
        let tx = tx.clone();
        move || tx.send(tag).unwrap()
    }

    #[test]
    fn fires_after_delay() {
        let scheduler = scheduler();
        let (tx, rx) = mpsc::channel();
        scheduler
            .add(Duration::from_millis(50), "a", sender(&tx, "a"))
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "a");
        scheduler.stop();
    }

    #[test]
    fn fires_two_entries() {
        let scheduler = scheduler();
        let (tx, rx) = mpsc::channel();
        scheduler
            .add(Duration::from_millis(50), "a", sender(&tx, "a"))
            .unwrap();
        scheduler
            .add(Duration::from_millis(50), "b", sender(&tx, "b"))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "a");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "b");
        scheduler.stop();
    }

    #[test]
    fn cancel_prevents_firing() {
        let scheduler = scheduler();
        let (tx, rx) = mpsc::channel();
        scheduler
            .add(Duration::from_millis(50), "a", sender(&tx, "a"))
            .unwrap();
        scheduler.cancel(&"a");
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        scheduler.stop();
    }

    #[test]
    fn cancel_unknown_is_noop() {
        let scheduler = scheduler();
        scheduler.cancel(&"never-added");
        scheduler.stop();
    }

    #[test]
    fn cancels_one_of_two() {
        let scheduler = scheduler();
        let (tx, rx) = mpsc::channel();
        scheduler
            .add(Duration::from_millis(50), "keep", sender(&tx, "keep"))
            .unwrap();
        scheduler
            .add(Duration::from_millis(50), "drop", sender(&tx, "drop"))
            .unwrap();
        scheduler.cancel(&"drop");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "keep");
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        scheduler.stop();
    }

    #[test]
    fn shorter_delay_fires_first() {
        let scheduler = scheduler();
        let (tx, rx) = mpsc::channel();
        scheduler
            .add(Duration::from_millis(300), "late", sender(&tx, "late"))
            .unwrap();
        scheduler
            .add(Duration::from_millis(50), "early", sender(&tx, "early"))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "late");
        scheduler.stop();
    }

    #[test]
    fn equal_delays_fire_in_add_order() {
        let scheduler = scheduler();
        let (tx, rx) = mpsc::channel();
        scheduler
            .add(Duration::from_millis(100), "first", sender(&tx, "first"))
            .unwrap();
        scheduler
            .add(Duration::from_millis(100), "second", sender(&tx, "second"))
            .unwrap();
        scheduler
            .add(Duration::from_millis(100), "third", sender(&tx, "third"))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "first");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "second");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "third");
        scheduler.stop();
    }

    #[test]
    fn re_add_after_cancel() {
        let scheduler = scheduler();
        let (tx, rx) = mpsc::channel();
        scheduler
            .add(Duration::from_millis(500), "a", sender(&tx, "slow"))
            .unwrap();
        scheduler.cancel(&"a");
        scheduler
            .add(Duration::from_millis(50), "a", sender(&tx, "fast"))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "fast");
        assert!(rx.recv_timeout(Duration::from_millis(700)).is_err());
        scheduler.stop();
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let scheduler = scheduler();
        let (tx, rx) = mpsc::channel();
        scheduler
            .add(Duration::from_millis(50), "a", sender(&tx, "a"))
            .unwrap();
        let duplicate = scheduler.add(Duration::from_secs(10), "a", sender(&tx, "dup"));
        assert!(matches!(duplicate, Err(Error::DuplicateId)));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "a");
        scheduler.stop();
    }

    #[test]
    fn stop_drops_pending_entries() {
        let scheduler = scheduler();
        let (tx, rx) = mpsc::channel();
        scheduler
            .add(Duration::from_secs(30), "a", sender(&tx, "a"))
            .unwrap();
        scheduler.stop();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
