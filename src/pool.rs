//! A general purpose resource pool.
//!
//! The pool is a bookkeeping structure: it decides which resource a caller
//! should reuse, open, close or wait for, but never performs I/O itself.
//! Every public operation runs as one atomic critical section under the
//! pool mutex and returns *intents* for the caller to execute outside the
//! lock. This keeps the suspension points (opening sockets, closing them,
//! awaiting a waiter) entirely in caller code.

use std::{
    collections::VecDeque,
    error::Error as StdError,
    fmt::{self, Debug},
    hash::Hash,
    sync::{Mutex, MutexGuard},
};

use tokio::sync::oneshot;
use tracing::trace;

/// Pool keys must be cheaply clonable and hashable-equality comparable.
pub trait Key: Eq + Hash + Clone + Debug + Send + 'static {}

impl<T> Key for T where T: Eq + Hash + Clone + Debug + Send + 'static {}

/// A slot handed out by the pool.
///
/// A freshly opened slot carries no value; the caller populates it after
/// performing the actual open. Ownership transfers to the caller on
/// checkout and back to the pool on `put`, so a resource is never in the
/// idle set and in a caller's hands at the same time.
pub struct Resource<K, T> {
    key: K,
    value: Option<T>,
}

impl<K: Key, T> Resource<K, T> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn value_mut(&mut self) -> Option<&mut T> {
        self.value.as_mut()
    }

    pub fn set_value(&mut self, value: T) {
        self.value = Some(value);
    }

    pub fn take_value(&mut self) -> Option<T> {
        self.value.take()
    }
}

impl<K: Key, T> Debug for Resource<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("key", &self.key)
            .field("open", &self.value.is_some())
            .finish()
    }
}

/// What a waiter eventually receives.
pub enum Ready<K, T> {
    /// An idle resource to reuse.
    Idle(Resource<K, T>),
    /// A fresh slot the receiver must open.
    Open(Resource<K, T>),
}

impl<K, T> Ready<K, T> {
    pub fn into_resource(self) -> Resource<K, T> {
        match self {
            Ready::Idle(res) | Ready::Open(res) => res,
        }
    }
}

/// The sending half a `put` may hand back for the caller to deliver.
pub type WaiterTx<K, T> = oneshot::Sender<Ready<K, T>>;

/// The receiving half of a pool waiter.
///
/// Single assignment: resolved at most once, either with a resource or,
/// when the pool closes, by dropping the sender.
pub struct Waiter<K, T> {
    rx: oneshot::Receiver<Ready<K, T>>,
}

impl<K, T> Waiter<K, T> {
    /// Await resolution. Fails with [`Error::Closed`] when the pool shut
    /// down before this waiter was served.
    pub async fn recv(self) -> Result<Ready<K, T>, Error> {
        self.rx.await.map_err(|_| Error::Closed)
    }
}

/// Outcome of [`Pool::get`].
pub enum Acquire<K, T> {
    /// Reuse this idle resource.
    Idle(Resource<K, T>),
    /// Open this fresh slot; `evict` is an idle resource from another key
    /// that must be closed to stay within the global cap.
    Open {
        open: Resource<K, T>,
        evict: Option<Resource<K, T>>,
    },
    /// The pool is saturated; await the waiter.
    Wait(Waiter<K, T>),
}

/// Outcome of [`Pool::put`]. The caller must close `close` (if any) and
/// deliver `notify` by sending the prepared value on the sender.
pub struct PutOutcome<K, T> {
    pub close: Option<Resource<K, T>>,
    pub notify: Option<(WaiterTx<K, T>, Ready<K, T>)>,
}

impl<K, T> PutOutcome<K, T> {
    fn empty() -> Self {
        PutOutcome {
            close: None,
            notify: None,
        }
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The pool was closed; no further checkouts are possible.
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Closed => f.write_str("pool is closed"),
        }
    }
}

impl StdError for Error {}

struct Bucket<K, T> {
    key: K,
    /// Idle resources, oldest first. Reuse pops from the back (most
    /// recently used), eviction takes from the front.
    idle: Vec<Resource<K, T>>,
    /// Resources currently checked out under this key.
    busy: usize,
    /// FIFO waiters for this key.
    waiters: VecDeque<WaiterTx<K, T>>,
}

impl<K, T> Bucket<K, T> {
    fn size(&self) -> usize {
        self.idle.len() + self.busy
    }

    /// Pop the oldest waiter whose receiver is still alive.
    fn pop_live_waiter(&mut self) -> Option<WaiterTx<K, T>> {
        while let Some(tx) = self.waiters.pop_front() {
            if !tx.is_closed() {
                return Some(tx);
            }
            trace!("pool: removing canceled waiter");
        }
        None
    }
}

struct PoolInner<K, T> {
    /// Buckets in key insertion order. Buckets are never removed, which
    /// keeps cross-key scans deterministic.
    buckets: Vec<Bucket<K, T>>,
    closed: bool,
    num_idle: usize,
    num_total: usize,
}

impl<K: Key, T> PoolInner<K, T> {
    fn bucket_index(&mut self, key: &K) -> usize {
        if let Some(idx) = self.buckets.iter().position(|b| &b.key == key) {
            return idx;
        }
        self.buckets.push(Bucket {
            key: key.clone(),
            idle: Vec::new(),
            busy: 0,
            waiters: VecDeque::new(),
        });
        self.buckets.len() - 1
    }

    /// Evict the oldest idle resource of the first key (in insertion
    /// order) that has one.
    fn evict_an_idle(&mut self) -> Option<Resource<K, T>> {
        for bucket in self.buckets.iter_mut() {
            if !bucket.idle.is_empty() {
                self.num_idle -= 1;
                self.num_total -= 1;
                return Some(bucket.idle.remove(0));
            }
        }
        None
    }

    /// Try to admit a new resource for the bucket at `idx`, evicting an
    /// idle resource from elsewhere when only the global cap is in the
    /// way. Returns `None` when the caller has to wait.
    fn open_if_permitted(
        &mut self,
        idx: usize,
        max_per_key: usize,
        max_total: usize,
    ) -> Option<(Resource<K, T>, Option<Resource<K, T>>)> {
        let can_open_key = self.buckets[idx].size() < max_per_key;
        if !can_open_key {
            return None;
        }
        let evicted = if self.num_total < max_total {
            None
        } else if self.num_idle > 0 {
            match self.evict_an_idle() {
                Some(evicted) => {
                    debug_assert!(
                        self.num_total < max_total,
                        "pool full after evicting an idle resource"
                    );
                    Some(evicted)
                }
                None => return None,
            }
        } else {
            return None;
        };
        let bucket = &mut self.buckets[idx];
        let open = Resource {
            key: bucket.key.clone(),
            value: None,
        };
        bucket.busy += 1;
        self.num_total += 1;
        Some((open, evicted))
    }
}

/// A bounded pool with per-key and global caps.
pub struct Pool<K, T> {
    max_per_key: usize,
    max_total: usize,
    inner: Mutex<PoolInner<K, T>>,
}

impl<K: Key, T> Pool<K, T> {
    pub fn new(max_per_key: usize, max_total: usize) -> Pool<K, T> {
        Pool {
            max_per_key,
            max_total,
            inner: Mutex::new(PoolInner {
                buckets: Vec::new(),
                closed: false,
                num_idle: 0,
                num_total: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner<K, T>> {
        // a poisoned pool mutex only means a panic elsewhere; the
        // bookkeeping itself is still consistent
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of idle resources.
    pub fn num_idle(&self) -> usize {
        self.lock().num_idle
    }

    /// Number of checked out resources.
    pub fn num_busy(&self) -> usize {
        let inner = self.lock();
        inner.num_total - inner.num_idle
    }

    /// Number of resources in total.
    pub fn num_total(&self) -> usize {
        self.lock().num_total
    }

    /// Number of resources under `key`, idle and busy.
    pub fn size(&self, key: &K) -> usize {
        let mut inner = self.lock();
        let idx = inner.bucket_index(key);
        inner.buckets[idx].size()
    }

    /// Acquire a resource for `key`.
    ///
    /// Preference order: reuse the most recently idled resource for the
    /// key, then open a new one (evicting a foreign idle resource when
    /// only the global cap blocks), otherwise enqueue a waiter.
    pub fn get(&self, key: &K) -> Result<Acquire<K, T>, Error> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(Error::Closed);
        }
        let idx = inner.bucket_index(key);

        if let Some(resource) = inner.buckets[idx].idle.pop() {
            inner.buckets[idx].busy += 1;
            inner.num_idle -= 1;
            trace!(key = ?key, "pool: reuse idle resource");
            return Ok(Acquire::Idle(resource));
        }

        match inner.open_if_permitted(idx, self.max_per_key, self.max_total) {
            Some((open, evict)) => {
                trace!(key = ?key, evict = evict.is_some(), "pool: admit new resource");
                Ok(Acquire::Open { open, evict })
            }
            None => {
                let (tx, rx) = oneshot::channel();
                inner.buckets[idx].waiters.push_back(tx);
                trace!(key = ?key, "pool: saturated, enqueue waiter");
                Ok(Acquire::Wait(Waiter { rx }))
            }
        }
    }

    /// Return a resource.
    ///
    /// With `close`, the resource leaves the pool and comes back as a
    /// close intent. Otherwise it is handed to the oldest waiter on the
    /// same key, or parked idle. Either way, at most one waiter across
    /// all keys (scanned in insertion order) is woken per put.
    pub fn put(&self, resource: Resource<K, T>, close: bool) -> PutOutcome<K, T> {
        let mut inner = self.lock();
        let mut ret = PutOutcome::empty();
        if inner.closed {
            ret.close = Some(resource);
            return ret;
        }

        let idx = inner.bucket_index(&resource.key);
        debug_assert!(inner.buckets[idx].busy > 0, "put of a resource not checked out");
        inner.buckets[idx].busy = inner.buckets[idx].busy.saturating_sub(1);

        if !close {
            if let Some(tx) = inner.buckets[idx].pop_live_waiter() {
                // hand over directly, the resource stays busy
                inner.buckets[idx].busy += 1;
                trace!(key = ?resource.key, "pool: handing returned resource to waiter");
                ret.notify = Some((tx, Ready::Idle(resource)));
                return ret;
            }
            trace!(key = ?resource.key, "pool: parking idle resource");
            inner.buckets[idx].idle.push(resource);
            inner.num_idle += 1;
        } else {
            trace!(key = ?resource.key, "pool: closing returned resource");
            ret.close = Some(resource);
            inner.num_total -= 1;
        }

        // the freed budget may unblock a waiter on another key
        for j in 0..inner.buckets.len() {
            if inner.buckets[j].waiters.iter().all(|tx| tx.is_closed()) {
                continue;
            }
            if let Some((open, evict)) = inner.open_if_permitted(j, self.max_per_key, self.max_total)
            {
                match inner.buckets[j].pop_live_waiter() {
                    Some(tx) => {
                        debug_assert!(
                            ret.close.is_none() || evict.is_none(),
                            "would close two resources at once"
                        );
                        if evict.is_some() {
                            ret.close = evict;
                        }
                        trace!(key = ?open.key, "pool: waking waiter with open slot");
                        ret.notify = Some((tx, Ready::Open(open)));
                    }
                    None => {
                        // every waiter vanished between the scan and the
                        // pop; undo the reservation
                        inner.buckets[j].busy -= 1;
                        inner.num_total -= 1;
                        if let Some(evicted) = evict {
                            let key = evicted.key().clone();
                            let idx = inner.bucket_index(&key);
                            inner.buckets[idx].idle.insert(0, evicted);
                            inner.num_idle += 1;
                            inner.num_total += 1;
                        }
                        continue;
                    }
                }
                break;
            }
        }

        ret
    }

    /// Close the pool.
    ///
    /// Returns the idle resources for the caller to close and the waiter
    /// senders to drop, which fails every outstanding waiter. Resources
    /// currently checked out are closed on their next `put`; with
    /// `force` their accounting is discarded immediately.
    pub fn close(&self, force: bool) -> (Vec<Resource<K, T>>, Vec<WaiterTx<K, T>>) {
        let mut inner = self.lock();
        inner.closed = true;

        let mut need_close = Vec::with_capacity(inner.num_idle);
        let mut waiters = Vec::new();
        for bucket in inner.buckets.iter_mut() {
            waiters.extend(bucket.waiters.drain(..));
            need_close.append(&mut bucket.idle);
            if force {
                bucket.busy = 0;
            }
        }
        inner.num_idle = 0;
        inner.num_total = inner.buckets.iter().map(|b| b.busy).sum();
        trace!(
            closing = need_close.len(),
            failing = waiters.len(),
            force,
            "pool: closed"
        );
        (need_close, waiters)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl<K: Key, T> Debug for Pool<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Pool")
            .field("idle", &inner.num_idle)
            .field("total", &inner.num_total)
            .field("closed", &inner.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max_per_key: usize, max_total: usize) -> Pool<&'static str, u32> {
        Pool::new(max_per_key, max_total)
    }

    fn open_with(pool: &Pool<&'static str, u32>, key: &'static str, value: u32) -> Resource<&'static str, u32> {
        match pool.get(&key).unwrap() {
            Acquire::Open { mut open, evict } => {
                assert!(evict.is_none());
                open.set_value(value);
                open
            }
            _ => panic!("expected an open intent for {key}"),
        }
    }

    #[test]
    fn idle_reuse_is_lifo() {
        let pool = pool(10, 10);
        let a1 = open_with(&pool, "a", 1);
        let a2 = open_with(&pool, "a", 2);
        assert_eq!(pool.num_total(), 2);

        assert!(pool.put(a1, false).notify.is_none());
        assert!(pool.put(a2, false).notify.is_none());
        assert_eq!(pool.num_idle(), 2);

        // most recently returned resource comes back first
        match pool.get(&"a").unwrap() {
            Acquire::Idle(res) => assert_eq!(res.value().copied(), Some(2)),
            _ => panic!("expected idle reuse"),
        }
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(pool.num_busy(), 1);
    }

    #[tokio::test]
    async fn wait_and_notify_same_key() {
        let pool = pool(10, 1);
        let a = open_with(&pool, "a", 7);
        assert_eq!(pool.num_total(), 1);

        let waiter = match pool.get(&"a").unwrap() {
            Acquire::Wait(w) => w,
            _ => panic!("expected wait"),
        };

        let outcome = pool.put(a, false);
        assert!(outcome.close.is_none());
        let (tx, ready) = outcome.notify.expect("waiter must be notified");
        tx.send(ready).ok().expect("receiver alive");

        match waiter.recv().await.unwrap() {
            Ready::Idle(res) => assert_eq!(res.value().copied(), Some(7)),
            Ready::Open(_) => panic!("expected the returned resource"),
        }
        assert_eq!(pool.num_total(), 1);
        assert_eq!(pool.num_idle(), 0);
    }

    #[tokio::test]
    async fn wait_and_notify_across_keys() {
        let pool = pool(2, 2);
        let _a = open_with(&pool, "a", 1);
        let b = open_with(&pool, "b", 2);
        assert_eq!(pool.num_busy(), 2);
        assert_eq!(pool.size(&"a"), 1);
        assert_eq!(pool.size(&"b"), 1);

        let waiter = match pool.get(&"a").unwrap() {
            Acquire::Wait(w) => w,
            _ => panic!("expected wait"),
        };

        // closing b frees global budget for a second a
        let outcome = pool.put(b, true);
        let closed = outcome.close.expect("b must close");
        assert_eq!(*closed.key(), "b");
        let (tx, ready) = outcome.notify.expect("a waiter must wake");
        tx.send(ready).ok().expect("receiver alive");

        match waiter.recv().await.unwrap() {
            Ready::Open(res) => assert_eq!(*res.key(), "a"),
            Ready::Idle(_) => panic!("expected a fresh slot"),
        }
        assert_eq!(pool.num_total(), 2);
        assert_eq!(pool.size(&"a"), 2);
        assert_eq!(pool.size(&"b"), 0);
    }

    #[tokio::test]
    async fn release_evicts_foreign_idle_for_waiter() {
        let pool = pool(2, 2);
        let _a = open_with(&pool, "a", 1);
        let b = open_with(&pool, "b", 2);

        let waiter = match pool.get(&"a").unwrap() {
            Acquire::Wait(w) => w,
            _ => panic!("expected wait"),
        };

        // releasing b parks it idle, then the scan evicts it to admit a
        let outcome = pool.put(b, false);
        let evicted = outcome.close.expect("idle b evicted for a");
        assert_eq!(*evicted.key(), "b");
        let (tx, ready) = outcome.notify.expect("a waiter woken");
        tx.send(ready).ok().expect("receiver alive");

        match waiter.recv().await.unwrap() {
            Ready::Open(res) => assert_eq!(*res.key(), "a"),
            Ready::Idle(_) => panic!("expected a fresh slot"),
        }
        assert_eq!(pool.num_total(), 2);
        assert_eq!(pool.num_idle(), 0);
    }

    #[tokio::test]
    async fn waiters_are_fifo_per_key() {
        let pool = pool(10, 1);
        let a = open_with(&pool, "a", 1);

        let w1 = match pool.get(&"a").unwrap() {
            Acquire::Wait(w) => w,
            _ => panic!(),
        };
        let w2 = match pool.get(&"a").unwrap() {
            Acquire::Wait(w) => w,
            _ => panic!(),
        };

        let outcome = pool.put(a, false);
        let (tx, ready) = outcome.notify.unwrap();
        tx.send(ready).ok().unwrap();
        let first = waiter_value(w1.recv().await.unwrap());

        // w1 got it; returning it again serves w2
        let outcome = pool.put(first, false);
        let (tx, ready) = outcome.notify.unwrap();
        tx.send(ready).ok().unwrap();
        waiter_value(w2.recv().await.unwrap());
    }

    fn waiter_value(ready: Ready<&'static str, u32>) -> Resource<&'static str, u32> {
        match ready {
            Ready::Idle(res) => res,
            Ready::Open(res) => res,
        }
    }

    #[test]
    fn canceled_waiter_is_skipped() {
        let pool = pool(10, 1);
        let a = open_with(&pool, "a", 1);

        let w1 = match pool.get(&"a").unwrap() {
            Acquire::Wait(w) => w,
            _ => panic!(),
        };
        drop(w1);

        // no live waiter: the resource parks idle instead
        let outcome = pool.put(a, false);
        assert!(outcome.notify.is_none());
        assert_eq!(pool.num_idle(), 1);
    }

    #[test]
    fn put_after_close_returns_close_intent() {
        let pool = pool(10, 10);
        let a = open_with(&pool, "a", 1);
        let (need_close, waiters) = pool.close(false);
        assert!(need_close.is_empty());
        assert!(waiters.is_empty());

        let outcome = pool.put(a, false);
        assert!(outcome.close.is_some());
        assert!(outcome.notify.is_none());
        assert!(matches!(pool.get(&"a"), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn close_drains_idle_and_fails_waiters() {
        let pool = pool(1, 3);
        let a = open_with(&pool, "a", 1);
        pool.put(a, false);
        let _b = open_with(&pool, "b", 2);
        let _c = open_with(&pool, "c", 3);
        // key b is at its per-key cap, so this must wait
        let waiter = match pool.get(&"b").unwrap() {
            Acquire::Wait(w) => w,
            _ => panic!(),
        };

        assert_eq!(pool.num_idle(), 1);
        assert_eq!(pool.num_total(), 3);

        let (need_close, waiters) = pool.close(true);
        assert_eq!(need_close.len(), 1);
        assert_eq!(waiters.len(), 1);
        drop(waiters);
        assert!(matches!(waiter.recv().await, Err(Error::Closed)));
        assert_eq!(pool.num_total(), 0);
    }

    #[test]
    fn counters_stay_consistent() {
        let pool = pool(2, 4);
        let a1 = open_with(&pool, "a", 1);
        let a2 = open_with(&pool, "a", 2);
        let b1 = open_with(&pool, "b", 3);
        assert_eq!(pool.num_total(), 3);
        assert_eq!(pool.num_idle() + pool.num_busy(), pool.num_total());

        pool.put(a1, false);
        pool.put(b1, true);
        assert_eq!(pool.num_total(), 2);
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(pool.num_busy(), 1);
        assert_eq!(pool.size(&"a"), 2);
        assert_eq!(pool.size(&"b"), 0);

        pool.put(a2, false);
        assert_eq!(pool.num_idle(), 2);
        assert_eq!(pool.num_busy(), 0);
    }
}
