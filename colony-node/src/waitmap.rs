//! Keyed rendezvous between message handlers and orchestration phases.
//!
//! A writer publishes a value under a key; any number of readers may block
//! until it appears. The head parks on `request_id/peer_id` keys while
//! waiting for formation acks and execution results; workers park on the
//! bare request id while draining a cluster.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

struct Inner<K, V> {
    values: HashMap<K, V>,
    /// Insertion order of settled keys, for FIFO eviction.
    order: VecDeque<K>,
    waiters: HashMap<K, Vec<oneshot::Sender<V>>>,
}

/// Concurrent map with rendezvous semantics. A waiter that starts before
/// the corresponding `set` is woken with the first value published under
/// its key; later readers observe the last write. With a non-zero
/// capacity the map evicts the oldest settled entries; in-flight waiters
/// are handed the value directly and are unaffected by eviction.
pub struct WaitMap<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
}

impl<K, V> WaitMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// A capacity of zero means the map never evicts.
    pub fn new(capacity: usize) -> Self {
        WaitMap {
            inner: Mutex::new(Inner {
                values: HashMap::new(),
                order: VecDeque::new(),
                waiters: HashMap::new(),
            }),
            capacity,
        }
    }

    /// Publish `value` under `key`, waking every parked waiter.
    pub fn set(&self, key: K, value: V) {
        let mut inner = self.inner.lock().expect("waitmap lock poisoned");

        if let Some(waiters) = inner.waiters.remove(&key) {
            for waiter in waiters {
                // A dropped receiver just means the waiter gave up.
                let _ = waiter.send(value.clone());
            }
        }

        if !inner.values.contains_key(&key) {
            inner.order.push_back(key.clone());
        }
        inner.values.insert(key, value);

        if self.capacity > 0 {
            while inner.values.len() > self.capacity {
                match inner.order.pop_front() {
                    Some(oldest) => {
                        inner.values.remove(&oldest);
                    }
                    None => break,
                }
            }
        }
    }

    /// Non-blocking read of the current value.
    pub fn get(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock().expect("waitmap lock poisoned");
        inner.values.get(key).cloned()
    }

    /// Block until `key` is set or the deadline passes. Returns `None` on
    /// timeout; the map itself is unaffected by cancelled waits.
    pub async fn wait_for(&self, key: K, deadline: Duration) -> Option<V> {
        let rx = {
            let mut inner = self.inner.lock().expect("waitmap lock poisoned");
            if let Some(value) = inner.values.get(&key) {
                return Some(value.clone());
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.entry(key).or_default().push(tx);
            rx
        };

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(value)) => Some(value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn get_returns_only_set_values() {
        let map: WaitMap<String, u32> = WaitMap::new(0);
        assert_eq!(map.get(&"a".to_string()), None);

        map.set("a".to_string(), 7);
        assert_eq!(map.get(&"a".to_string()), Some(7));
    }

    #[tokio::test]
    async fn waiter_started_before_set_is_woken() {
        let map: Arc<WaitMap<String, u32>> = Arc::new(WaitMap::new(0));

        let waiter = {
            let map = Arc::clone(&map);
            tokio::spawn(async move { map.wait_for("k".to_string(), Duration::from_secs(5)).await })
        };

        tokio::task::yield_now().await;
        map.set("k".to_string(), 42);

        assert_eq!(waiter.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn late_waiter_observes_already_set_value() {
        let map: WaitMap<String, u32> = WaitMap::new(0);
        map.set("k".to_string(), 1);

        // The hook may fire before anyone starts waiting; the wait must
        // still resolve immediately.
        assert_eq!(
            map.wait_for("k".to_string(), Duration::from_millis(10)).await,
            Some(1)
        );
    }

    #[tokio::test]
    async fn concurrent_waiters_all_observe_the_first_value() {
        let map: Arc<WaitMap<String, u32>> = Arc::new(WaitMap::new(0));

        let mut waiters = Vec::new();
        for _ in 0..8 {
            let map = Arc::clone(&map);
            waiters.push(tokio::spawn(async move {
                map.wait_for("k".to_string(), Duration::from_secs(5)).await
            }));
        }

        tokio::task::yield_now().await;
        map.set("k".to_string(), 9);
        map.set("k".to_string(), 10);

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Some(9));
        }
        // Later readers see the last write.
        assert_eq!(map.get(&"k".to_string()), Some(10));
    }

    #[tokio::test]
    async fn wait_times_out_when_never_set() {
        let map: WaitMap<String, u32> = WaitMap::new(0);
        assert_eq!(
            map.wait_for("k".to_string(), Duration::from_millis(20)).await,
            None
        );
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_entries() {
        let map: WaitMap<String, u32> = WaitMap::new(2);
        map.set("a".to_string(), 1);
        map.set("b".to_string(), 2);
        map.set("c".to_string(), 3);

        assert_eq!(map.get(&"a".to_string()), None);
        assert_eq!(map.get(&"b".to_string()), Some(2));
        assert_eq!(map.get(&"c".to_string()), Some(3));
    }

    #[tokio::test]
    async fn overwrite_does_not_grow_eviction_order() {
        let map: WaitMap<String, u32> = WaitMap::new(2);
        map.set("a".to_string(), 1);
        map.set("a".to_string(), 2);
        map.set("b".to_string(), 3);

        // "a" was written twice but occupies one slot.
        assert_eq!(map.get(&"a".to_string()), Some(2));
        assert_eq!(map.get(&"b".to_string()), Some(3));
    }
}
