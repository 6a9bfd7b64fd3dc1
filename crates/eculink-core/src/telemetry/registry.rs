//! Sensor registry
//!
//! Pub-sub hub for live channel values. The poller publishes here;
//! consumers subscribe per channel and receive every published value.
//! Callbacks run outside the registry lock, so a listener may freely call
//! back into the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Callback invoked with each published value of a channel
pub type SensorCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Subscription handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    channel: String,
    callback: SensorCallback,
}

struct RegistryInner {
    values: HashMap<String, f64>,
    listeners: Vec<Listener>,
    next_id: u64,
}

/// Thread-safe hub of the latest channel values and their subscribers
pub struct SensorRegistry {
    inner: Mutex<RegistryInner>,
}

impl SensorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                values: HashMap::new(),
                listeners: Vec::new(),
                next_id: 0,
            }),
        }
    }

    /// Publish `value` for `channel` and notify its subscribers
    pub fn publish(&self, channel: &str, value: f64) {
        let callbacks: Vec<SensorCallback> = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.values.insert(channel.to_string(), value);
            inner
                .listeners
                .iter()
                .filter(|l| l.channel == channel)
                .map(|l| l.callback.clone())
                .collect()
        };
        for callback in callbacks {
            callback(value);
        }
    }

    /// The most recently published value of `channel`
    pub fn latest(&self, channel: &str) -> Option<f64> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values
            .get(channel)
            .copied()
    }

    /// Subscribe to every future value of `channel`
    pub fn subscribe(&self, channel: impl Into<String>, callback: SensorCallback) -> ListenerId {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner.listeners.push(Listener {
            id,
            channel: channel.into(),
            callback,
        });
        id
    }

    /// Remove a subscription; unknown ids are ignored
    pub fn unsubscribe(&self, id: ListenerId) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.listeners.retain(|l| l.id != id);
    }
}

impl Default for SensorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_publish_notifies_channel_subscribers_only() {
        let registry = SensorRegistry::new();
        let rpm_count = Arc::new(AtomicU32::new(0));

        let counter = rpm_count.clone();
        registry.subscribe(
            "rpm",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        registry.publish("rpm", 800.0);
        registry.publish("coolant", 90.0);

        assert_eq!(rpm_count.load(Ordering::SeqCst), 1);
        assert_eq!(registry.latest("rpm"), Some(800.0));
        assert_eq!(registry.latest("coolant"), Some(90.0));
        assert_eq!(registry.latest("afr"), None);
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let registry = SensorRegistry::new();
        let count = Arc::new(AtomicU32::new(0));

        let counter = count.clone();
        let id = registry.subscribe(
            "rpm",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        registry.publish("rpm", 1000.0);
        registry.unsubscribe(id);
        registry.publish("rpm", 2000.0);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_may_read_registry() {
        let registry = Arc::new(SensorRegistry::new());
        let seen = Arc::new(Mutex::new(None));

        let registry_handle = registry.clone();
        let seen_handle = seen.clone();
        registry.subscribe(
            "rpm",
            Arc::new(move |value| {
                // Reading back while being notified must not deadlock
                let stored = registry_handle.latest("rpm");
                *seen_handle.lock().unwrap() = Some((value, stored));
            }),
        );

        registry.publish("rpm", 1500.0);

        assert_eq!(*seen.lock().unwrap(), Some((1500.0, Some(1500.0))));
    }
}
