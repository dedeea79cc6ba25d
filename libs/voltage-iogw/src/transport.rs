//! Outbound transport seam
//!
//! The broker client lives outside this crate. Sessions only need a way to
//! publish bytes on a topic; inbound frames are pushed in by the caller.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::TransportError;

/// Publishes command frames to the broker
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// In-memory publisher that records every frame
///
/// Used by tests and the offline `command` CLI path.
#[derive(Debug)]
pub struct MemoryPublisher {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    reject: Mutex<Option<String>>,
    /// Total accepted publishes
    total: watch::Sender<usize>,
}

impl Default for MemoryPublisher {
    fn default() -> Self {
        let (total, _) = watch::channel(0);
        Self {
            published: Mutex::new(Vec::new()),
            reject: Mutex::new(None),
            total,
        }
    }
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until at least `count` publishes have been accepted in total
    pub async fn wait_for(&self, count: usize) {
        let mut rx = self.total.subscribe();
        while *rx.borrow_and_update() < count {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Fail subsequent publishes with `reason`; `None` accepts again
    pub fn set_reject(&self, reason: Option<&str>) {
        *self.reject.lock() = reason.map(str::to_string);
    }

    /// Snapshot of published `(topic, payload)` pairs
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.published.lock().len()
    }

    /// Remove and return everything published so far
    pub fn take(&self) -> Vec<(String, Vec<u8>)> {
        std::mem::take(&mut *self.published.lock())
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if let Some(reason) = self.reject.lock().clone() {
            return Err(TransportError::new(topic, reason));
        }
        self.published.lock().push((topic.to_string(), payload));
        self.total.send_modify(|total| *total += 1);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_memory_publisher_records() {
        let publisher = Arc::new(MemoryPublisher::new());
        publisher.publish("gw/a/down", vec![1, 2]).await.unwrap();
        publisher.publish("gw/b/down", vec![3]).await.unwrap();

        assert_eq!(publisher.count(), 2);
        assert_eq!(publisher.published()[1], ("gw/b/down".to_string(), vec![3]));
        assert_eq!(publisher.take().len(), 2);
        assert_eq!(publisher.count(), 0);
        // Totals survive take()
        publisher.wait_for(2).await;
    }

    #[tokio::test]
    async fn test_memory_publisher_reject() {
        let publisher = MemoryPublisher::new();
        publisher.set_reject(Some("broker offline"));

        let err = publisher.publish("gw/a/down", vec![1]).await.unwrap_err();
        assert_eq!(err, TransportError::new("gw/a/down", "broker offline"));
        assert_eq!(publisher.count(), 0);

        publisher.set_reject(None);
        assert!(publisher.publish("gw/a/down", vec![1]).await.is_ok());
    }
}
