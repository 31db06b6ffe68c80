//! Serialized reply publication over one shared transport handle.
//!
//! Most bus clients forbid concurrent writes to one channel, so every publish
//! from every worker goes through a single async mutex. The handle is swapped
//! under the same lock when a connection is (re)established or closed.

use crate::bus::BusError;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::Mutex;

/// Where a reply goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyDestination {
    Amqp {
        exchange: String,
        routing_key: String,
        correlation_id: Option<String>,
    },
    Mqtt {
        topic: String,
    },
}

impl fmt::Display for ReplyDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Amqp {
                exchange,
                routing_key,
                ..
            } => write!(f, "amqp://{exchange}/{routing_key}"),
            Self::Mqtt { topic } => write!(f, "mqtt://{topic}"),
        }
    }
}

/// Transport seam for writing one encoded reply.
#[async_trait]
pub trait ReplyPublisher: Send + Sync {
    async fn publish(&self, payload: Vec<u8>, destination: &ReplyDestination) -> Result<(), BusError>;
}

pub struct ReplyChannel {
    name: String,
    publisher: Mutex<Option<Box<dyn ReplyPublisher>>>,
}

impl ReplyChannel {
    /// A channel with no transport attached yet.
    pub fn detached(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            publisher: Mutex::new(None),
        }
    }

    pub fn with_publisher(name: impl Into<String>, publisher: Box<dyn ReplyPublisher>) -> Self {
        Self {
            name: name.into(),
            publisher: Mutex::new(Some(publisher)),
        }
    }

    /// Install the handle for a freshly opened connection.
    pub async fn attach(&self, publisher: Box<dyn ReplyPublisher>) {
        *self.publisher.lock().await = Some(publisher);
    }

    /// Drop the handle; later publishes fail with [`BusError::NotConnected`].
    pub async fn detach(&self) {
        self.publisher.lock().await.take();
    }

    pub async fn is_attached(&self) -> bool {
        self.publisher.lock().await.is_some()
    }

    /// Publish one reply while holding the channel lock.
    pub async fn publish(&self, payload: Vec<u8>, destination: &ReplyDestination) -> Result<(), BusError> {
        let guard = self.publisher.lock().await;
        let Some(publisher) = guard.as_ref() else {
            return Err(BusError::NotConnected(self.name.clone()));
        };
        publisher.publish(payload, destination).await?;
        tracing::debug!(channel = %self.name, %destination, "Reply published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Probe {
        in_publish: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
        published: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ReplyPublisher for Probe {
        async fn publish(&self, _payload: Vec<u8>, _destination: &ReplyDestination) -> Result<(), BusError> {
            let now = self.in_publish.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.in_publish.fetch_sub(1, Ordering::SeqCst);
            self.published.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn topic() -> ReplyDestination {
        ReplyDestination::Mqtt {
            topic: "replies".into(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publishes_are_serialized() {
        let probe = Probe::default();
        let channel = Arc::new(ReplyChannel::with_publisher("test", Box::new(probe.clone())));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let channel = Arc::clone(&channel);
                tokio::spawn(async move { channel.publish(vec![i], &topic()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(probe.published.load(Ordering::SeqCst), 8);
        assert_eq!(probe.max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn detached_channel_reports_not_connected() {
        let channel = ReplyChannel::detached("idle");
        let err = channel.publish(b"x".to_vec(), &topic()).await.unwrap_err();
        assert!(matches!(err, BusError::NotConnected(ref name) if name == "idle"));

        channel.attach(Box::new(Probe::default())).await;
        assert!(channel.is_attached().await);
        channel.publish(b"x".to_vec(), &topic()).await.unwrap();

        channel.detach().await;
        assert!(!channel.is_attached().await);
    }

    #[test]
    fn destination_display_is_readable() {
        let dest = ReplyDestination::Amqp {
            exchange: "cse-ext".into(),
            routing_key: "reply.q".into(),
            correlation_id: Some("c1".into()),
        };
        assert_eq!(dest.to_string(), "amqp://cse-ext/reply.q");
        assert_eq!(topic().to_string(), "mqtt://replies");
    }
}
