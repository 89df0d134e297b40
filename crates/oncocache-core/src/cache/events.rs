//! Cache notifications for interested views.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Buffer size for the event channel.
/// Slow subscribers lag and skip ahead rather than block publishers.
const EVENT_BUFFER_SIZE: usize = 64;

/// Where the data currently on screen came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Cache,
    Server,
}

impl DataSource {
    pub fn label(&self) -> &'static str {
        match self {
            DataSource::Cache => "cache",
            DataSource::Server => "server",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    DataSourceChanged {
        collection: String,
        source: DataSource,
    },
    Revalidated {
        key: String,
        applied: bool,
    },
    RevalidationFailed {
        key: String,
        error: String,
    },
    Cleared {
        prefix: Option<String>,
        removed: usize,
    },
    Toggled {
        collection: String,
        enabled: bool,
    },
}

#[derive(Debug, Clone)]
pub struct CacheEvents {
    tx: broadcast::Sender<CacheEvent>,
}

impl Default for CacheEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: CacheEvent) {
        // No subscribers is fine
        if self.tx.send(event).is_err() {
            debug!("Cache event dropped, no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let events = CacheEvents::new();
        let mut rx = events.subscribe();

        events.publish(CacheEvent::DataSourceChanged {
            collection: "services".to_string(),
            source: DataSource::Server,
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            CacheEvent::DataSourceChanged {
                collection: "services".to_string(),
                source: DataSource::Server,
            }
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let events = CacheEvents::new();
        events.publish(CacheEvent::Cleared {
            prefix: None,
            removed: 0,
        });
    }

    #[test]
    fn test_data_source_label() {
        assert_eq!(DataSource::Cache.label(), "cache");
        assert_eq!(DataSource::Server.label(), "server");
    }
}
