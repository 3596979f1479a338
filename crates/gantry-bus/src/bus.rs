//! Broadcast-channel event bus implementation.

use async_trait::async_trait;
use futures::stream;
use gantry_core::events::Event;
use gantry_core::ports::{EventBus, EventStream};
use gantry_core::{Error, Result};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 1024;

/// In-process event bus backed by a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<Event>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for BroadcastBus {
    async fn publish(&self, event: Event) -> Result<()> {
        debug!(subject = %event.subject(), "publishing event");
        // A send error only means there are no subscribers right now.
        let _ = self.tx.send(event);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        debug!(pattern, "subscribing");
        let rx = self.tx.subscribe();
        let pattern = pattern.to_string();

        let stream = stream::unfold(rx, move |mut rx| {
            let pattern = pattern.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            if subject_matches(&pattern, &event.subject()) {
                                return Some((Ok(event), rx));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "subscriber lagged, events dropped");
                            return Some((
                                Err(Error::EventBus(format!(
                                    "subscriber lagged, {} events dropped",
                                    missed
                                ))),
                                rx,
                            ));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

/// Subject pattern matching: `*` matches one token, a trailing `>` matches
/// the rest of the subject.
fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.').peekable();
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), _) => return true,
            (Some(p), Some(s)) => {
                if p != "*" && p != s {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}
