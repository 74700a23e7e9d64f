//! Outcome notification.
//!
//! The executor hands each terminal [`OutcomeMessage`] to a
//! [`NotificationSink`] exactly once. [`Topic`] is the publish/subscribe
//! fan-out: every subscriber receives the message on its own task, and the
//! publisher never waits for delivery.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::OutcomeMessage;

/// Destination for terminal outcomes
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Hand off a message; must not block on subscriber processing
    async fn publish(&self, message: &OutcomeMessage) -> Result<()>;
}

/// A single consumer of a topic
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Human-readable subscriber name
    fn name(&self) -> &str;

    /// Deliver one message
    async fn deliver(&self, message: &OutcomeMessage) -> Result<()>;
}

/// Fan-out topic delivering to every subscriber independently
#[derive(Clone)]
pub struct Topic {
    name: String,
    subscribers: Vec<Arc<dyn Subscriber>>,
    in_flight: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: Vec::new(),
            in_flight: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Add a subscriber
    pub fn subscribe(mut self, subscriber: Arc<dyn Subscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Wait for deliveries still in flight
    ///
    /// Publishing never waits; a process about to exit calls this so queued
    /// deliveries are not dropped with the runtime.
    pub async fn drain(&self) {
        let handles = match self.in_flight.lock() {
            Ok(mut in_flight) => std::mem::take(&mut *in_flight),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(topic = %self.name, error = %e, "Delivery task panicked");
            }
        }
    }
}

#[async_trait]
impl NotificationSink for Topic {
    async fn publish(&self, message: &OutcomeMessage) -> Result<()> {
        debug!(
            topic = %self.name,
            run_id = %message.run_id,
            subscribers = self.subscribers.len(),
            "Publishing outcome"
        );

        for subscriber in &self.subscribers {
            let subscriber = Arc::clone(subscriber);
            let message = message.clone();
            let topic = self.name.clone();

            let handle = tokio::spawn(async move {
                if let Err(e) = subscriber.deliver(&message).await {
                    warn!(
                        %topic,
                        subscriber = subscriber.name(),
                        run_id = %message.run_id,
                        error = %e,
                        "Subscriber delivery failed"
                    );
                }
            });

            if let Ok(mut in_flight) = self.in_flight.lock() {
                in_flight.retain(|h| !h.is_finished());
                in_flight.push(handle);
            }
        }

        Ok(())
    }
}

/// Subscriber that writes outcomes to the log
pub struct LogSubscriber;

#[async_trait]
impl Subscriber for LogSubscriber {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, message: &OutcomeMessage) -> Result<()> {
        if message.outcome.is_success() {
            info!(run_id = %message.run_id, workflow = %message.workflow, body = %message.body(), "Workflow succeeded");
        } else {
            error!(run_id = %message.run_id, workflow = %message.workflow, cause = %message.body(), "Workflow failed");
        }
        Ok(())
    }
}
