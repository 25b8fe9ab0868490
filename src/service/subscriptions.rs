//! Routing-key subscriptions.
//!
//! Subscribing binds the shared receive queue to an exchange under a
//! routing-key pattern and bumps the subscription count. The router owns
//! consumer state, so the actual (re)arming happens there, triggered by a
//! `Control::Rearm` signal.

use std::sync::atomic::Ordering;

use lapin::options::QueueBindOptions;
use lapin::types::FieldTable;
use tracing::debug;

use super::{Control, Result, ServiceError, ServiceHandle};

impl ServiceHandle {
    /// Receive requests whose target matches `routing_key` (a topic
    /// pattern, e.g. `"my_service.#"`).
    pub async fn subscribe_to_requests(&self, routing_key: &str) -> Result<()> {
        self.subscribe(&self.shared.config.exchanges.requests, routing_key)
            .await
    }

    /// Receive alerts whose target matches `routing_key`.
    pub async fn subscribe_to_alerts(&self, routing_key: &str) -> Result<()> {
        self.subscribe(&self.shared.config.exchanges.alerts, routing_key)
            .await
    }

    /// Receive infos whose target matches `routing_key`.
    pub async fn subscribe_to_infos(&self, routing_key: &str) -> Result<()> {
        self.subscribe(&self.shared.config.exchanges.infos, routing_key)
            .await
    }

    async fn subscribe(&self, exchange: &str, routing_key: &str) -> Result<()> {
        if self.shared.config.queue.is_empty() {
            return Err(ServiceError::InvalidConfig(
                "no receive queue configured".to_string(),
            ));
        }
        if !self.is_connected() {
            return Err(ServiceError::NotConnected);
        }
        let channel = self
            .shared
            .channel
            .lock()
            .await
            .clone()
            .ok_or(ServiceError::NotConnected)?;

        channel
            .queue_bind(
                &self.shared.config.queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(ServiceError::Setup)?;
        self.shared.subscriptions.fetch_add(1, Ordering::SeqCst);

        self.control
            .send(Control::Rearm)
            .await
            .map_err(|_| ServiceError::NotRunning)?;
        debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            queue = %self.shared.config.queue,
            "Subscription registered"
        );
        Ok(())
    }
}
