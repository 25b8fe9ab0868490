//! Request-reply correlation.
//!
//! Every in-flight request gets its own broker-side plumbing: a dedicated
//! channel, an exclusive server-named queue bound to the requests exchange
//! under its own name, and a consumer on it. The request's reply-to points
//! at that queue, so replies route straight back without touching the
//! service queue or any shared correlation table. The plumbing is released
//! when the reply, a timeout, or a failure resolves the call.

use std::time::Duration;

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Consumer};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{Result, ServiceError, ServiceHandle};
use crate::message::{Message, Reply, Request, ReturnCode, SenderInfo};

impl ServiceHandle {
    /// Send a request and hand back a receiver for its reply.
    ///
    /// The returned receiver resolves with the matching reply, or with a
    /// synthesized timeout reply (return code
    /// [`ReturnCode::CLIENT_ERROR_TIMEOUT`]) when `timeout` elapses first.
    /// `None` or a zero timeout waits indefinitely. The receiver fails only
    /// if the reply plumbing is torn down before anything resolves, e.g.
    /// when the broker connection is lost mid-call.
    pub async fn send_request(
        &self,
        mut request: Request,
        timeout: Option<Duration>,
    ) -> Result<oneshot::Receiver<Reply>> {
        if !self.is_connected() {
            return Err(ServiceError::NotConnected);
        }
        let connection = self
            .shared
            .connection
            .lock()
            .await
            .clone()
            .ok_or(ServiceError::NotConnected)?;

        let channel = connection
            .create_channel()
            .await
            .map_err(ServiceError::Setup)?;

        // Server-named, exclusive, auto-delete: gone as soon as we are.
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    durable: false,
                    auto_delete: true,
                    exclusive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(ServiceError::Setup)?;
        let reply_queue = queue.name().as_str().to_string();

        request.envelope.reply_to = reply_queue.clone();
        if request.envelope.corr_id.is_empty() {
            request.envelope.corr_id = Uuid::new_v4().to_string();
        }

        // The queue's own name is the binding key; the responder publishes
        // the reply to exactly that key.
        channel
            .queue_bind(
                &reply_queue,
                &self.shared.config.exchanges.requests,
                &reply_queue,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(ServiceError::Setup)?;

        let consumer = channel
            .basic_consume(
                &reply_queue,
                "",
                BasicConsumeOptions {
                    no_local: true,
                    no_ack: false,
                    exclusive: true,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(ServiceError::Setup)?;

        debug!(
            to = %request.envelope.target,
            corr_id = %request.envelope.corr_id,
            reply_queue = %reply_queue,
            "Submitting request"
        );
        if self.requests.send(request.clone()).await.is_err() {
            let _ = channel.close(200, "request enqueue failed").await;
            return Err(ServiceError::NotRunning);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        tokio::spawn(wait_for_reply(
            channel,
            consumer,
            request,
            timeout,
            reply_tx,
            self.shared.sender_info.clone(),
        ));
        Ok(reply_rx)
    }
}

/// Wait on the reply consumer, racing the timeout when one is set, then
/// release the per-request channel.
async fn wait_for_reply(
    channel: Channel,
    mut consumer: Consumer,
    request: Request,
    timeout: Option<Duration>,
    reply_tx: oneshot::Sender<Reply>,
    sender_info: SenderInfo,
) {
    let delivery = match timeout.filter(|limit| !limit.is_zero()) {
        Some(limit) => match tokio::time::timeout(limit, consumer.next()).await {
            Ok(delivery) => delivery,
            Err(_) => {
                warn!(
                    corr_id = %request.envelope.corr_id,
                    timeout_secs = limit.as_secs_f64(),
                    "Timed out waiting for a reply"
                );
                let mut reply = Reply::to_request(
                    &request,
                    ReturnCode::CLIENT_ERROR_TIMEOUT,
                    "timeout while waiting for reply",
                    Value::Null,
                );
                reply.envelope.sender_info = sender_info;
                let _ = reply_tx.send(reply);
                release(channel).await;
                return;
            }
        },
        None => consumer.next().await,
    };

    match delivery {
        Some(Ok(delivery)) => {
            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                error!(error = %e, "Failed to acknowledge a reply delivery");
            }
            match Message::from_delivery(&delivery) {
                Ok(Message::Reply(reply)) => {
                    debug!(corr_id = %reply.envelope.corr_id, "Reply received");
                    let _ = reply_tx.send(reply);
                }
                Ok(message) => {
                    error!(
                        kind = %message.msg_type(),
                        "Non-reply message arrived on a reply queue"
                    );
                }
                Err(e) => error!(error = %e, "Failed to decode a reply"),
            }
        }
        Some(Err(e)) => warn!(error = %e, "Reply channel failed while waiting"),
        None => warn!("Reply consumer canceled before a reply arrived"),
    }
    release(channel).await;
}

async fn release(channel: Channel) {
    if let Err(e) = channel.close(200, "reply resolved").await {
        debug!(error = %e, "Error while closing a reply channel");
    }
}
