//! The single-task event router.
//!
//! One `select!` loop services every event source the running service has:
//! control signals, connection failures, queue deliveries, and the four
//! outbound send queues. Exactly one source is handled per iteration, so
//! all broker I/O stays serialized on the one channel and no locking is
//! needed around it.

use std::sync::Arc;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicCancelOptions, BasicPublishOptions};
use lapin::{BasicProperties, Channel, Connection, Consumer};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::lifecycle::{self, InboundSenders, OutboundQueues};
use super::{Control, Result, Shared};
use crate::message::{codec, Message};

pub(crate) struct EventRouter {
    pub(crate) shared: Arc<Shared>,
    pub(crate) connection: Arc<Connection>,
    pub(crate) channel: Channel,
    /// Present only while at least one subscription is armed.
    pub(crate) consumer: Option<Consumer>,
    pub(crate) control: mpsc::Receiver<Control>,
    pub(crate) conn_errors: mpsc::UnboundedReceiver<lapin::Error>,
    pub(crate) outbound: OutboundQueues,
    pub(crate) inbound: InboundSenders,
}

impl EventRouter {
    /// Run until a stop signal, a fatal broker event, or the loss of every
    /// handle. Returns the channel so the caller can tear it down.
    pub(crate) async fn run(mut self) -> Channel {
        loop {
            tokio::select! {
                control = self.control.recv() => match control {
                    Some(Control::Stop) => {
                        info!("Stop requested, shutting the AMQP service down");
                        break;
                    }
                    Some(Control::Rearm) => {
                        if let Err(e) = self.rearm().await {
                            error!(error = %e, "Unable to arm the queue consumer");
                            break;
                        }
                    }
                    // Every handle is gone; nobody can talk to us anymore.
                    None => {
                        info!("All service handles dropped, shutting the AMQP service down");
                        break;
                    }
                },

                closed = self.conn_errors.recv() => {
                    match closed {
                        Some(e) => warn!(error = %e, "AMQP connection failed"),
                        None => error!("Connection error feed closed unexpectedly"),
                    }
                    break;
                }

                delivery = next_delivery(&mut self.consumer) => match delivery {
                    Some(Ok(delivery)) => self.dispatch(delivery).await,
                    Some(Err(e)) => {
                        warn!(error = %e, "AMQP channel failed");
                        break;
                    }
                    // Consumer canceled server-side (queue deleted, broker
                    // restarting). The connection may still be fine, so try
                    // a fresh channel before giving up.
                    None => {
                        warn!("Queue consumer canceled, re-opening the channel");
                        match lifecycle::channel_setup(&self.shared, &self.connection).await {
                            Ok((channel, consumer)) => {
                                self.channel = channel;
                                self.consumer = consumer;
                            }
                            Err(e) => {
                                error!(error = %e, "Channel recovery failed");
                                break;
                            }
                        }
                    }
                },

                request = self.outbound.requests.recv() => match request {
                    Some(request) => {
                        if !self.publish(Message::Request(request)).await {
                            break;
                        }
                    }
                    None => break,
                },

                reply = self.outbound.replies.recv() => match reply {
                    Some(reply) => {
                        if !self.publish(Message::Reply(reply)).await {
                            break;
                        }
                    }
                    None => break,
                },

                alert = self.outbound.alerts.recv() => match alert {
                    Some(alert) => {
                        if !self.publish(Message::Alert(alert)).await {
                            break;
                        }
                    }
                    None => break,
                },

                info = self.outbound.infos.recv() => match info {
                    Some(info) => {
                        if !self.publish(Message::Info(info)).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        self.channel
    }

    /// Replace the active consumer after a subscription change.
    async fn rearm(&mut self) -> Result<()> {
        if let Some(previous) = self.consumer.take() {
            let tag = previous.tag();
            let _ = self
                .channel
                .basic_cancel(tag.as_str(), BasicCancelOptions::default())
                .await;
        }
        self.consumer = lifecycle::arm_consumer(&self.shared, &self.channel).await?;
        Ok(())
    }

    /// Route one delivery to its typed inbound stream.
    ///
    /// Acked before decoding: a message we cannot parse is not going to
    /// parse on redelivery either.
    async fn dispatch(&mut self, delivery: Delivery) {
        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            error!(error = %e, "Failed to acknowledge a delivery");
        }
        match Message::from_delivery(&delivery) {
            Ok(Message::Request(request)) => {
                debug!(to = %request.envelope.target, op = %request.op, "Received a request");
                if self.inbound.requests.send(request).await.is_err() {
                    warn!("Inbound request stream dropped, discarding the message");
                }
            }
            Ok(Message::Reply(_)) => {
                error!("Unexpected reply on the service queue; replies belong on reply queues");
            }
            Ok(Message::Alert(alert)) => {
                debug!(to = %alert.envelope.target, "Received an alert");
                if self.inbound.alerts.send(alert).await.is_err() {
                    warn!("Inbound alert stream dropped, discarding the message");
                }
            }
            Ok(Message::Info(info)) => {
                debug!(to = %info.envelope.target, "Received an info");
                if self.inbound.infos.send(info).await.is_err() {
                    warn!("Inbound info stream dropped, discarding the message");
                }
            }
            Err(e) => {
                error!(error = %e, routing_key = %delivery.routing_key.as_str(), "Failed to decode an incoming message");
            }
        }
    }

    /// Stamp, encode, and publish one outbound message. Returns false only
    /// when the channel is no longer usable and the loop should exit.
    async fn publish(&mut self, mut message: Message) -> bool {
        let envelope = message.envelope_mut();
        if envelope.sender_info.is_unset() {
            envelope.sender_info = self.shared.sender_info.clone();
        }
        if envelope.corr_id.is_empty() {
            envelope.corr_id = Uuid::new_v4().to_string();
        }

        let body = match codec::encode(&message) {
            Ok(body) => body,
            Err(e) => {
                // A message that will not serialize is dropped, not fatal.
                error!(error = %e, kind = %message.msg_type(), "Failed to encode an outgoing message");
                return true;
            }
        };

        let envelope = message.envelope();
        let properties = BasicProperties::default()
            .with_content_encoding(envelope.encoding.as_mime().into())
            .with_reply_to(envelope.reply_to.as_str().into())
            .with_correlation_id(envelope.corr_id.as_str().into());
        let exchange = message.exchange(&self.shared.config.exchanges);

        debug!(
            exchange = %exchange,
            to = %envelope.target,
            kind = %message.msg_type(),
            "Publishing message"
        );
        let published = match self
            .channel
            .basic_publish(
                exchange,
                &envelope.target,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
        {
            Ok(confirm) => confirm.await.map(|_| ()),
            Err(e) => Err(e),
        };
        match published {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, kind = %message.msg_type(), "Error while publishing a message");
                if self.channel.status().connected() {
                    true
                } else {
                    warn!("AMQP channel is closed, shutting the AMQP service down");
                    false
                }
            }
        }
    }
}

/// Wait for the next delivery, or forever when no consumer is armed. A
/// pending slot keeps the `select!` honest: an unsubscribed service simply
/// never wins this branch.
async fn next_delivery(consumer: &mut Option<Consumer>) -> Option<lapin::Result<Delivery>> {
    match consumer {
        Some(consumer) => consumer.next().await,
        None => std::future::pending().await,
    }
}
