//! Broker lifecycle: dial, channel and topology setup, teardown.
//!
//! One task owns the connection from first dial to final close. Setup is
//! re-runnable so the router can recover from a canceled consumer by
//! opening a fresh channel over the still-live connection.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use lapin::options::{
    BasicConsumeOptions, ExchangeDeclareOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::router::EventRouter;
use super::{Control, Result, ServiceError, Shared};
use crate::message::{Alert, Info, Reply, Request};

/// Receiving ends of the outbound send queues, one per message kind.
pub(crate) struct OutboundQueues {
    pub(crate) requests: mpsc::Receiver<Request>,
    pub(crate) replies: mpsc::Receiver<Reply>,
    pub(crate) alerts: mpsc::Receiver<Alert>,
    pub(crate) infos: mpsc::Receiver<Info>,
}

/// Sending ends of the typed inbound streams.
pub(crate) struct InboundSenders {
    pub(crate) requests: mpsc::Sender<Request>,
    pub(crate) alerts: mpsc::Sender<Alert>,
    pub(crate) infos: mpsc::Sender<Info>,
}

/// The background task: everything the service owns for its whole life.
pub(crate) struct Lifecycle {
    pub(crate) shared: Arc<Shared>,
    pub(crate) control: mpsc::Receiver<Control>,
    pub(crate) outbound: OutboundQueues,
    pub(crate) inbound: InboundSenders,
    pub(crate) ready: oneshot::Sender<Result<()>>,
}

impl Lifecycle {
    pub(crate) async fn run(self) {
        let Lifecycle {
            shared,
            control,
            outbound,
            inbound,
            ready,
        } = self;

        let retry_delay = Duration::from_secs(shared.config.dial_retry_delay_secs);
        let connection = match dial(&shared.config.amqp_uri(), retry_delay).await {
            Ok(connection) => Arc::new(connection),
            Err(e) => {
                error!(broker = %shared.config.broker, error = %e, "Unable to connect to the AMQP broker");
                let _ = ready.send(Err(ServiceError::Connect(e)));
                return;
            }
        };
        shared.connected.store(true, Ordering::SeqCst);
        *shared.connection.lock().await = Some(Arc::clone(&connection));
        info!(broker = %shared.config.broker, "Connected to the AMQP broker");

        // Connection-level failures surface here; the router treats any
        // item on this feed as fatal.
        let (conn_err_tx, conn_errors) = mpsc::unbounded_channel();
        connection.on_error(move |e| {
            let _ = conn_err_tx.send(e);
        });

        let (channel, consumer) = match channel_setup(&shared, &connection).await {
            Ok(setup) => setup,
            Err(e) => {
                error!(error = %e, "AMQP channel setup failed");
                let _ = ready.send(Err(e));
                teardown(&shared, &connection, None).await;
                return;
            }
        };

        info!(queue = %shared.config.queue, "AMQP service ready");
        let _ = ready.send(Ok(()));

        let router = EventRouter {
            shared: Arc::clone(&shared),
            connection: Arc::clone(&connection),
            channel,
            consumer,
            control,
            conn_errors,
            outbound,
            inbound,
        };
        let channel = router.run().await;

        teardown(&shared, &connection, Some(channel)).await;
    }
}

/// Dial the broker, retrying exactly once after a fixed delay.
async fn dial(uri: &str, retry_delay: Duration) -> std::result::Result<Connection, lapin::Error> {
    match Connection::connect(uri, ConnectionProperties::default()).await {
        Ok(connection) => Ok(connection),
        Err(e) => {
            warn!(
                error = %e,
                retry_secs = retry_delay.as_secs(),
                "First connection attempt failed, retrying once"
            );
            tokio::time::sleep(retry_delay).await;
            Connection::connect(uri, ConnectionProperties::default()).await
        }
    }
}

/// Open a channel and declare the service topology on it: the receive
/// queue (transient, exclusive), the topic exchanges, and the consumer
/// when any subscription is registered.
///
/// The new channel is published to the shared slot so request senders and
/// subscribers always see the current one.
pub(crate) async fn channel_setup(
    shared: &Shared,
    connection: &Connection,
) -> Result<(Channel, Option<Consumer>)> {
    let channel = connection
        .create_channel()
        .await
        .map_err(ServiceError::Setup)?;
    debug!("Channel to the AMQP broker established");

    if !shared.config.queue.is_empty() {
        channel
            .queue_declare(
                &shared.config.queue,
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
        debug!(queue = %shared.config.queue, "Receive queue declared");
    }

    for exchange in shared.config.exchanges.unique_names() {
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(ServiceError::Setup)?;
        debug!(exchange = %exchange, "Topic exchange declared");
    }

    let consumer = arm_consumer(shared, &channel).await?;

    let previous = shared.channel.lock().await.replace(channel.clone());
    if let Some(previous) = previous {
        if previous.status().connected() {
            let _ = previous.close(200, "superseded by channel recovery").await;
        }
    }

    Ok((channel, consumer))
}

/// Start consuming from the receive queue, unless no subscription exists
/// yet. An unsubscribed service never pulls deliveries.
pub(crate) async fn arm_consumer(shared: &Shared, channel: &Channel) -> Result<Option<Consumer>> {
    if shared.subscriptions.load(Ordering::SeqCst) == 0 {
        return Ok(None);
    }
    let consumer = channel
        .basic_consume(
            &shared.config.queue,
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
    debug!(queue = %shared.config.queue, "Consuming from the receive queue");
    Ok(Some(consumer))
}

/// Release broker resources in order: queue, channel, connection. Failures
/// are logged and ignored; teardown keeps going regardless.
async fn teardown(shared: &Shared, connection: &Connection, channel: Option<Channel>) {
    shared.connected.store(false, Ordering::SeqCst);
    *shared.channel.lock().await = None;
    *shared.connection.lock().await = None;

    if let Some(channel) = channel {
        if !shared.config.queue.is_empty() {
            if let Err(e) = channel
                .queue_delete(&shared.config.queue, QueueDeleteOptions::default())
                .await
            {
                warn!(error = %e, queue = %shared.config.queue, "Error while deleting the receive queue");
            }
        }
        if let Err(e) = channel.close(200, "service stopped").await {
            debug!(error = %e, "Error while closing the channel");
        }
    }
    if let Err(e) = connection.close(200, "service stopped").await {
        debug!(error = %e, "Error while closing the connection");
    }
    info!("AMQP service stopped");
}
