//! The AMQP service: broker lifecycle, event routing, and the send and
//! subscribe surface.
//!
//! [`AmqpService::start`] dials the broker, declares the topology, and
//! spawns a single background task that owns the connection. Everything
//! else talks to that task through a clonable [`ServiceHandle`]: outbound
//! sends are enqueued, subscriptions bind the shared receive queue, and
//! incoming traffic comes back out of the typed [`Inbound`] streams.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use lapin::{Channel, Connection};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::error;

use crate::config::ServiceConfig;
use crate::message::{Alert, Info, Reply, Request, SenderInfo};

mod lifecycle;
mod request;
mod router;
mod subscriptions;

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Capacity of the control channel. Stop and rearm signals are rare; a
/// small buffer keeps them from ever blocking a caller.
const CONTROL_CAPACITY: usize = 5;

/// Errors from the AMQP service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The broker could not be reached, even after the dial retry.
    #[error("broker connection failed: {0}")]
    Connect(#[source] lapin::Error),

    /// A queue, exchange, binding, or consumer operation failed.
    #[error("broker setup failed: {0}")]
    Setup(#[source] lapin::Error),

    #[error("service is not connected to a broker")]
    NotConnected,

    /// The background task is gone; the service was stopped or it failed.
    #[error("service is no longer running")]
    NotRunning,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ServiceError {
    /// True for errors that mean the broker link is unusable, as opposed
    /// to a bad call.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ServiceError::Connect(_) | ServiceError::NotConnected | ServiceError::NotRunning
        )
    }
}

/// Signals from handles to the router task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    /// Shut the service down.
    Stop,
    /// A subscription was added; (re)arm the queue consumer.
    Rearm,
}

/// State shared between the background task and every handle.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: ServiceConfig,
    pub(crate) sender_info: SenderInfo,
    pub(crate) connected: AtomicBool,
    /// Number of registered subscriptions; the consumer is armed only
    /// while this is non-zero.
    pub(crate) subscriptions: AtomicUsize,
    pub(crate) connection: Mutex<Option<Arc<Connection>>>,
    pub(crate) channel: Mutex<Option<Channel>>,
}

/// Typed streams of traffic received on the service queue.
#[derive(Debug)]
pub struct Inbound {
    pub requests: mpsc::Receiver<Request>,
    pub alerts: mpsc::Receiver<Alert>,
    pub infos: mpsc::Receiver<Info>,
}

/// Clonable entry point for sending, subscribing, and stopping.
///
/// Handles stay valid for the life of the process; once the service stops,
/// their methods return [`ServiceError::NotRunning`].
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    pub(crate) shared: Arc<Shared>,
    pub(crate) control: mpsc::Sender<Control>,
    pub(crate) requests: mpsc::Sender<Request>,
    pub(crate) replies: mpsc::Sender<Reply>,
    pub(crate) alerts: mpsc::Sender<Alert>,
    pub(crate) infos: mpsc::Sender<Info>,
}

impl ServiceHandle {
    /// Enqueue a reply for publication.
    pub async fn send_reply(&self, reply: Reply) -> Result<()> {
        self.replies
            .send(reply)
            .await
            .map_err(|_| ServiceError::NotRunning)
    }

    /// Enqueue an alert for publication.
    pub async fn send_alert(&self, alert: Alert) -> Result<()> {
        self.alerts
            .send(alert)
            .await
            .map_err(|_| ServiceError::NotRunning)
    }

    /// Enqueue an info for publication.
    pub async fn send_info(&self, info: Info) -> Result<()> {
        self.infos
            .send(info)
            .await
            .map_err(|_| ServiceError::NotRunning)
    }

    /// Ask the service to shut down. Non-blocking and idempotent: a full
    /// control queue hands the signal to a background task so it still
    /// lands once the router catches up. After the service is gone this is
    /// a no-op.
    pub fn stop(&self) {
        if let Err(mpsc::error::TrySendError::Full(signal)) = self.control.try_send(Control::Stop)
        {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let control = self.control.clone();
                runtime.spawn(async move {
                    let _ = control.send(signal).await;
                });
            }
        }
    }

    /// Whether the service currently holds a live broker connection.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.shared.config
    }
}

/// A running AMQP service.
///
/// Holds the inbound streams and the background task. Dropping it (along
/// with every cloned handle) closes the control channel, which the task
/// treats as a stop signal.
///
/// Losing the broker connection tears the service down. A broker-initiated
/// close of the primary channel alone, with the connection still up, is
/// noticed at the next publish or through the delivery stream; a fully
/// idle service does not observe it until then.
#[derive(Debug)]
pub struct AmqpService {
    /// Traffic received on the service queue, one stream per kind.
    pub inbound: Inbound,
    handle: ServiceHandle,
    lifecycle: JoinHandle<()>,
}

impl AmqpService {
    /// Start a service: dial the broker, declare the topology, and spawn
    /// the router task. Returns once the service is ready to use or has
    /// definitively failed.
    pub async fn start(config: ServiceConfig) -> Result<Self> {
        validate(&config)?;
        let capacity = config.channel_capacity;

        let shared = Arc::new(Shared {
            sender_info: SenderInfo::snapshot(),
            config,
            connected: AtomicBool::new(false),
            subscriptions: AtomicUsize::new(0),
            connection: Mutex::new(None),
            channel: Mutex::new(None),
        });

        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (request_tx, request_rx) = mpsc::channel(capacity);
        let (reply_tx, reply_rx) = mpsc::channel(capacity);
        let (alert_tx, alert_rx) = mpsc::channel(capacity);
        let (info_tx, info_rx) = mpsc::channel(capacity);
        let (in_request_tx, in_request_rx) = mpsc::channel(capacity);
        let (in_alert_tx, in_alert_rx) = mpsc::channel(capacity);
        let (in_info_tx, in_info_rx) = mpsc::channel(capacity);
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = ServiceHandle {
            shared: Arc::clone(&shared),
            control: control_tx,
            requests: request_tx,
            replies: reply_tx,
            alerts: alert_tx,
            infos: info_tx,
        };

        let task = lifecycle::Lifecycle {
            shared,
            control: control_rx,
            outbound: lifecycle::OutboundQueues {
                requests: request_rx,
                replies: reply_rx,
                alerts: alert_rx,
                infos: info_rx,
            },
            inbound: lifecycle::InboundSenders {
                requests: in_request_tx,
                alerts: in_alert_tx,
                infos: in_info_tx,
            },
            ready: ready_tx,
        };
        let lifecycle = tokio::spawn(task.run());

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                inbound: Inbound {
                    requests: in_request_rx,
                    alerts: in_alert_rx,
                    infos: in_info_rx,
                },
                handle,
                lifecycle,
            }),
            Ok(Err(e)) => {
                reap(lifecycle).await;
                Err(e)
            }
            // The task panicked or was aborted before reporting readiness.
            Err(_) => {
                reap(lifecycle).await;
                Err(ServiceError::NotRunning)
            }
        }
    }

    /// Start with default configuration apart from the broker address and
    /// receive queue name.
    pub async fn start_with_defaults(
        broker: impl Into<String>,
        queue: impl Into<String>,
    ) -> Result<Self> {
        let config = ServiceConfig {
            broker: broker.into(),
            queue: queue.into(),
            ..ServiceConfig::default()
        };
        Self::start(config).await
    }

    /// A new handle onto this service.
    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// Ask the service to shut down without waiting for it.
    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Wait for the background task to finish teardown.
    pub async fn join(self) {
        reap(self.lifecycle).await;
    }
}

async fn reap(lifecycle: JoinHandle<()>) {
    if let Err(e) = lifecycle.await {
        error!(error = %e, "AMQP service task did not exit cleanly");
    }
}

fn validate(config: &ServiceConfig) -> Result<()> {
    if config.broker.is_empty() {
        return Err(ServiceError::InvalidConfig(
            "broker address is empty".to_string(),
        ));
    }
    if config.channel_capacity == 0 {
        return Err(ServiceError::InvalidConfig(
            "channel_capacity must be at least 1".to_string(),
        ));
    }
    Ok(())
}
