//! dripline-monitor: Bus monitor
//!
//! Connects to the broker, binds the configured exchanges under a broad
//! routing-key pattern, and pretty-prints every message that arrives.
//! Useful for debugging and watching traffic on a dripline bus.
//!
//! ## Configuration
//! - DRIPLINE_CONFIG: Path to a YAML config file (optional)
//! - DRIPLINE_MONITOR_KEY: Routing-key pattern to bind (default: "#")
//! - DRIPLINE_LOG: Log filter (default: info)
//!
//! Any `ServiceConfig` field can also be set through DRIPLINE__-prefixed
//! environment variables, e.g. DRIPLINE__BROKER or DRIPLINE__QUEUE.

use tracing::info;

use dripline::config::ServiceConfig;
use dripline::service::AmqpService;
use dripline::utils::bootstrap::init_tracing;

const DEFAULT_ROUTING_KEY: &str = "#";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = ServiceConfig::load(None)?;
    let routing_key = std::env::var("DRIPLINE_MONITOR_KEY")
        .unwrap_or_else(|_| DEFAULT_ROUTING_KEY.to_string());

    let mut service = AmqpService::start(config).await?;
    let handle = service.handle();

    handle.subscribe_to_requests(&routing_key).await?;
    handle.subscribe_to_alerts(&routing_key).await?;
    handle.subscribe_to_infos(&routing_key).await?;

    info!(routing_key = %routing_key, "dripline-monitor started, press Ctrl-C to exit");

    loop {
        tokio::select! {
            request = service.inbound.requests.recv() => match request {
                Some(request) => info!(
                    to = %request.envelope.target,
                    op = %request.op,
                    corr_id = %request.envelope.corr_id,
                    from = %request.envelope.sender_info.package,
                    payload = %request.payload,
                    "request"
                ),
                None => break,
            },
            alert = service.inbound.alerts.recv() => match alert {
                Some(alert) => info!(
                    to = %alert.envelope.target,
                    from = %alert.envelope.sender_info.package,
                    payload = %alert.payload,
                    "alert"
                ),
                None => break,
            },
            message = service.inbound.infos.recv() => match message {
                Some(message) => info!(
                    to = %message.envelope.target,
                    from = %message.envelope.sender_info.package,
                    payload = %message.payload,
                    "info"
                ),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, stopping");
                handle.stop();
                break;
            }
        }
    }

    service.join().await;
    Ok(())
}
