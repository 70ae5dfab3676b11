//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// Record a new WebSocket connection.
pub fn record_ws_connect() {
    metrics::gauge!("ws_connections_active").increment(1.0);
}

/// Record a WebSocket disconnection.
pub fn record_ws_disconnect() {
    metrics::gauge!("ws_connections_active").decrement(1.0);
}

/// Record a client command by name.
pub fn record_command(command: &str) {
    let labels = [("command", command.to_string())];
    metrics::counter!("ws_commands_total", &labels).increment(1);
}

pub fn record_run_start() {
    metrics::gauge!("runs_active").increment(1.0);
}

pub fn record_run_end() {
    metrics::gauge!("runs_active").decrement(1.0);
}

/// Record one run message fanned out to a session.
pub fn record_message_published() {
    metrics::counter!("run_messages_published_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorders_do_not_panic_without_exporter() {
        // The metrics crate falls back to a no-op recorder.
        record_ws_connect();
        record_ws_disconnect();
        record_command("ping");
        record_run_start();
        record_run_end();
        record_message_published();
    }
}
