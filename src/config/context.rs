use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::store::{memory::MemoryStore, DocumentStore, StoreResult};

use super::schema;

// Build the document store the config points at
pub fn build_store(source: &schema::Source) -> StoreResult<Arc<dyn DocumentStore>> {
    match source {
        schema::Source::InMemory(schema::InMemory { path, .. }) => {
            info!("Loading documents from {path}");
            Ok(Arc::new(MemoryStore::from_json_file(Path::new(path))?))
        }
    }
}

#[cfg(feature = "metrics")]
pub fn setup_metrics(metrics: &schema::Metrics) -> Result<(), config::ConfigError> {
    use std::net::SocketAddr;

    use config::ConfigError;
    use metrics_exporter_prometheus::PrometheusBuilder;

    let addr: SocketAddr = format!("{}:{}", metrics.host, metrics.port)
        .parse()
        .map_err(|e| {
            ConfigError::Message(format!(
                "Error parsing the Prometheus metrics export address: {e}"
            ))
        })?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| {
            ConfigError::Message(format!("Failed to install recorder/exporter: {e}"))
        })?;

    info!("Exporting metrics on {addr}");
    Ok(())
}
