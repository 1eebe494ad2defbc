use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogSink, LoggingConfig};
use crate::error::{ProxyError, Result};

/// Installs the global tracing subscriber from the logging config.
/// `RUST_LOG` overrides the configured severity when set.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.severity.clone()));
    let registry = tracing_subscriber::registry().with(filter);

    match config.sink {
        LogSink::Console => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        // Structured sinks share the JSON layer; shipping the stream to
        // syslog or logstash is the log collector's concern.
        LogSink::Json | LogSink::Syslog | LogSink::Logstash => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    }
    .map_err(|e| ProxyError::Config(format!("failed to initialize logging: {e}")))
}
