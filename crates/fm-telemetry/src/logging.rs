use tracing_subscriber::{fmt, EnvFilter};

/// Output format for the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Human,
    Json,
}

/// Initialize logging with human-readable output.
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies (e.g. "info",
/// "fm_broker=debug,warn"). Safe to call multiple times -- subsequent calls
/// are no-ops, so tests and embedded daemons can both call it freely.
pub fn init_logging(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogFormat::Human);
}

/// Initialize logging with JSON output (log shippers, aggregation).
pub fn init_logging_json(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogFormat::Json);
}

fn init(service_name: &str, default_level: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true);

    let initialised = match format {
        LogFormat::Human => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    };

    if initialised {
        tracing::info!(service = service_name, format = ?format, "logging initialised");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_a_noop() {
        init_logging("test-service", "info");
        init_logging("test-service", "debug");
        init_logging_json("test-service", "info");
    }
}
