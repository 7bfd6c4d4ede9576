use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;
use crate::protocol::canonical::WireApi;
use crate::protocol::envelope::RequestEnvelope;
use crate::protocol::usage::UsageSnapshot;

/// Initialize the tracing subscriber with the configured log level and
/// format. `json` writes one JSON object per event.
///
/// Maps config log levels to tracing levels:
/// - "DISABLED" -> no subscriber installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (DEBUG, INFO, ERROR)
pub fn init_tracing(log_level: &str, format: LogFormat) {
    let level = log_level.to_uppercase();

    if level == "DISABLED" {
        return;
    }

    let tracing_level = match level.as_str() {
        "WARNING" => "WARN",
        "CRITICAL" => "ERROR",
        other => other,
    };

    let filter = EnvFilter::try_new(tracing_level).unwrap_or_else(|_| EnvFilter::new("INFO"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr);

    // a second call (tests, embedding hosts) keeps the first subscriber
    let _ = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

/// Log token usage for a finished stream.
pub fn log_stream_usage(
    envelope: &RequestEnvelope,
    backend: WireApi,
    client: WireApi,
    usage: &UsageSnapshot,
    elapsed: Duration,
) {
    info!(
        request_id = %envelope.request_id,
        model = %envelope.model,
        backend = %backend,
        client = %client,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        cache_read_tokens = usage.cache_read_tokens,
        cache_creation_tokens = usage.cache_creation_tokens,
        reasoning_tokens = usage.reasoning_tokens,
        total_tokens = usage.total_tokens(),
        duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        "stream complete"
    );
}
