use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use protocol_bridge::config::{load_config, AppConfig};
use protocol_bridge::observability::init_tracing;
use protocol_bridge::protocol::canonical::WireApi;
use protocol_bridge::protocol::envelope::RequestEnvelope;
use protocol_bridge::state::RequestIdGenerator;
use protocol_bridge::stream::{
    sse_frame_stream, transcode_stream, SseEvent, WireAccumulator, WireStreamEvent,
};
use protocol_bridge::translate::Translator;

const USAGE: &str =
    "usage: bridge-replay --from <api> --to <api> [--config path] <recorded.sse>\n\
     apis: anthropic, openai_chat, openai_responses";

struct Args {
    from: WireApi,
    to: WireApi,
    config: Option<String>,
    capture: String,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut from = None;
    let mut to = None;
    let mut config = None;
    let mut capture = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--from" | "--to" => {
                let value = args.next().ok_or_else(|| format!("{arg} needs a value"))?;
                let api = WireApi::parse(&value).ok_or_else(|| format!("unknown api '{value}'"))?;
                if arg == "--from" {
                    from = Some(api);
                } else {
                    to = Some(api);
                }
            }
            "--config" => {
                config = Some(args.next().ok_or("--config needs a value")?);
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            other if other.starts_with("--") => return Err(format!("unknown flag '{other}'")),
            _ => capture = Some(arg),
        }
    }
    Ok(Args {
        from: from.ok_or("--from is required")?,
        to: to.ok_or("--to is required")?,
        config,
        capture: capture.ok_or("missing capture file")?,
    })
}

fn main() {
    let args = parse_args(std::env::args().skip(1)).unwrap_or_else(|e| {
        eprintln!("{e}");
        eprintln!("{USAGE}");
        std::process::exit(2);
    });

    let config = match &args.config {
        Some(path) => load_config(path).unwrap_or_else(|e| {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }),
        None => AppConfig::default(),
    };
    init_tracing(&config.features.log_level, config.features.log_format);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Failed to initialize Tokio runtime: {e}");
            std::process::exit(1);
        });
    runtime.block_on(async move {
        if let Err(e) = replay(&config, &args).await {
            eprintln!("{e}");
            std::process::exit(1);
        }
    });
}

async fn replay(config: &AppConfig, args: &Args) -> Result<(), String> {
    let capture = tokio::fs::read(&args.capture)
        .await
        .map_err(|e| format!("Failed to read {}: {e}", args.capture))?;

    let translator = Translator::new(config, None);
    let envelope = Arc::new(RequestEnvelope::for_model(
        RequestIdGenerator::new().next_id(),
        "replay",
        unix_now_secs(),
    ));
    let (transcoder, lease) = translator.begin_stream(envelope, args.from, args.to);

    // the capture is fed in small chunks so frame reassembly is exercised
    let chunks: Vec<Result<bytes::Bytes, std::convert::Infallible>> = capture
        .chunks(512)
        .map(|c| Ok(bytes::Bytes::copy_from_slice(c)))
        .collect();

    let backend = Arc::new(Mutex::new(WireAccumulator::new(args.from)));
    let observed = Arc::clone(&backend);
    let source = args.from;
    let events = sse_frame_stream(futures_util::stream::iter(chunks))
        .filter_map(move |frame: SseEvent| {
            std::future::ready(WireStreamEvent::decode(source, &frame))
        })
        .inspect(move |event| observed.lock().push(event));

    let mut frames = std::pin::pin!(transcode_stream(events, transcoder, Some(lease)));
    let mut emitted = 0usize;
    while let Some(event) = frames.next().await {
        let frame = event.to_sse().map_err(|e| e.to_string())?;
        print!("{frame}");
        emitted += 1;
    }

    let backend = backend.lock();
    let response = backend.snapshot();
    let body = response.to_json().map_err(|e| e.to_string())?;
    tracing::info!(
        backend = %args.from,
        client = %args.to,
        frames = emitted,
        terminal = backend.is_terminal(),
        response = %body,
        "replay finished"
    );
    if let Some(message) = backend.error_message() {
        tracing::warn!(backend = %args.from, error = %message, "captured stream ended with an error event");
    }
    Ok(())
}

fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
