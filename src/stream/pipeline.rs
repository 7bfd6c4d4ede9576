//! Pull-based async drivers around [`StreamTranscoder`].
//!
//! One backend event is pulled only after every client event produced by the
//! previous one has been taken by the consumer, so client backpressure holds
//! the backend stream. When the backend stream ends without a terminal event
//! the transcoder's fallback finalization runs. The optional
//! [`StreamLease`] lives inside the stream state and is released whenever
//! the stream is dropped: completion, error or cancellation.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Instant;

use futures_util::{Stream, StreamExt};

use crate::observability::log_stream_usage;
use crate::state::registry::StreamLease;

use super::sse::sse_frame_stream;
use super::transcoder::StreamTranscoder;
use super::{SseEvent, WireStreamEvent};

struct PipelineState<S> {
    source: Pin<Box<S>>,
    transcoder: StreamTranscoder,
    pending: VecDeque<WireStreamEvent>,
    scratch: Vec<WireStreamEvent>,
    started_at: Instant,
    source_done: bool,
    lease: Option<StreamLease>,
}

impl<S> PipelineState<S> {
    fn new(source: S, transcoder: StreamTranscoder, lease: Option<StreamLease>) -> Self {
        Self {
            source: Box::pin(source),
            transcoder,
            pending: VecDeque::new(),
            scratch: Vec::with_capacity(8),
            started_at: Instant::now(),
            source_done: false,
            lease,
        }
    }

    fn drain_scratch(&mut self) {
        self.pending.extend(self.scratch.drain(..));
    }

    fn close(&mut self) {
        self.transcoder.finish(&mut self.scratch);
        self.drain_scratch();
        self.source_done = true;
        log_stream_usage(
            self.transcoder.envelope(),
            self.transcoder.source(),
            self.transcoder.target(),
            &self.transcoder.usage(),
            self.started_at.elapsed(),
        );
        // release bookkeeping as soon as the backend side is over
        self.lease.take();
    }
}

/// Transcode a lazy sequence of decoded backend events.
pub fn transcode_stream<S>(
    source: S,
    transcoder: StreamTranscoder,
    lease: Option<StreamLease>,
) -> impl Stream<Item = WireStreamEvent> + Send
where
    S: Stream<Item = WireStreamEvent> + Send + 'static,
{
    let state = PipelineState::new(source, transcoder, lease);
    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            if state.source_done {
                return None;
            }
            match state.source.next().await {
                Some(event) => {
                    state.transcoder.push(&event, &mut state.scratch);
                    state.drain_scratch();
                    if state.transcoder.is_finished() {
                        state.close();
                    }
                }
                None => state.close(),
            }
        }
    })
}

/// Transcode a raw backend SSE byte stream into client SSE text frames.
///
/// Frames that do not decode are skipped; a transport error ends the
/// backend side and triggers fallback finalization.
pub fn transcode_sse_stream<B, E>(
    bytes: B,
    transcoder: StreamTranscoder,
    lease: Option<StreamLease>,
) -> impl Stream<Item = String> + Send
where
    B: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let api = transcoder.source();
    let events = sse_frame_stream(bytes)
        .filter_map(move |frame: SseEvent| std::future::ready(WireStreamEvent::decode(api, &frame)));
    transcode_stream(events, transcoder, lease).filter_map(|event| {
        std::future::ready(match event.to_sse() {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::error!(error = %e, "dropping client event that failed to render");
                None
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::protocol::canonical::WireApi;
    use crate::protocol::envelope::RequestEnvelope;
    use crate::state::registry::{StreamEntry, StreamRegistry};

    fn transcoder(source: WireApi, target: WireApi) -> StreamTranscoder {
        let envelope = RequestEnvelope::for_model(uuid::Uuid::from_u128(3), "gpt-test", 1_700_000_000);
        StreamTranscoder::new(source, target, Arc::new(envelope))
    }

    #[tokio::test]
    async fn test_truncated_chat_stream_is_terminated_and_lease_released() {
        let registry = StreamRegistry::new();
        let lease = registry.register(
            uuid::Uuid::from_u128(3),
            StreamEntry::new(WireApi::Anthropic, WireApi::OpenAiChat, "gpt-test"),
        );
        assert_eq!(registry.len(), 1);

        let body = "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"model\":\"gpt-test\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n";
        let chunks = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(bytes::Bytes::from(body))]);
        let frames: Vec<String> = transcode_sse_stream(
            chunks,
            transcoder(WireApi::OpenAiChat, WireApi::Anthropic),
            Some(lease),
        )
        .collect()
        .await;

        assert!(frames.first().is_some_and(|f| f.starts_with("event: message_start\n")));
        assert!(frames.iter().any(|f| f.contains("\"text\":\"Hi\"")));
        assert!(frames.last().is_some_and(|f| f.starts_with("event: message_stop\n")));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_dropping_stream_early_releases_lease() {
        let registry = StreamRegistry::new();
        let lease = registry.register(
            uuid::Uuid::from_u128(4),
            StreamEntry::new(WireApi::OpenAiChat, WireApi::OpenAiChat, "gpt-test"),
        );
        let source = futures_util::stream::pending::<WireStreamEvent>();
        let stream = transcode_stream(
            source,
            transcoder(WireApi::OpenAiChat, WireApi::OpenAiChat),
            Some(lease),
        );
        assert_eq!(registry.len(), 1);
        drop(stream);
        assert!(registry.is_empty());
    }
}
