use std::sync::Arc;

use serde_json::{json, Value};
use protocol_bridge::protocol::anthropic::{AnthropicContentBlock, AnthropicDelta, AnthropicStreamEvent};
use protocol_bridge::protocol::canonical::WireApi;
use protocol_bridge::protocol::envelope::RequestEnvelope;
use protocol_bridge::protocol::openai_responses::{
    ResponsesOutputItem, ResponsesStreamEvent, ResponsesSummaryPart,
};
use protocol_bridge::stream::{SseEvent, StreamTranscoder, WireAccumulator, WireStreamEvent};
use protocol_bridge::translate::WireResponse;
use uuid::Uuid;

fn envelope() -> Arc<RequestEnvelope> {
    Arc::new(RequestEnvelope::for_model(
        Uuid::from_u128(0x42),
        "client-model",
        1_700_000_000,
    ))
}

fn frame(api: WireApi, data: &Value) -> WireStreamEvent {
    let event = SseEvent {
        data: data.to_string(),
        ..SseEvent::default()
    };
    WireStreamEvent::decode(api, &event).expect("frame decodes")
}

fn chat_done() -> WireStreamEvent {
    let event = SseEvent {
        data: "[DONE]".to_string(),
        ..SseEvent::default()
    };
    WireStreamEvent::decode(WireApi::OpenAiChat, &event).expect("done decodes")
}

fn run(source: WireApi, target: WireApi, events: &[WireStreamEvent]) -> (Vec<WireStreamEvent>, StreamTranscoder) {
    let mut transcoder = StreamTranscoder::new(source, target, envelope());
    let mut out = Vec::new();
    for event in events {
        transcoder.push(event, &mut out);
    }
    transcoder.finish(&mut out);
    (out, transcoder)
}

fn chat_chunk(delta: Value, finish_reason: Option<&str>) -> WireStreamEvent {
    frame(
        WireApi::OpenAiChat,
        &json!({
            "id": "chatcmpl-src",
            "object": "chat.completion.chunk",
            "created": 1,
            "model": "gpt-4o",
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]
        }),
    )
}

fn chat_usage(prompt: u64, completion: u64) -> WireStreamEvent {
    frame(
        WireApi::OpenAiChat,
        &json!({
            "id": "chatcmpl-src",
            "object": "chat.completion.chunk",
            "model": "gpt-4o",
            "choices": [],
            "usage": {"prompt_tokens": prompt, "completion_tokens": completion,
                      "total_tokens": prompt + completion}
        }),
    )
}

fn chat_tool_fragment(args: &str, first: bool) -> WireStreamEvent {
    let mut call = json!({"index": 0, "function": {"arguments": args}});
    if first {
        call["id"] = json!("call_weather");
        call["type"] = json!("function");
        call["function"]["name"] = json!("get_weather");
    }
    chat_chunk(json!({"tool_calls": [call]}), None)
}

fn anthropic(value: Value) -> WireStreamEvent {
    frame(WireApi::Anthropic, &value)
}

fn anthropic_message_start() -> WireStreamEvent {
    anthropic(json!({"type": "message_start", "message": {
        "id": "msg_src", "type": "message", "role": "assistant", "model": "claude-test",
        "content": [], "usage": {"input_tokens": 9, "output_tokens": 1}}}))
}

fn anthropic_end(stop_reason: &str) -> Vec<WireStreamEvent> {
    vec![
        anthropic(json!({"type": "message_delta", "delta": {"stop_reason": stop_reason},
            "usage": {"output_tokens": 7}})),
        anthropic(json!({"type": "message_stop"})),
    ]
}

fn anthropic_events(out: &[WireStreamEvent]) -> Vec<&AnthropicStreamEvent> {
    out.iter()
        .map(|e| match e {
            WireStreamEvent::Anthropic(event) => event,
            other => panic!("unexpected client event {other:?}"),
        })
        .collect()
}

fn responses_events(out: &[WireStreamEvent]) -> Vec<&ResponsesStreamEvent> {
    out.iter()
        .map(|e| match e {
            WireStreamEvent::Responses(event) => event,
            other => panic!("unexpected client event {other:?}"),
        })
        .collect()
}

fn accumulate(api: WireApi, out: &[WireStreamEvent]) -> WireResponse {
    let mut acc = WireAccumulator::new(api);
    for event in out {
        acc.push(event);
    }
    acc.final_response().expect("client stream is terminal")
}

fn text_chat_stream() -> Vec<WireStreamEvent> {
    vec![
        chat_chunk(json!({"role": "assistant"}), None),
        chat_chunk(json!({"content": "Hel"}), None),
        chat_chunk(json!({"content": "lo"}), None),
        chat_chunk(json!({}), Some("stop")),
        chat_usage(11, 2),
        chat_done(),
    ]
}

#[test]
fn text_stream_to_messages_keeps_each_delta() {
    let (out, transcoder) = run(WireApi::OpenAiChat, WireApi::Anthropic, &text_chat_stream());
    let events = anthropic_events(&out);

    let deltas: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            AnthropicStreamEvent::ContentBlockDelta {
                delta: AnthropicDelta::TextDelta { text },
                ..
            } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec!["Hel", "lo"]);

    let stops = events
        .iter()
        .filter(|e| matches!(e, AnthropicStreamEvent::MessageStop {}))
        .count();
    assert_eq!(stops, 1);
    assert!(matches!(events.last(), Some(AnthropicStreamEvent::MessageStop {})));

    let WireResponse::Anthropic(response) = accumulate(WireApi::Anthropic, &out) else {
        panic!("expected Messages response");
    };
    assert_eq!(
        response.content,
        vec![AnthropicContentBlock::Text { text: "Hello".into() }]
    );
    assert_eq!(response.stop_reason.as_deref(), Some("end_turn"));
    assert_eq!(transcoder.usage().input_tokens, 11);
    assert_eq!(transcoder.usage().output_tokens, 2);
}

#[test]
fn text_stream_to_responses_has_one_completed_event() {
    let mut source = vec![anthropic_message_start()];
    source.extend([
        anthropic(json!({"type": "content_block_start", "index": 0,
            "content_block": {"type": "text", "text": ""}})),
        anthropic(json!({"type": "content_block_delta", "index": 0,
            "delta": {"type": "text_delta", "text": "Hel"}})),
        anthropic(json!({"type": "content_block_delta", "index": 0,
            "delta": {"type": "text_delta", "text": "lo"}})),
        anthropic(json!({"type": "content_block_stop", "index": 0})),
    ]);
    source.extend(anthropic_end("end_turn"));

    let (out, _) = run(WireApi::Anthropic, WireApi::OpenAiResponses, &source);
    let events = responses_events(&out);

    let deltas: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ResponsesStreamEvent::OutputTextDelta { delta, .. } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec!["Hel", "lo"]);

    let sequence: Vec<u64> = events.iter().filter_map(|e| sequence_number(e)).collect();
    let expected: Vec<u64> = (0..sequence.len() as u64).collect();
    assert_eq!(sequence, expected);

    let terminals: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, ResponsesStreamEvent::ResponseCompleted { .. }))
        .collect();
    assert_eq!(terminals.len(), 1);
    let WireResponse::Responses(response) = accumulate(WireApi::OpenAiResponses, &out) else {
        panic!("expected Responses output");
    };
    assert_eq!(response.status.as_deref(), Some("completed"));
    assert!(matches!(
        &response.output[..],
        [ResponsesOutputItem::Message { content, .. }] if content.len() == 1
    ));
    assert_eq!(response.usage.as_ref().map(|u| u.output_tokens), Some(7));
}

fn sequence_number(event: &ResponsesStreamEvent) -> Option<u64> {
    let value = serde_json::to_value(event).ok()?;
    value.get("sequence_number").and_then(Value::as_u64)
}

#[test]
fn fragmented_tool_arguments_reassemble_for_messages_clients() {
    let source = vec![
        chat_chunk(json!({"role": "assistant"}), None),
        chat_tool_fragment("{\"loc", true),
        chat_tool_fragment("ation\":\"sf\"}", false),
        chat_chunk(json!({}), Some("tool_calls")),
        chat_done(),
    ];
    let (out, _) = run(WireApi::OpenAiChat, WireApi::Anthropic, &source);
    let WireResponse::Anthropic(response) = accumulate(WireApi::Anthropic, &out) else {
        panic!("expected Messages response");
    };
    assert_eq!(
        response.content,
        vec![AnthropicContentBlock::ToolUse {
            id: "call_weather".into(),
            name: "get_weather".into(),
            input: json!({"location": "sf"}),
        }]
    );
    assert_eq!(response.stop_reason.as_deref(), Some("tool_use"));
}

#[test]
fn fragmented_tool_arguments_reassemble_for_chat_clients() {
    let mut source = vec![anthropic_message_start()];
    source.extend([
        anthropic(json!({"type": "content_block_start", "index": 0,
            "content_block": {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {}}})),
        anthropic(json!({"type": "content_block_delta", "index": 0,
            "delta": {"type": "input_json_delta", "partial_json": "{\"loc"}})),
        anthropic(json!({"type": "content_block_delta", "index": 0,
            "delta": {"type": "input_json_delta", "partial_json": "ation\":\"sf\"}"}})),
        anthropic(json!({"type": "content_block_stop", "index": 0})),
    ]);
    source.extend(anthropic_end("tool_use"));

    let (out, _) = run(WireApi::Anthropic, WireApi::OpenAiChat, &source);
    assert_eq!(out.last(), Some(&WireStreamEvent::OpenAiChatDone));
    let WireResponse::OpenAiChat(response) = accumulate(WireApi::OpenAiChat, &out) else {
        panic!("expected Chat response");
    };
    let choice = &response.choices[0];
    assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
    let calls = choice.message.tool_calls.as_ref().expect("tool calls");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, "toolu_1");
    let args: Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
    assert_eq!(args, json!({"location": "sf"}));
}

#[test]
fn tool_fragment_that_never_parses_is_dropped() {
    let source = vec![
        chat_chunk(json!({"content": "Let me check."}), None),
        chat_tool_fragment("{\"loc", true),
        chat_chunk(json!({}), Some("tool_calls")),
        chat_done(),
    ];
    let (out, _) = run(WireApi::OpenAiChat, WireApi::Anthropic, &source);
    let events = anthropic_events(&out);
    assert!(!events.iter().any(|e| matches!(
        e,
        AnthropicStreamEvent::ContentBlockStart {
            content_block: AnthropicContentBlock::ToolUse { .. },
            ..
        }
    )));
    let WireResponse::Anthropic(response) = accumulate(WireApi::Anthropic, &out) else {
        panic!("expected Messages response");
    };
    assert_eq!(
        response.content,
        vec![AnthropicContentBlock::Text { text: "Let me check.".into() }]
    );
    assert_eq!(response.stop_reason.as_deref(), Some("end_turn"));
}

fn responses(value: Value) -> WireStreamEvent {
    frame(WireApi::OpenAiResponses, &value)
}

fn truncated_responses_tool_call() -> Vec<WireStreamEvent> {
    vec![
        responses(json!({"type": "response.created", "sequence_number": 0, "response": {
            "id": "resp_src", "object": "response", "model": "gpt-5", "status": "in_progress",
            "output": []}})),
        responses(json!({"type": "response.output_item.added", "sequence_number": 1,
            "output_index": 0, "item": {"type": "function_call", "id": "fc_src",
                "call_id": "call_weather", "name": "get_weather", "arguments": ""}})),
        responses(json!({"type": "response.function_call_arguments.delta", "sequence_number": 2,
            "item_id": "fc_src", "output_index": 0, "delta": "{\"loc"})),
    ]
}

#[test]
fn truncated_tool_arguments_reach_chat_clients_as_valid_json() {
    let (out, _) = run(WireApi::OpenAiResponses, WireApi::OpenAiChat, &truncated_responses_tool_call());
    assert_eq!(out.last(), Some(&WireStreamEvent::OpenAiChatDone));
    for event in &out {
        let WireStreamEvent::OpenAiChat(chunk) = event else {
            continue;
        };
        let fragments = chunk
            .choices
            .iter()
            .filter_map(|c| c.delta.tool_calls.as_ref())
            .flatten()
            .filter_map(|call| call.function.as_ref()?.arguments.as_deref());
        for fragment in fragments {
            assert!(!fragment.contains("loc"), "raw fragment reached the client: {fragment}");
        }
    }
    let WireResponse::OpenAiChat(response) = accumulate(WireApi::OpenAiChat, &out) else {
        panic!("expected Chat response");
    };
    let calls = response.choices[0].message.tool_calls.as_ref().expect("tool calls");
    assert_eq!(calls.len(), 1);
    let args: Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
    assert_eq!(args, json!({}));
}

#[test]
fn truncated_tool_arguments_reach_messages_clients_as_valid_json() {
    let (out, _) = run(WireApi::OpenAiResponses, WireApi::Anthropic, &truncated_responses_tool_call());
    let partials: Vec<&str> = anthropic_events(&out)
        .into_iter()
        .filter_map(|e| match e {
            AnthropicStreamEvent::ContentBlockDelta {
                delta: AnthropicDelta::InputJsonDelta { partial_json },
                ..
            } => Some(partial_json.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(partials, vec!["{}"]);
}

#[test]
fn finish_is_idempotent_after_truncation() {
    let truncated = vec![
        chat_chunk(json!({"role": "assistant"}), None),
        chat_chunk(json!({"content": "partial"}), None),
    ];
    let mut transcoder = StreamTranscoder::new(WireApi::OpenAiChat, WireApi::OpenAiResponses, envelope());
    let mut out = Vec::new();
    for event in &truncated {
        transcoder.push(event, &mut out);
    }
    transcoder.finish(&mut out);
    let after_first = out.len();
    transcoder.finish(&mut out);
    assert_eq!(out.len(), after_first);
    assert!(transcoder.is_finished());

    // late backend events are ignored once the client stream is closed
    transcoder.push(&chat_chunk(json!({"content": "late"}), None), &mut out);
    assert_eq!(out.len(), after_first);

    let terminals = responses_events(&out)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                ResponsesStreamEvent::ResponseCompleted { .. }
                    | ResponsesStreamEvent::ResponseIncomplete { .. }
            )
        })
        .count();
    assert_eq!(terminals, 1);
}

#[test]
fn identical_inputs_produce_identical_outputs() {
    for target in WireApi::ALL {
        let (first, _) = run(WireApi::OpenAiChat, target, &text_chat_stream());
        let (second, _) = run(WireApi::OpenAiChat, target, &text_chat_stream());
        let render = |events: &[WireStreamEvent]| -> Vec<String> {
            events.iter().map(|e| e.to_sse().unwrap()).collect()
        };
        assert_eq!(render(&first), render(&second), "target {target}");
    }
}

fn thinking_block(index: usize, text: &str, signature: Option<&str>) -> Vec<WireStreamEvent> {
    let mut events = vec![
        anthropic(json!({"type": "content_block_start", "index": index,
            "content_block": {"type": "thinking", "thinking": ""}})),
        anthropic(json!({"type": "content_block_delta", "index": index,
            "delta": {"type": "thinking_delta", "thinking": text}})),
    ];
    if let Some(signature) = signature {
        events.push(anthropic(json!({"type": "content_block_delta", "index": index,
            "delta": {"type": "signature_delta", "signature": signature}})));
    }
    events.push(anthropic(json!({"type": "content_block_stop", "index": index})));
    events
}

#[test]
fn reasoning_blocks_group_by_trailing_signature() {
    let mut source = vec![anthropic_message_start()];
    source.extend(thinking_block(0, "first", Some("sig-a")));
    source.extend(thinking_block(1, "second", Some("sig-b")));
    source.extend(thinking_block(2, "third", None));
    source.extend(thinking_block(3, " fourth", None));
    source.extend(anthropic_end("end_turn"));

    let (out, _) = run(WireApi::Anthropic, WireApi::OpenAiResponses, &source);
    let events = responses_events(&out);

    let deltas: Vec<(usize, &str)> = events
        .iter()
        .filter_map(|e| match e {
            ResponsesStreamEvent::ReasoningSummaryTextDelta {
                summary_index, delta, ..
            } => Some((*summary_index, delta.as_str())),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec![(0, "first"), (1, "second"), (2, "third"), (2, " fourth")]);

    let Some(ResponsesStreamEvent::ResponseCompleted { response, .. }) = events.last().copied() else {
        panic!("expected response.completed");
    };
    let [ResponsesOutputItem::Reasoning {
        summary,
        encrypted_content,
        ..
    }] = &response.output[..]
    else {
        panic!("expected a single reasoning item, got {:?}", response.output);
    };
    // distinct signatures stay apart; unsigned blocks share one group
    assert_eq!(
        summary,
        &vec![
            ResponsesSummaryPart::SummaryText { text: "first".into() },
            ResponsesSummaryPart::SummaryText { text: "second".into() },
            ResponsesSummaryPart::SummaryText { text: "third fourth".into() },
        ]
    );
    assert_eq!(encrypted_content.as_deref(), Some("sig-b"));
}

#[test]
fn truncated_thinking_block_is_flushed_at_finish() {
    let source = vec![
        anthropic_message_start(),
        anthropic(json!({"type": "content_block_start", "index": 0,
            "content_block": {"type": "thinking", "thinking": ""}})),
        anthropic(json!({"type": "content_block_delta", "index": 0,
            "delta": {"type": "thinking_delta", "thinking": "cut"}})),
    ];
    let (out, _) = run(WireApi::Anthropic, WireApi::OpenAiResponses, &source);
    let Some(ResponsesStreamEvent::ResponseIncomplete { response, .. }) =
        responses_events(&out).last().copied()
    else {
        panic!("expected response.incomplete");
    };
    let [ResponsesOutputItem::Reasoning { summary, .. }] = &response.output[..] else {
        panic!("expected a single reasoning item, got {:?}", response.output);
    };
    assert_eq!(summary, &vec![ResponsesSummaryPart::SummaryText { text: "cut".into() }]);
}
