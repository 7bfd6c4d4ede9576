use serde_json::json;
use protocol_bridge::protocol::canonical::{
    CanonicalPart, CanonicalRequest, CanonicalResponse, CanonicalStopReason, CanonicalToolChoice,
    WireApi,
};
use protocol_bridge::protocol::envelope::RequestEnvelope;
use protocol_bridge::protocol::{anthropic, openai_chat, openai_responses};
use protocol_bridge::protocol::usage::UsageSnapshot;
use protocol_bridge::translate::{decode_request, decode_response, encode_request, encode_response};
use uuid::Uuid;

fn client_openai_chat_request() -> CanonicalRequest {
    let wire: openai_chat::OpenAiChatRequest = serde_json::from_value(json!({
        "model": "client-model",
        "messages": [
            {"role":"system","content":"You are helpful."},
            {"role":"user","content":"What's the weather in SF?"},
            {
                "role":"assistant",
                "content": null,
                "tool_calls": [{
                    "id":"call_1",
                    "type":"function",
                    "function":{"name":"get_weather","arguments":"{\"city\":\"SF\"}"}
                }]
            },
            {"role":"tool","tool_call_id":"call_1","content":"{\"temp\":72}"}
        ],
        "tools": [{
            "type":"function",
            "function":{
                "name":"get_weather",
                "description":"Get weather",
                "parameters":{
                    "type":"object",
                    "properties":{"city":{"type":"string"}},
                    "required":["city"]
                }
            }
        }],
        "tool_choice":{"type":"function","function":{"name":"get_weather"}}
    }))
    .expect("openai chat wire parse");
    openai_chat::decoder::decode_openai_chat_request(&wire, Uuid::from_u128(1))
        .expect("openai decode")
}

fn client_openai_responses_request() -> CanonicalRequest {
    let wire: openai_responses::ResponsesRequest = serde_json::from_value(json!({
        "model": "client-model",
        "instructions": "You are helpful.",
        "input": [
            {
                "type":"message",
                "role":"user",
                "content":[{"type":"input_text","text":"What's the weather in SF?"}]
            },
            {
                "type":"function_call",
                "id":"fc_1",
                "call_id":"call_1",
                "name":"get_weather",
                "arguments":"{\"city\":\"SF\"}"
            },
            {
                "type":"function_call_output",
                "call_id":"call_1",
                "output":"{\"temp\":72}"
            }
        ],
        "tools": [{
            "type":"function",
            "name":"get_weather",
            "description":"Get weather",
            "parameters":{
                "type":"object",
                "properties":{"city":{"type":"string"}},
                "required":["city"]
            }
        }],
        "tool_choice":{"type":"function","name":"get_weather"},
        "parallel_tool_calls": false
    }))
    .expect("openai responses wire parse");
    openai_responses::decoder::decode_responses_request(&wire, Uuid::from_u128(1))
        .expect("responses decode")
}

fn client_anthropic_request() -> CanonicalRequest {
    let wire: anthropic::AnthropicRequest = serde_json::from_value(json!({
        "model": "claude-sonnet-4-5",
        "max_tokens": 1024,
        "system": "You are helpful.",
        "messages": [
            {"role":"user","content":[{"type":"text","text":"What's the weather in SF?"}]},
            {"role":"assistant","content":[{"type":"tool_use","id":"call_1","name":"get_weather","input":{"city":"SF"}}]},
            {"role":"user","content":[{"type":"tool_result","tool_use_id":"call_1","content":"{\"temp\":72}"}]}
        ],
        "tools": [{
            "name":"get_weather",
            "description":"Get weather",
            "input_schema":{
                "type":"object",
                "properties":{"city":{"type":"string"}},
                "required":["city"]
            }
        }],
        "tool_choice":{"type":"tool","name":"get_weather"}
    }))
    .expect("anthropic wire parse");
    anthropic::decoder::decode_anthropic_request(&wire, Uuid::from_u128(1))
        .expect("anthropic decode")
}

fn roundtrip_request_via(request: &CanonicalRequest, api: WireApi) -> CanonicalRequest {
    let wire = encode_request(request, api).expect("encode");
    decode_request(&wire, Uuid::from_u128(1)).expect("decode")
}

fn assert_request_tool_semantics(request: &CanonicalRequest) {
    assert!(
        request.messages.iter().any(|msg| msg
            .parts
            .iter()
            .any(|part| matches!(part, CanonicalPart::Text(text) if !text.is_empty()))),
        "expected at least one text part"
    );
    assert!(
        request
            .messages
            .iter()
            .any(|msg| msg.parts.iter().any(|part| matches!(
                part,
                CanonicalPart::ToolCall { name, .. } if name == "get_weather"
            ))),
        "expected tool call for get_weather"
    );
    assert!(
        request.messages.iter().any(|msg| msg
            .parts
            .iter()
            .any(|part| matches!(part, CanonicalPart::ToolResult { .. }))),
        "expected at least one tool result"
    );
    assert!(
        request
            .tools
            .iter()
            .any(|tool| tool.function.name == "get_weather"),
        "expected get_weather tool declaration"
    );
    assert!(
        !matches!(request.tool_choice, CanonicalToolChoice::None),
        "tool_choice should keep tool-enabled semantics"
    );
}

fn base_canonical_response() -> CanonicalResponse {
    CanonicalResponse {
        id: "resp_matrix".to_string(),
        model: "test-model".to_string(),
        content: vec![
            CanonicalPart::Text("Let me check.".to_string()),
            CanonicalPart::ToolCall {
                id: "call_1".to_string(),
                name: "get_weather".to_string(),
                arguments: serde_json::value::RawValue::from_string(
                    "{\"city\":\"SF\"}".to_string(),
                )
                .expect("raw args"),
            },
        ],
        stop_reason: CanonicalStopReason::ToolCalls,
        usage: UsageSnapshot {
            input_tokens: 20,
            output_tokens: 8,
            ..UsageSnapshot::default()
        },
    }
}

fn assert_response_tool_semantics(response: &CanonicalResponse) {
    assert!(
        response.content.iter().any(|part| {
            matches!(
                part,
                CanonicalPart::ToolCall { name, .. } if name == "get_weather"
            )
        }),
        "expected tool call part in response"
    );
    assert_eq!(response.stop_reason, CanonicalStopReason::ToolCalls);
}

#[test]
fn test_request_matrix_3x3_tool_flow() {
    let client_cases = vec![
        client_openai_chat_request(),
        client_openai_responses_request(),
        client_anthropic_request(),
    ];

    for client_request in client_cases {
        assert_request_tool_semantics(&client_request);
        for api in WireApi::ALL {
            let roundtripped = roundtrip_request_via(&client_request, api);
            assert_request_tool_semantics(&roundtripped);
        }
    }
}

#[test]
fn test_response_matrix_across_client_formats() {
    let canonical = base_canonical_response();
    let envelope = RequestEnvelope::for_model(Uuid::from_u128(7), "client-model", 1_700_000_000);

    for api in WireApi::ALL {
        let wire = encode_response(&canonical, &envelope, api).expect("encode");
        assert_eq!(wire.api(), api);
        let back = decode_response(&wire).expect("decode");
        assert_response_tool_semantics(&back);
        assert_eq!(back.usage.input_tokens, 20, "{api}");
        assert_eq!(back.usage.output_tokens, 8, "{api}");
    }
}

#[test]
fn test_response_ids_follow_envelope() {
    let canonical = base_canonical_response();
    let envelope = RequestEnvelope::for_model(Uuid::from_u128(7), "client-model", 1_700_000_000);

    let chat = encode_response(&canonical, &envelope, WireApi::OpenAiChat)
        .unwrap()
        .to_json()
        .unwrap();
    assert_eq!(chat["id"], envelope.chat_completion_id());
    assert_eq!(chat["model"], "client-model");
    assert_eq!(chat["created"], 1_700_000_000);

    let messages = encode_response(&canonical, &envelope, WireApi::Anthropic)
        .unwrap()
        .to_json()
        .unwrap();
    assert_eq!(messages["id"], envelope.anthropic_message_id());
    assert_eq!(messages["stop_reason"], "tool_use");

    let responses = encode_response(&canonical, &envelope, WireApi::OpenAiResponses)
        .unwrap()
        .to_json()
        .unwrap();
    assert_eq!(responses["id"], envelope.response_id.as_str());
    assert_eq!(responses["status"], "completed");
}
