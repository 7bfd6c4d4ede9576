use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use protocol_bridge::config::{parse_config, AppConfig};
use protocol_bridge::error::{format_error, CanonicalError};
use protocol_bridge::protocol::canonical::WireApi;
use protocol_bridge::state::{ModelInfoSource, StaticModelInfo};
use protocol_bridge::translate::{Translator, WireRequest};
use uuid::Uuid;

const CONFIG: &str = r"
translation:
  propagate_unsupported_params: false
models:
  anthropic:
    - claude-sonnet-4-5-20250929
    - claude-opus-4-1-20250805
  openai_chat:
    - gpt-4o
  aliases:
    sonnet: claude-sonnet-4-5
";

fn config(propagate: bool) -> AppConfig {
    let mut config = parse_config(CONFIG).expect("valid config");
    config.translation.propagate_unsupported_params = propagate;
    config
}

fn chat_request(model: &str, extra: serde_json::Value) -> WireRequest {
    let mut body = json!({
        "model": model,
        "messages": [{"role": "user", "content": "Give me three names."}],
        "temperature": 0.7
    });
    if let (Some(body), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
        body.extend(extra.clone());
    }
    WireRequest::from_json(WireApi::OpenAiChat, body).expect("valid chat request")
}

#[test]
fn multiple_candidates_rejected_under_strict_policy() {
    let translator = Translator::new(&config(false), None);
    let request = chat_request("sonnet", json!({"n": 3, "seed": 7}));

    let err = translator
        .translate_request_with_id(&request, WireApi::Anthropic, Uuid::from_u128(1))
        .unwrap_err();
    let CanonicalError::UnsupportedParameters { target, params } = &err else {
        panic!("expected UnsupportedParameters, got {err:?}");
    };
    assert_eq!(*target, WireApi::Anthropic);
    let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["n", "seed"]);

    let (status, body) = format_error(&err, WireApi::OpenAiChat);
    assert_eq!(status.as_u16(), 400);
    assert!(body["error"]["message"].as_str().unwrap().contains("`n`"));
}

#[test]
fn multiple_candidates_stripped_under_permissive_policy() {
    let translator = Translator::new(&config(true), None);
    let request = chat_request("sonnet", json!({"n": 3}));

    let translated = translator
        .translate_request_with_id(&request, WireApi::Anthropic, Uuid::from_u128(2))
        .expect("permissive translation succeeds");
    let names: Vec<&str> = translated.dropped_params.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["n"]);

    let body = translated.request.to_json().unwrap();
    assert!(body.get("n").is_none());
    assert_eq!(body["model"], "claude-sonnet-4-5-20250929");
    assert_eq!(body["temperature"], 0.7);
}

#[test]
fn single_candidate_is_not_a_violation() {
    let translator = Translator::new(&config(false), None);
    let request = chat_request("sonnet", json!({"n": 1}));
    let translated = translator
        .translate_request(&request, WireApi::Anthropic)
        .expect("n=1 is the default");
    assert!(translated.dropped_params.is_empty());
}

#[test]
fn alias_resolves_and_unknown_model_lists_allowlist() {
    let translator = Translator::new(&config(false), None);

    let translated = translator
        .translate_request(&chat_request("Sonnet", json!({})), WireApi::Anthropic)
        .unwrap();
    let WireRequest::Anthropic(wire) = &translated.request else {
        panic!("expected Messages request");
    };
    assert_eq!(wire.model, "claude-sonnet-4-5-20250929");
    assert_eq!(translated.envelope.model, "Sonnet");

    let err = translator
        .translate_request(&chat_request("claude-nonexistent", json!({})), WireApi::Anthropic)
        .unwrap_err();
    let CanonicalError::UnsupportedModel { requested, available } = &err else {
        panic!("expected UnsupportedModel, got {err:?}");
    };
    assert_eq!(requested, "claude-nonexistent");
    assert_eq!(
        available,
        &vec![
            "claude-sonnet-4-5-20250929".to_string(),
            "claude-opus-4-1-20250805".to_string(),
        ]
    );
    let (status, _) = format_error(&err, WireApi::Anthropic);
    assert!(status.is_client_error());
}

#[test]
fn dynamic_model_info_widens_allowlist_and_sets_max_tokens() {
    let mut config = config(true);
    config.models.enable_dynamic_model_info = true;
    config.models.model_refresh_ttl_secs = 0;
    let source: Arc<dyn ModelInfoSource> = Arc::new(StaticModelInfo {
        models: vec!["claude-haiku-5-20260101".into()],
        max_output_tokens: BTreeMap::from([("claude-haiku-5-20260101".to_string(), 64_000)]),
    });
    let translator = Translator::new(&config, Some(source));

    let translated = translator
        .translate_request(&chat_request("claude-haiku-5", json!({})), WireApi::Anthropic)
        .unwrap();
    let WireRequest::Anthropic(wire) = &translated.request else {
        panic!("expected Messages request");
    };
    assert_eq!(wire.model, "claude-haiku-5-20260101");
    assert_eq!(wire.max_tokens, 64_000);

    // the live list replaces the static one
    let err = translator
        .translate_request(&chat_request("claude-opus-4-1", json!({})), WireApi::Anthropic)
        .unwrap_err();
    assert!(matches!(err, CanonicalError::UnsupportedModel { .. }));
}

#[test]
fn chat_client_fields_do_not_leak_to_responses_backend() {
    let translator = Translator::new(&AppConfig::default(), None);
    let request = chat_request(
        "gpt-5",
        json!({"service_tier": "flex", "response_format": {"type": "json_object"}}),
    );
    let translated = translator
        .translate_request(&request, WireApi::OpenAiResponses)
        .unwrap();
    let body = translated.request.to_json().unwrap();
    assert!(body.get("service_tier").is_none());
    assert!(body.get("response_format").is_none());
    assert_eq!(body["text"]["format"]["type"], "json_object");
}
