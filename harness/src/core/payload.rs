//! Chat request construction and response parsing
//!
//! The gateway speaks the OpenAI chat-completions shape; this module builds
//! one request per test case (case-level sampling overrides win on key
//! collision) and extracts the reply text plus the metadata the result
//! record captures.

use crate::config::ExecutorConfig;
use crate::error::{HarnessError, HarnessResult};
use serde_json::{json, Value};
use shared::TestCase;

/// A well-formed reply extracted from a gateway response body
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub text: String,
    pub model: Option<String>,
    pub finish_reason: Option<String>,
    pub total_tokens: Option<u64>,
}

impl ChatReply {
    /// Empty replies and length-limited stops count as truncated
    pub fn truncated(&self) -> bool {
        self.text.trim().is_empty()
            || matches!(self.finish_reason.as_deref(), Some("length") | Some("max_tokens"))
    }
}

/// Build the request payload for one case. The system message is included
/// only when non-empty; case sampling overrides are applied last so they
/// win over the executor defaults.
pub fn build_chat_payload(case: &TestCase, config: &ExecutorConfig) -> Value {
    let mut messages = Vec::new();

    if let Some(system) = &case.system_prompt {
        if !system.trim().is_empty() {
            messages.push(json!({ "role": "system", "content": system }));
        }
    }
    messages.push(json!({ "role": "user", "content": case.user_prompt }));

    let mut payload = serde_json::Map::new();
    payload.insert("model".to_string(), Value::String(case.model_id.clone()));
    payload.insert("messages".to_string(), Value::Array(messages));
    payload.insert("max_tokens".to_string(), json!(config.max_tokens));
    payload.insert("temperature".to_string(), json!(config.temperature));

    // Override wins on collision, including over model/max_tokens/temperature
    for (key, value) in &case.overrides.sampling {
        payload.insert(key.clone(), value.clone());
    }

    Value::Object(payload)
}

/// Extract the reply from a response body. A body missing the expected
/// structure is a transient failure: gateways under load are known to emit
/// partial bodies that succeed on retry.
pub fn parse_chat_reply(body: &Value) -> HarnessResult<ChatReply> {
    let choice = body
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| HarnessError::transient("response body has no choices"))?;

    let text = choice
        .pointer("/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| HarnessError::transient("response choice has no message content"))?
        .to_string();

    Ok(ChatReply {
        text,
        model: body.get("model").and_then(Value::as_str).map(str::to_string),
        finish_reason: choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(str::to_string),
        total_tokens: body.pointer("/usage/total_tokens").and_then(Value::as_u64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::CaseOverrides;

    fn case(system: Option<&str>) -> TestCase {
        TestCase {
            company: "LMSYS".to_string(),
            model_id: "vicuna-7b".to_string(),
            category: "chat".to_string(),
            prompting_style: "single shot".to_string(),
            theme: "greeting".to_string(),
            system_prompt: system.map(str::to_string),
            user_prompt: "Hello, how are you?".to_string(),
            expected_behavior: None,
            overrides: CaseOverrides::default(),
        }
    }

    #[test]
    fn system_prompt_included_only_when_non_empty() {
        let config = ExecutorConfig::default();

        let with_system = build_chat_payload(&case(Some("You are helpful.")), &config);
        assert_eq!(with_system["messages"].as_array().unwrap().len(), 2);
        assert_eq!(with_system["messages"][0]["role"], "system");

        let blank_system = build_chat_payload(&case(Some("   ")), &config);
        assert_eq!(blank_system["messages"].as_array().unwrap().len(), 1);

        let no_system = build_chat_payload(&case(None), &config);
        assert_eq!(no_system["messages"][0]["role"], "user");
    }

    #[test]
    fn sampling_overrides_win_on_collision() {
        let config = ExecutorConfig::default();
        let mut case = case(None);
        case.overrides.sampling.insert("temperature".to_string(), json!(0.0));
        case.overrides.sampling.insert("top_p".to_string(), json!(0.9));

        let payload = build_chat_payload(&case, &config);
        assert_eq!(payload["temperature"], json!(0.0));
        assert_eq!(payload["top_p"], json!(0.9));
        assert_eq!(payload["max_tokens"], json!(config.max_tokens));
    }

    #[test]
    fn parses_well_formed_reply() {
        let body = json!({
            "model": "vicuna-7b",
            "choices": [{
                "message": { "role": "assistant", "content": "Hi there!" },
                "finish_reason": "stop"
            }],
            "usage": { "total_tokens": 12 }
        });

        let reply = parse_chat_reply(&body).unwrap();
        assert_eq!(reply.text, "Hi there!");
        assert_eq!(reply.total_tokens, Some(12));
        assert!(!reply.truncated());
    }

    #[test]
    fn malformed_body_is_transient() {
        let err = parse_chat_reply(&json!({ "choices": [] })).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn length_stops_are_truncated() {
        let body = json!({
            "choices": [{
                "message": { "content": "partial" },
                "finish_reason": "length"
            }]
        });
        assert!(parse_chat_reply(&body).unwrap().truncated());

        let empty = json!({
            "choices": [{ "message": { "content": "" }, "finish_reason": "stop" }]
        });
        assert!(parse_chat_reply(&empty).unwrap().truncated());
    }
}
