//! Unit tests for chat-completions API types.

use super::*;

#[test]
fn test_message_constructors() {
    let system = Message::system("You are a quant");
    assert_eq!(system.role, MessageRole::System);
    assert_eq!(system.content, "You are a quant");

    let user = Message::user("Sharpe of AAPL?");
    assert_eq!(user.role, MessageRole::User);
}

#[test]
fn test_chat_request_serialization_skips_unset_options() {
    let req = ChatRequest::new("gpt-4o-mini", vec![Message::user("hi")]);
    let json = serde_json::to_value(&req).unwrap();
    assert_eq!(json["model"], "gpt-4o-mini");
    assert_eq!(json["messages"][0]["role"], "user");
    assert!(json.get("temperature").is_none());
    assert!(json.get("max_tokens").is_none());
}

#[test]
fn test_chat_request_builders() {
    let req = ChatRequest::new("m", vec![])
        .with_temperature(0.1)
        .with_max_tokens(512);
    assert_eq!(req.temperature, Some(0.1));
    assert_eq!(req.max_tokens, Some(512));
}

#[test]
fn test_chat_response_deserialization() {
    let json = r#"{
        "id": "chatcmpl-1",
        "model": "gpt-4o-mini",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "print(1)"}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
    }"#;
    let resp: ChatResponse = serde_json::from_str(json).unwrap();
    assert_eq!(resp.first_content(), Some("print(1)"));
    assert_eq!(resp.usage.unwrap().total_tokens, Some(15));
}

#[test]
fn test_chat_response_without_usage() {
    let json = r#"{"choices": []}"#;
    let resp: ChatResponse = serde_json::from_str(json).unwrap();
    assert!(resp.first_content().is_none());
    assert!(resp.usage.is_none());
}

#[test]
fn test_generation_with_usage() {
    let generation = Generation::new("x").with_usage(Usage {
        prompt_tokens: Some(1),
        completion_tokens: Some(2),
        total_tokens: Some(3),
    });
    assert_eq!(generation.content, "x");
    assert_eq!(generation.usage.unwrap().completion_tokens, Some(2));
}
