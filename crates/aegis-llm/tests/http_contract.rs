//! HTTP contract tests for the language-model client

use aegis_common::config::LlmConfig;
use aegis_llm::{HttpLlmClient, LlmBackend, LlmRequest, StructuredClient};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Deserialize)]
struct Verdict {
    verdict: String,
    confidence: f64,
}

fn config_for(server: &MockServer) -> LlmConfig {
    LlmConfig {
        endpoint: format!("{}/api/chat", server.uri()),
        model: "test-model".to_string(),
        api_key: None,
        timeout_seconds: 5,
        max_retries: 1,
        temperature: 0.0,
    }
}

fn request() -> LlmRequest {
    LlmRequest::new(
        "you are a reliability analyst",
        "classify this fault",
        json!({"type": "object", "required": ["verdict", "confidence"]}),
    )
}

#[tokio::test]
async fn accepts_direct_schema_object() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"verdict": "oom", "confidence": 0.9})),
        )
        .mount(&server)
        .await;

    let client = HttpLlmClient::new(config_for(&server)).unwrap();
    let value = client.complete(&request()).await.unwrap();
    assert_eq!(value["verdict"], "oom");
}

#[tokio::test]
async fn accepts_chat_envelope_with_fenced_json() {
    let server = MockServer::start().await;
    let content = "Analysis follows.\n```json\n{\"verdict\": \"crashloop\", \"confidence\": 0.8}\n```";
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": {"role": "assistant", "content": content}
        })))
        .mount(&server)
        .await;

    let client = HttpLlmClient::new(config_for(&server)).unwrap();
    let structured = StructuredClient::new(Arc::new(client), 1);
    let verdict: Verdict = structured.complete_structured(&request()).await.unwrap();
    assert_eq!(verdict.verdict, "crashloop");
    assert!(verdict.confidence > 0.7);
}

#[tokio::test]
async fn retries_once_on_malformed_output() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": {"content": "not json at all"}
        })))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"verdict": "ok", "confidence": 1.0})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpLlmClient::new(config_for(&server)).unwrap();
    let structured = StructuredClient::new(Arc::new(client), 1);
    let verdict: Verdict = structured.complete_structured(&request()).await.unwrap();
    assert_eq!(verdict.verdict, "ok");
}

#[tokio::test]
async fn surfaces_backend_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
        .mount(&server)
        .await;

    let client = HttpLlmClient::new(config_for(&server)).unwrap();
    let err = client.complete(&request()).await.unwrap_err();
    assert_eq!(err.category(), "external_tool");
}

#[tokio::test]
async fn exhausted_retries_report_validation_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": {"content": "still not json"}
        })))
        .mount(&server)
        .await;

    let client = HttpLlmClient::new(config_for(&server)).unwrap();
    let structured = StructuredClient::new(Arc::new(client), 1);
    let err = structured
        .complete_structured::<Verdict>(&request())
        .await
        .unwrap_err();
    assert_eq!(err.category(), "validation");
}
