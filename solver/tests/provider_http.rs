//! Provider client against a mock HTTP server.
//!
//! Covers the retry taxonomy end to end: transient 5xx, 429 with
//! `retry-after`, hard quota, and authentication failures.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use solver::core::reply::ReplyKind;
use solver::core::types::Message;
use solver::io::config::{ProviderKind, ProviderSection, RateLimitConfig, RetryConfig};
use solver::io::provider::client::ProviderClient;
use solver::io::provider::rate_limit::ProviderLimiter;
use solver::io::provider::{GenerationOptions, ProviderError, build_provider};

fn client(server: &MockServer, kind: ProviderKind, max_attempts: u32) -> ProviderClient {
    let section = ProviderSection {
        id: kind,
        base_url: Some(server.uri()),
        model: Some("test-model".to_string()),
        ..ProviderSection::default()
    };
    let config = section.resolve_with_credential("test-key".to_string());
    let provider = build_provider(&config).expect("provider");
    let limiter = Arc::new(ProviderLimiter::new(&RateLimitConfig {
        requests_per_minute: 6_000,
        burst: 100,
    }));
    ProviderClient::new(
        provider,
        limiter,
        max_attempts,
        RetryConfig {
            base_delay_ms: 1,
            max_delay_ms: 10,
            max_total_wait_ms: 10_000,
        },
    )
}

fn options() -> GenerationOptions {
    GenerationOptions {
        temperature: 0.2,
        max_tokens: 256,
        timeout: Duration::from_secs(5),
    }
}

fn conversation() -> Vec<Message> {
    vec![
        Message::system("You solve challenges."),
        Message::user("Find the flag."),
    ]
}

fn chat_ok(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "model": "test-model",
        "choices": [{"message": {"role": "assistant", "content": content}}]
    }))
}

async fn mount_failures(server: &MockServer, status: u16, times: u64) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(status).set_body_string("upstream unavailable"))
        .up_to_n_times(times)
        .mount(server)
        .await;
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let server = MockServer::start().await;
    mount_failures(&server, 500, 2).await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(chat_ok("hello"))
        .mount(&server)
        .await;

    let client = client(&server, ProviderKind::DeepSeek, 4);
    let completion = client
        .send(&conversation(), &options(), &CancellationToken::new())
        .await
        .expect("completion");

    assert_eq!(completion.text, "hello");
    let outcomes: Vec<String> = client.attempts().into_iter().map(|a| a.outcome).collect();
    assert_eq!(outcomes, vec!["transient", "transient", "ok"]);
    let received = server.received_requests().await.expect("recording");
    assert_eq!(received.len(), 3);
}

#[tokio::test]
async fn transient_failures_stop_after_max_attempts() {
    let server = MockServer::start().await;
    mount_failures(&server, 503, 10).await;

    let client = client(&server, ProviderKind::OpenAi, 3);
    let err = client
        .send(&conversation(), &options(), &CancellationToken::new())
        .await
        .expect_err("should fail");

    assert!(matches!(err, ProviderError::Transient { status: Some(503), .. }));
    assert_eq!(client.attempts().len(), 3);
    let received = server.received_requests().await.expect("recording");
    assert_eq!(received.len(), 3);
}

#[tokio::test]
async fn auth_failure_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({"error": {"message": "invalid api key"}})),
        )
        .mount(&server)
        .await;

    let client = client(&server, ProviderKind::DeepSeek, 4);
    let err = client
        .send(&conversation(), &options(), &CancellationToken::new())
        .await
        .expect_err("should fail");

    assert_eq!(
        err,
        ProviderError::Auth {
            status: 401,
            message: "invalid api key".to_string()
        }
    );
    assert_eq!(server.received_requests().await.expect("recording").len(), 1);
}

#[tokio::test]
async fn rate_limit_honours_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(chat_ok("after waiting"))
        .mount(&server)
        .await;

    let client = client(&server, ProviderKind::DeepSeek, 3);
    let started = Instant::now();
    let completion = client
        .send(&conversation(), &options(), &CancellationToken::new())
        .await
        .expect("completion");

    assert_eq!(completion.text, "after waiting");
    assert!(started.elapsed() >= Duration::from_millis(900));
    let attempts = client.attempts();
    assert_eq!(attempts[0].outcome, "rate_limited");
    assert_eq!(attempts[0].backoff_ms, Some(1_000));
}

#[tokio::test]
async fn hard_quota_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {"message": "You exceeded your current quota", "type": "insufficient_quota"}
        })))
        .mount(&server)
        .await;

    let client = client(&server, ProviderKind::OpenAi, 4);
    let err = client
        .send(&conversation(), &options(), &CancellationToken::new())
        .await
        .expect_err("should fail");

    assert!(matches!(err, ProviderError::QuotaExceeded { .. }));
    assert_eq!(client.attempts().len(), 1);
}

#[tokio::test]
async fn garbled_success_body_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(chat_ok("recovered"))
        .mount(&server)
        .await;

    let client = client(&server, ProviderKind::DeepSeek, 3);
    let completion = client
        .send(&conversation(), &options(), &CancellationToken::new())
        .await
        .expect("completion");
    assert_eq!(completion.text, "recovered");
    assert_eq!(client.attempts()[0].outcome, "transient");
}

#[tokio::test]
async fn anthropic_backend_parses_text_blocks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(header("x-api-key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "test-model",
            "content": [
                {"type": "text", "text": "{\"type\":\"flag\","},
                {"type": "text", "text": "\"flag\":\"picoCTF{wire}\"}"}
            ]
        })))
        .mount(&server)
        .await;

    let client = client(&server, ProviderKind::Anthropic, 2);
    let exchange = client
        .request_reply(&conversation(), &options(), &CancellationToken::new(), &|e: &str| {
            format!("fix: {e}")
        })
        .await;

    let reply = exchange.outcome.expect("reply");
    assert_eq!(reply.kind, ReplyKind::Flag("picoCTF{wire}".to_string()));
    assert_eq!(exchange.messages.len(), 1);
}

#[tokio::test]
async fn cancellation_stops_retrying() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
        .mount(&server)
        .await;

    let client = client(&server, ProviderKind::DeepSeek, 5);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = client
        .send(&conversation(), &options(), &cancel)
        .await
        .expect_err("cancelled");
    assert_eq!(err, ProviderError::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(client.attempts().len(), 1);
}
