use std::time::{Duration, Instant};

use serde_json::json;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use llm_cascade::{
  CircuitBreakerConfig, CircuitState, CompletionClient, EndpointClient
, EndpointConfig, Error, FallbackRouter, Message, RetryPolicy
, RouterConfig
};

const CHAT_PATH: &str = "/v1/chat/completions";

fn init_logging()
{   let _ = env_logger::builder().is_test(true).try_init();
}

fn success_body(text: &str) -> serde_json::Value
{   json!({
      "choices": [{"message": {"role": "assistant", "content": text}}],
      "model": "mock-model",
      "usage": {"prompt_tokens": 7, "completion_tokens": 2}
    })
}

fn error_body(message: &str, error_type: &str) -> serde_json::Value
{   json!({"error": {"message": message, "type": error_type, "code": null}})
}

fn endpoint_config(name: &str, server: &MockServer) -> EndpointConfig
{   EndpointConfig::new(name, "mock-model")
      .with_address(format!("{}{}", server.uri(), CHAT_PATH))
}

/// Endpoint client with a fast backoff so retry tests stay quick
fn endpoint(name: &str, server: &MockServer) -> EndpointClient
{   EndpointClient::new(endpoint_config(name, server))
      .unwrap()
      .with_retry_policy(RetryPolicy::new(Duration::from_millis(10)))
}

fn router(servers: &[(&str, &MockServer)]) -> FallbackRouter
{   let endpoints = servers
      .iter()
      .map(|(name, server)| (name.to_string(), endpoint(name, server)))
      .collect();
    FallbackRouter::new(endpoints, CircuitBreakerConfig::default()).unwrap()
}

async fn mount_status(server: &MockServer, status: u16, expected_calls: u64)
{   Mock::given(method("POST"))
      .and(path(CHAT_PATH))
      .respond_with(
        ResponseTemplate::new(status)
          .set_body_json(error_body("backend says no", "server_error"))
      )
      .expect(expected_calls)
      .mount(server)
      .await;
}

async fn mount_success(server: &MockServer, text: &str, expected_calls: u64)
{   Mock::given(method("POST"))
      .and(path(CHAT_PATH))
      .respond_with(ResponseTemplate::new(200).set_body_json(success_body(text)))
      .expect(expected_calls)
      .mount(server)
      .await;
}

// ===== Endpoint Client =====

#[tokio::test]
async fn test_endpoint_sends_wire_request()
{   init_logging();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path(CHAT_PATH))
      .and(header("authorization", "Bearer secret-key"))
      .and(body_partial_json(json!({
        "model": "mock-model",
        "messages": [
          {"role": "system", "content": "be terse"},
          {"role": "user", "content": "hello"}
        ],
        "max_tokens": 256
      })))
      .respond_with(ResponseTemplate::new(200).set_body_json(success_body("hi")))
      .expect(1)
      .mount(&server)
      .await;

    let client = EndpointClient::new(
      endpoint_config("primary", &server)
        .with_api_key("secret-key")
        .with_max_tokens(256)
    ).unwrap();
    let cancel = CancellationToken::new();
    let messages = [Message::system("be terse"), Message::user("hello")];

    let result = assert_ok!(client.complete(&messages, &cancel).await);
    assert_eq!(result.backend, "primary");
    assert_eq!(result.model, "mock-model");
    assert_eq!(result.text(), Some("hi"));
    assert_eq!(result.usage.input_tokens, 7);
    assert_eq!(result.usage.output_tokens, 2);
}

#[tokio::test]
async fn test_complete_with_system_returns_text()
{   init_logging();
    let server = MockServer::start().await;
    mount_success(&server, "four", 1).await;

    let client = endpoint("primary", &server);
    let cancel = CancellationToken::new();
    let text = client
      .complete_with_system("You are a calculator", "2+2?", &cancel)
      .await
      .unwrap();
    assert_eq!(text, "four");
}

#[tokio::test]
async fn test_error_envelope_is_classified()
{   init_logging();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(
        ResponseTemplate::new(429)
          .set_body_json(error_body("rate limited", "rate_limit_error"))
      )
      .mount(&server)
      .await;

    let client = endpoint("primary", &server);
    let cancel = CancellationToken::new();
    let err = assert_err!(client.complete(&[Message::user("x")], &cancel).await);
    assert_eq!(
      err,
      Error::HttpStatus
      {   status: 429
        , message: "rate limited".to_string()
        , error_type: Some("rate_limit_error".to_string())
      }
    );
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_retry_recovers_from_transient_failure()
{   init_logging();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(503))
      .up_to_n_times(2)
      .expect(2)
      .mount(&server)
      .await;
    mount_success(&server, "recovered", 1).await;

    let client = endpoint("primary", &server);
    let cancel = CancellationToken::new();
    let result = assert_ok!(
      client.complete_with_retry(&[Message::user("x")], 3, &cancel).await
    );
    assert_eq!(result.text(), Some("recovered"));
}

#[tokio::test]
async fn test_retry_stops_on_non_retryable()
{   init_logging();
    let server = MockServer::start().await;
    mount_status(&server, 401, 1).await;

    let client = endpoint("primary", &server);
    let cancel = CancellationToken::new();
    let err = assert_err!(
      client.complete_with_retry(&[Message::user("x")], 5, &cancel).await
    );
    match &err
    {   Error::NonRetryable { attempt, .. } => assert_eq!(*attempt, 1)
      , other => panic!("unexpected {:?}", other)
    }
    assert_eq!(err.status(), Some(401));
}

#[tokio::test]
async fn test_retry_exhaustion_wraps_last_error()
{   init_logging();
    let server = MockServer::start().await;
    mount_status(&server, 502, 3).await;

    let client = endpoint("primary", &server);
    let cancel = CancellationToken::new();
    let err = assert_err!(
      client.complete_with_retry(&[Message::user("x")], 3, &cancel).await
    );
    match &err
    {   Error::RetriesExhausted { attempts, source } => {
          assert_eq!(*attempts, 3);
          assert_eq!(source.status(), Some(502));
        }
      , other => panic!("unexpected {:?}", other)
    }
    assert!(err.to_string().starts_with("failed after 3 attempts"));
}

#[tokio::test]
async fn test_decode_failure_is_not_retried()
{   init_logging();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
      .expect(1)
      .mount(&server)
      .await;

    let client = endpoint("primary", &server);
    let cancel = CancellationToken::new();
    let err = assert_err!(
      client.complete_with_retry(&[Message::user("x")], 4, &cancel).await
    );
    assert!(matches!(err.last_cause(), Error::Decode(_)));
}

#[tokio::test]
async fn test_empty_choices_is_decode_error()
{   init_logging();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
      .mount(&server)
      .await;

    let client = endpoint("primary", &server);
    let cancel = CancellationToken::new();
    let err = assert_err!(client.complete(&[Message::user("x")], &cancel).await);
    assert_eq!(err, Error::NoChoicesInResponse);
}

#[tokio::test]
async fn test_connection_refused_is_retryable_transport()
{   init_logging();
    let client = EndpointClient::new(
      EndpointConfig::new("dead", "m")
        .with_address("http://127.0.0.1:1/v1/chat/completions")
    ).unwrap();
    let cancel = CancellationToken::new();
    let err = assert_err!(client.complete(&[Message::user("x")], &cancel).await);
    assert!(matches!(err, Error::Transport { .. }), "{:?}", err);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_request_timeout_is_transport()
{   init_logging();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(success_body("late"))
          .set_delay(Duration::from_secs(5))
      )
      .mount(&server)
      .await;

    let client = EndpointClient::new(
      endpoint_config("slow", &server).with_timeout(Duration::from_secs(1))
    ).unwrap();
    let cancel = CancellationToken::new();
    let err = assert_err!(client.complete(&[Message::user("x")], &cancel).await);
    match err
    {   Error::Transport { timeout, .. } => assert!(timeout)
      , other => panic!("unexpected {:?}", other)
    }
}

#[tokio::test]
async fn test_cancel_aborts_in_flight_request()
{   init_logging();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(success_body("never"))
          .set_delay(Duration::from_secs(10))
      )
      .mount(&server)
      .await;

    let client = endpoint("slow", &server);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(50)).await;
      trigger.cancel();
    });

    let started = Instant::now();
    let err = assert_err!(client.complete(&[Message::user("x")], &cancel).await);
    assert_eq!(err, Error::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_cancel_interrupts_backoff()
{   init_logging();
    let server = MockServer::start().await;
    mount_status(&server, 503, 1).await;

    let client = EndpointClient::new(endpoint_config("primary", &server))
      .unwrap()
      .with_retry_policy(RetryPolicy::new(Duration::from_secs(30)));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(200)).await;
      trigger.cancel();
    });

    let started = Instant::now();
    let err = assert_err!(
      client.complete_with_retry(&[Message::user("x")], 3, &cancel).await
    );
    assert_eq!(err, Error::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
}

// ===== Fallback Router =====

#[tokio::test]
async fn test_router_falls_back_after_server_error()
{   init_logging();
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;
    mount_status(&primary, 503, 1).await;
    mount_success(&backup, "from backup", 1).await;

    let router = router(&[("primary", &primary), ("backup", &backup)]);
    let cancel = CancellationToken::new();
    let result = assert_ok!(router.complete(&[Message::user("x")], &cancel).await);
    assert_eq!(result.backend, "backup");
    assert_eq!(result.text(), Some("from backup"));

    let status = router.get_circuit_status();
    assert_eq!(status[0].consecutive_failures, 1);
    assert_eq!(status[0].recent_failure_count, 1);
    assert_eq!(status[1].consecutive_successes, 1);
    assert_eq!(status[1].consecutive_failures, 0);
}

#[tokio::test]
async fn test_router_skips_local_retry_on_client_error()
{   init_logging();
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;
    mount_status(&primary, 400, 1).await;
    mount_success(&backup, "ok", 1).await;

    let router = router(&[("primary", &primary), ("backup", &backup)]);
    let cancel = CancellationToken::new();
    let result = assert_ok!(
      router.complete_with_retry(&[Message::user("x")], 3, &cancel).await
    );
    assert_eq!(result.backend, "backup");
}

#[tokio::test]
async fn test_router_reports_last_endpoint_error()
{   init_logging();
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;
    mount_status(&primary, 500, 1).await;
    mount_status(&backup, 404, 1).await;

    let router = router(&[("primary", &primary), ("backup", &backup)]);
    let cancel = CancellationToken::new();
    let err = assert_err!(router.complete(&[Message::user("x")], &cancel).await);
    assert!(matches!(err, Error::AllEndpointsFailed { attempted: 2, skipped: 0, .. }));
    assert_eq!(err.status(), Some(404));
}

#[tokio::test]
async fn test_router_opens_circuit_and_recovers()
{   init_logging();
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(502))
      .up_to_n_times(2)
      .expect(2)
      .mount(&primary)
      .await;
    mount_success(&primary, "primary again", 2).await;
    mount_success(&backup, "backup", 3).await;

    let config = CircuitBreakerConfig
    {   failure_threshold: 2
      , success_threshold: 2
      , open_timeout_ms: 200
      , failure_window_ms: 60_000
    };
    let router = FallbackRouter::new(
      vec![
        ("primary".to_string(), endpoint("primary", &primary))
      , ("backup".to_string(), endpoint("backup", &backup))
      ]
    , config
    ).unwrap();
    let cancel = CancellationToken::new();
    let messages = [Message::user("x")];

    for _ in 0..2
    {   let result = router.complete(&messages, &cancel).await.unwrap();
        assert_eq!(result.backend, "backup");
    }
    assert_eq!(router.circuit(0).unwrap().state(), CircuitState::Open);

    // open circuit: primary is skipped without a request
    let result = router.complete(&messages, &cancel).await.unwrap();
    assert_eq!(result.backend, "backup");

    tokio::time::sleep(Duration::from_millis(250)).await;
    let result = router.complete(&messages, &cancel).await.unwrap();
    assert_eq!(result.backend, "primary");
    assert_eq!(router.circuit(0).unwrap().state(), CircuitState::HalfOpen);

    let result = router.complete(&messages, &cancel).await.unwrap();
    assert_eq!(result.backend, "primary");
    assert_eq!(router.circuit(0).unwrap().state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_half_open_sends_one_request_while_others_fall_back()
{   init_logging();
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path(CHAT_PATH))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(success_body("probe"))
          .set_delay(Duration::from_millis(300))
      )
      .expect(1)
      .mount(&primary)
      .await;
    mount_success(&backup, "backup", 2).await;

    let config = CircuitBreakerConfig
    {   failure_threshold: 1
      , open_timeout_ms: 0
      , ..CircuitBreakerConfig::default()
    };
    let router = FallbackRouter::new(
      vec![
        ("primary".to_string(), endpoint("primary", &primary))
      , ("backup".to_string(), endpoint("backup", &backup))
      ]
    , config
    ).unwrap();
    router.circuit(0).unwrap().record_failure();

    let cancel = CancellationToken::new();
    let messages = [Message::user("x")];
    let (a, b, c) = tokio::join!(
      router.complete(&messages, &cancel),
      router.complete(&messages, &cancel),
      router.complete(&messages, &cancel)
    );
    let mut backends: Vec<String> = [a, b, c]
      .into_iter()
      .map(|r| r.unwrap().backend)
      .collect();
    backends.sort();
    assert_eq!(backends, vec!["backup", "backup", "primary"]);
}

#[tokio::test]
async fn test_router_from_config_and_reset()
{   init_logging();
    let primary = MockServer::start().await;
    mount_status(&primary, 503, 1).await;

    let mut config = RouterConfig::new(vec![endpoint_config("primary", &primary)]);
    config.circuit_breaker.failure_threshold = 1;
    let router = FallbackRouter::from_config(config).unwrap();
    let cancel = CancellationToken::new();

    assert_err!(router.complete(&[Message::user("x")], &cancel).await);
    assert_eq!(router.get_circuit_status()[0].state, CircuitState::Open);

    assert_ok!(router.reset_circuit(0));
    assert_eq!(router.get_circuit_status()[0].state, CircuitState::Closed);
    assert!(matches!(
      router.reset_circuit(3),
      Err(Error::CircuitNotFound { index: 3, len: 1 })
    ));
}

#[tokio::test]
async fn test_router_parses_structured_reply()
{   #[derive(Debug, serde::Deserialize, PartialEq)]
    struct Signal
    {   action: String
      , size: f64
    }

    init_logging();
    let server = MockServer::start().await;
    mount_success(
      &server,
      "Here is my call:\n```json\n{\"action\": \"buy\", \"size\": 0.25}\n```",
      1
    ).await;

    let router = router(&[("primary", &server)]);
    let cancel = CancellationToken::new();
    let text = router
      .complete_with_system("Reply with JSON", "Signal?", &cancel)
      .await
      .unwrap();
    let signal: Signal = router.parse_response(&text).unwrap();
    assert_eq!(signal, Signal { action: "buy".to_string(), size: 0.25 });
}
