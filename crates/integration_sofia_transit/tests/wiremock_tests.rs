//! Integration tests for the sofiatraffic.bg client (wiremock-based)

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use wiremock::matchers::{body_json, body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use integration_sofia_transit::{
    BackoffConfig, FailureKind, RefreshCoordinator, SofiaTrafficClient, SofiaTransitConfig,
    StopFetcher, TokenStore, TransitError,
};

const DATA_PATH: &str = "/bg/trip/getVirtualTable";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

const PUBLIC_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Градски транспорт</title>
    <meta name="csrf-token" content="meta-123">
</head>
<body><div id="app"></div></body>
</html>"#;

const MAINTENANCE_PAGE: &str = r"<html>
<head><title>Maintenance</title></head>
<body><h1>Back soon</h1><script>var x = 1;</script></body>
</html>";

const RATE_LIMIT_PAGE: &str = r"<html>
<head><title>429 Too Many Requests</title></head>
<body><center><h1>429 Too Many Requests</h1></center></body>
</html>";

fn client_for(server: &MockServer) -> SofiaTrafficClient {
    client_with(SofiaTransitConfig::for_testing(&server.uri()))
}

fn client_with(config: SofiaTransitConfig) -> SofiaTrafficClient {
    SofiaTrafficClient::new(&config, Arc::new(TokenStore::new())).unwrap()
}

fn client_with_backoff(server: &MockServer, backoff: BackoffConfig) -> SofiaTrafficClient {
    client_with(SofiaTransitConfig {
        backoff,
        ..SofiaTransitConfig::for_testing(&server.uri())
    })
}

/// Data endpoint that never answers within a one second client timeout
async fn mount_stalled_stop(server: &MockServer, stop: &str, times: u64) {
    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .and(body_string(format!("stop={stop}")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(bus_payload())
                .set_delay(Duration::from_secs(3)),
        )
        .expect(times)
        .mount(server)
        .await;
}

async fn mount_handshake(server: &MockServer, times: u64) {
    Mock::given(method("GET"))
        .and(path("/sanctum/csrf-cookie"))
        .respond_with(
            ResponseTemplate::new(204)
                .append_header("Set-Cookie", "XSRF-TOKEN=eyJpdiI6%3D; Path=/; SameSite=Lax")
                .append_header(
                    "Set-Cookie",
                    "sofia_traffic_session=sess-1; Path=/; HttpOnly; SameSite=Lax",
                ),
        )
        .expect(times)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/bg/public-transport"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(PUBLIC_PAGE, "text/html"))
        .expect(times)
        .mount(server)
        .await;
}

fn tram_payload() -> serde_json::Value {
    json!({
        "2-5": {
            "type": 2,
            "name": "5",
            "route_name": "Center - Youth",
            "route_ext_id": "TM5",
            "details": [{ "t": 2 }, { "t": 9 }]
        }
    })
}

fn bus_payload() -> serde_json::Value {
    json!({
        "1-94": {
            "type": 1,
            "name": "94",
            "route_name": "NDK - Mladost 1",
            "details": [{ "t": 3 }, { "t": 7 }, { "t": 15 }]
        },
        "3-M1": {
            "type": 3,
            "name": "1",
            "route_name": "Slivnitsa - Business Park",
            "route_ext_id": "M4",
            "details": [{ "t": 4 }]
        }
    })
}

#[tokio::test]
async fn test_fetch_sends_session_headers() {
    let server = MockServer::start().await;
    mount_handshake(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .and(header("X-Requested-With", "XMLHttpRequest"))
        .and(header("X-XSRF-TOKEN", "eyJpdiI6="))
        .and(header("X-CSRF-TOKEN", "meta-123"))
        .and(header(
            "Cookie",
            "XSRF-TOKEN=eyJpdiI6=; sofia_traffic_session=sess-1",
        ))
        .and(header("content-type", FORM_CONTENT_TYPE))
        .and(body_string("stop=1287"))
        .respond_with(ResponseTemplate::new(200).set_body_json(bus_payload()))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let payload = client.fetch("1287").await.unwrap();

    assert_eq!(payload.len(), 2);
    assert_eq!(payload.routes[0].name.as_deref(), Some("94"));
    assert_eq!(payload.routes[0].arrivals, vec![3, 7, 15]);
    assert_eq!(payload.routes[1].ext_id.as_deref(), Some("M4"));

    let tokens = client.tokens().snapshot();
    assert_eq!(tokens.csrf_meta_token.as_deref(), Some("meta-123"));
    assert!(tokens.last_refreshed.is_some());
}

#[tokio::test]
async fn test_fresh_tokens_skip_handshake() {
    let server = MockServer::start().await;
    mount_handshake(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(bus_payload()))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.fetch("1287").await.unwrap();
    client.fetch("2330").await.unwrap();
}

#[tokio::test]
async fn test_rotated_cookie_used_on_next_attempt() {
    let server = MockServer::start().await;
    mount_handshake(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .respond_with(
            ResponseTemplate::new(500)
                .append_header("Set-Cookie", "XSRF-TOKEN=rotated; Path=/")
                .set_body_raw("<html><title>Server Error</title></html>", "text/html"),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .and(header("X-XSRF-TOKEN", "rotated"))
        .respond_with(ResponseTemplate::new(200).set_body_json(bus_payload()))
        .with_priority(2)
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    assert!(client.fetch("1287").await.is_ok());
    assert_eq!(
        client.tokens().snapshot().xsrf_token.as_deref(),
        Some("rotated")
    );
}

#[tokio::test]
async fn test_rotated_cookie_kept_when_body_is_unreadable() {
    let server = MockServer::start().await;
    mount_handshake(&server, 1).await;

    // Claims gzip but is not, so reading the body fails after the headers
    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Encoding", "gzip")
                .append_header("Set-Cookie", "sofia_traffic_session=rotated; Path=/")
                .set_body_bytes(b"definitely not gzip".to_vec()),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .and(header("Cookie", "XSRF-TOKEN=eyJpdiI6=; sofia_traffic_session=rotated"))
        .respond_with(ResponseTemplate::new(200).set_body_json(bus_payload()))
        .with_priority(2)
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    assert!(client.fetch("1287").await.is_ok());
    assert_eq!(
        client.tokens().snapshot().session_cookie.as_deref(),
        Some("rotated")
    );
}

#[tokio::test]
async fn test_auth_failure_reacquires_tokens() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/sanctum/csrf-cookie"))
        .respond_with(
            ResponseTemplate::new(204)
                .append_header("Set-Cookie", "XSRF-TOKEN=first; Path=/")
                .append_header("Set-Cookie", "sofia_traffic_session=sess-1; Path=/"),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/sanctum/csrf-cookie"))
        .respond_with(
            ResponseTemplate::new(204)
                .append_header("Set-Cookie", "XSRF-TOKEN=second; Path=/")
                .append_header("Set-Cookie", "sofia_traffic_session=sess-2; Path=/"),
        )
        .with_priority(2)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/bg/public-transport"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(PUBLIC_PAGE, "text/html"))
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .and(header("X-XSRF-TOKEN", "first"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .and(header("X-XSRF-TOKEN", "first"))
        .respond_with(ResponseTemplate::new(403))
        .up_to_n_times(1)
        .with_priority(2)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .and(header("X-XSRF-TOKEN", "second"))
        .and(header("Cookie", "XSRF-TOKEN=second; sofia_traffic_session=sess-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(bus_payload()))
        .with_priority(3)
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let payload = client.fetch("1287").await.unwrap();
    assert_eq!(payload.len(), 2);
    assert_eq!(client.tokens().snapshot().xsrf_token.as_deref(), Some("second"));
}

#[tokio::test]
async fn test_rate_limited_then_success() {
    let server = MockServer::start().await;
    mount_handshake(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(bus_payload()))
        .with_priority(2)
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    assert!(client.fetch("1287").await.is_ok());
}

#[tokio::test]
async fn test_retry_after_is_waited_out() {
    let server = MockServer::start().await;
    mount_handshake(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(bus_payload()))
        .with_priority(2)
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let started = Instant::now();
    assert!(client.fetch("1287").await.is_ok());
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn test_rate_limit_without_retry_after_uses_fallback() {
    let server = MockServer::start().await;
    mount_handshake(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(bus_payload()))
        .with_priority(2)
        .expect(1)
        .mount(&server)
        .await;

    let client = client_with_backoff(
        &server,
        BackoffConfig {
            rate_limit_fallback_secs: 1,
            ..BackoffConfig::immediate()
        },
    );
    let started = Instant::now();
    assert!(client.fetch("1287").await.is_ok());
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn test_html_rate_limit_page_pauses() {
    let server = MockServer::start().await;
    mount_handshake(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_raw(RATE_LIMIT_PAGE, "text/html"))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(bus_payload()))
        .with_priority(2)
        .expect(1)
        .mount(&server)
        .await;

    let client = client_with_backoff(
        &server,
        BackoffConfig {
            html_rate_limit_min_ms: 200,
            html_rate_limit_max_ms: 300,
            ..BackoffConfig::immediate()
        },
    );
    let started = Instant::now();
    assert!(client.fetch("1287").await.is_ok());
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn test_backoff_between_attempts() {
    let server = MockServer::start().await;
    mount_handshake(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(bus_payload()))
        .with_priority(2)
        .expect(1)
        .mount(&server)
        .await;

    let client = client_with_backoff(
        &server,
        BackoffConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            ..BackoffConfig::immediate()
        },
    );
    let started = Instant::now();
    assert!(client.fetch("1287").await.is_ok());
    // 100ms after the first failure, 200ms after the second
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_html_response_switches_to_json_body() {
    let server = MockServer::start().await;
    mount_handshake(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .and(header("content-type", FORM_CONTENT_TYPE))
        .respond_with(ResponseTemplate::new(200).set_body_raw(MAINTENANCE_PAGE, "text/html"))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({ "stop": "1287" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(bus_payload()))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let payload = client.fetch("1287").await.unwrap();
    assert_eq!(payload.len(), 2);
}

#[tokio::test]
async fn test_exhausted_retries_report_last_failure() {
    let server = MockServer::start().await;
    mount_handshake(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .respond_with(ResponseTemplate::new(503))
        .expect(4)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.fetch("1287").await.unwrap_err();

    match err {
        TransitError::ExhaustedRetries {
            stop_id,
            attempts,
            last_failure,
        } => {
            assert_eq!(stop_id, "1287");
            assert_eq!(attempts, 4);
            assert_eq!(last_failure, FailureKind::ServerError);
        },
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_scalar_json_is_malformed() {
    let server = MockServer::start().await;
    mount_handshake(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!("unavailable")))
        .expect(4)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.fetch("1287").await.unwrap_err();
    assert!(matches!(
        err,
        TransitError::ExhaustedRetries {
            last_failure: FailureKind::MalformedResponse,
            ..
        }
    ));
}

#[tokio::test]
async fn test_empty_array_is_an_empty_stop() {
    let server = MockServer::start().await;
    mount_handshake(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let payload = client.fetch("1287").await.unwrap();
    assert!(payload.is_empty());
}

#[tokio::test]
async fn test_unreachable_host_fails_handshake() {
    let config = SofiaTransitConfig::for_testing("http://127.0.0.1:1");
    let client = SofiaTrafficClient::new(&config, Arc::new(TokenStore::new())).unwrap();

    let err = client.fetch("1287").await.unwrap_err();
    assert!(matches!(err, TransitError::Network(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_stalled_stop_exhausts_with_network_failure() {
    let server = MockServer::start().await;
    mount_handshake(&server, 1).await;
    mount_stalled_stop(&server, "1287", 2).await;

    let client = client_with(SofiaTransitConfig {
        timeout_secs: 1,
        max_attempts: 2,
        ..SofiaTransitConfig::for_testing(&server.uri())
    });
    let err = client.fetch("1287").await.unwrap_err();

    match err {
        TransitError::ExhaustedRetries {
            stop_id,
            attempts,
            last_failure,
        } => {
            assert_eq!(stop_id, "1287");
            assert_eq!(attempts, 2);
            assert_eq!(last_failure, FailureKind::Network);
        },
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_cycle_with_one_unreachable_stop() {
    let server = MockServer::start().await;
    mount_handshake(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .and(body_string("stop=A"))
        .respond_with(ResponseTemplate::new(200).set_body_json(tram_payload()))
        .expect(1)
        .mount(&server)
        .await;

    mount_stalled_stop(&server, "B", 4).await;

    let client = client_with(SofiaTransitConfig {
        timeout_secs: 1,
        ..SofiaTransitConfig::for_testing(&server.uri())
    });
    let mut coordinator = RefreshCoordinator::new(
        client,
        vec!["A".to_string(), "B".to_string()],
        Duration::from_secs(60),
        3,
    );
    let published = coordinator.published();

    let aggregate = coordinator.first_refresh().await.unwrap();

    assert_eq!(aggregate.lines.len(), 1);
    let line = &aggregate.lines[0];
    assert_eq!(line.line, "A_TM5");
    assert_eq!(line.next_bus, Some(2));
    assert_eq!(line.after_next, vec![9]);
    assert_eq!(line.bus_stop_begin, "Center");
    assert_eq!(line.bus_stop_end, "Youth");

    assert!(published.last_update_success());
    assert_eq!(published.line("A_TM5").as_ref(), Some(line));
}

#[tokio::test]
async fn test_cycle_normalizes_metro_and_bus() {
    let server = MockServer::start().await;
    mount_handshake(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(DATA_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(bus_payload()))
        .mount(&server)
        .await;

    let mut coordinator = RefreshCoordinator::new(
        client_for(&server),
        vec!["2330".to_string()],
        Duration::from_secs(60),
        3,
    );

    let aggregate = coordinator.refresh().await.unwrap();
    let ids: Vec<_> = aggregate.lines.iter().map(|l| l.line.as_str()).collect();
    assert_eq!(ids, vec!["2330_A94", "2330_M4"]);
    assert_eq!(
        serde_json::to_value(&aggregate.lines[0]).unwrap(),
        json!({
            "line": "2330_A94",
            "nextBus": 3,
            "afterNext": [7, 15],
            "busStopBegin": "NDK",
            "busStopEnd": "Mladost 1"
        })
    );
}
