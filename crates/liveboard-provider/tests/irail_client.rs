//! `IrailClient` against a wiremock liveboard endpoint.

use std::time::Duration;

use liveboard_core::{ProviderErrorKind, Station};
use liveboard_provider::{BackoffPolicy, DepartureProvider, IrailClient, ProviderConfig};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_client(base_url: &str, max_retries: usize, timeout: Duration) -> IrailClient {
    IrailClient::new(ProviderConfig {
        base_url: base_url.to_string(),
        timeout,
        user_agent: Some("liveboard-test".to_string()),
        max_concurrent: 2,
        backoff: BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
    })
    .expect("client construction should not fail")
}

fn brussels() -> Station {
    Station::new("Brussels-Central", "Brussels-Central")
}

#[tokio::test]
async fn fetch_returns_raw_departures() {
    let server = MockServer::start().await;
    let body = serde_json::json!({
        "station": "Brussels-Central",
        "departures": {
            "number": "2",
            "departure": [
                {"vehicle": "BE.NMBS.IC1832", "time": "1760878800", "delay": "0", "station": "Oostende"},
                {"vehicle": "BE.NMBS.S11968", "time": "1760879100", "delay": "60", "station": "Nivelles"}
            ]
        }
    });

    Mock::given(method("GET"))
        .and(path("/liveboard/"))
        .and(query_param("station", "Brussels-Central"))
        .and(query_param("format", "json"))
        .and(query_param("lang", "en"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&body))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server.uri(), 2, Duration::from_secs(5));
    let departures = client.fetch(&brussels()).await.expect("fetch should succeed");

    assert_eq!(departures.len(), 2);
    assert_eq!(
        departures[1].lookup(&["vehicle"]).and_then(|v| v.as_str()),
        Some("BE.NMBS.S11968")
    );
}

#[tokio::test]
async fn client_errors_fail_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/liveboard/"))
        .respond_with(ResponseTemplate::new(404).set_body_string("station not found"))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server.uri(), 3, Duration::from_secs(5));
    let err = client.fetch(&brussels()).await.unwrap_err();

    assert_eq!(err.kind, ProviderErrorKind::HttpError);
    assert_eq!(err.status, Some(404));
}

#[tokio::test]
async fn server_errors_are_retried_then_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/liveboard/"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let client = test_client(&server.uri(), 2, Duration::from_secs(5));
    let err = client.fetch(&brussels()).await.unwrap_err();

    assert_eq!(err.kind, ProviderErrorKind::HttpError);
    assert_eq!(err.status, Some(503));
}

#[tokio::test]
async fn transient_failure_recovers_on_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/liveboard/"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/liveboard/"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"departures": {"number": "0"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server.uri(), 2, Duration::from_secs(5));
    let departures = client.fetch(&brussels()).await.expect("second attempt succeeds");
    assert!(departures.is_empty());
}

#[tokio::test]
async fn slow_upstream_is_reported_as_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/liveboard/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"departures": {"number": "0"}}))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let client = test_client(&server.uri(), 1, Duration::from_millis(50));
    let err = client.fetch(&brussels()).await.unwrap_err();
    assert_eq!(err.kind, ProviderErrorKind::Timeout);
}

#[tokio::test]
async fn non_json_body_is_malformed_payload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/liveboard/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server.uri(), 3, Duration::from_secs(5));
    let err = client.fetch(&brussels()).await.unwrap_err();
    assert_eq!(err.kind, ProviderErrorKind::MalformedPayload);
}

#[tokio::test]
async fn closed_port_is_unreachable() {
    let client = test_client("http://127.0.0.1:1", 1, Duration::from_secs(2));
    let err = client.fetch(&brussels()).await.unwrap_err();
    assert_eq!(err.kind, ProviderErrorKind::Unreachable);
}
