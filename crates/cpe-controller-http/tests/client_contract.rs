//! Architectural Contract Test: Controller Transport
//!
//! This test verifies the HTTP client against a local controller stand-in.
//!
//! Constraints verified:
//! - Requests carry the X-Request-Source header and a JSON body
//! - Only HTTP 200 with success == true and ret == 0 counts as success
//! - The envelope's data member is returned to the caller
//! - Transport failures surface as controller errors

use cpe_controller_http::HttpControllerClient;
use cpe_core::Error;
use cpe_core::config::{ControllerEndpoint, ControllerProto};
use cpe_core::traits::ControllerClient;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn setup() -> (MockServer, HttpControllerClient) {
    let server = MockServer::start().await;
    let addr = server.address();
    let endpoint = ControllerEndpoint {
        address: addr.ip().to_string(),
        port: addr.port(),
        proto: ControllerProto::Http,
    };
    let client = HttpControllerClient::new(endpoint).unwrap();
    (server, client)
}

fn envelope(data: serde_json::Value) -> serde_json::Value {
    json!({"success": true, "ret": 0, "code": "200", "msg": "ok", "data": data})
}

#[tokio::test]
async fn test_put_sends_header_and_returns_data() {
    let (server, client) = setup().await;
    let body = json!({"version": "0.1.0", "status": "NORMAL", "configVersion": 4});

    Mock::given(method("PUT"))
        .and(path("/api/cpeConfig/cpes/SN0001/heartbeat"))
        .and(header("X-Request-Source", "admin-api"))
        .and(body_json(body.clone()))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!({"configVersion": 5}))))
        .expect(1)
        .mount(&server)
        .await;

    let data = client
        .put("/api/cpeConfig/cpes/SN0001/heartbeat", &body)
        .await
        .unwrap();

    assert_eq!(data, json!({"configVersion": 5}));
}

#[tokio::test]
async fn test_get_returns_document() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/cpeConfig/cpes/SN0001/dpConfig"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!({"ts": 9}))))
        .mount(&server)
        .await;

    let data = client.get("/api/cpeConfig/cpes/SN0001/dpConfig").await.unwrap();
    assert_eq!(data["ts"], 9);
}

#[tokio::test]
async fn test_non_200_is_an_error() {
    let (server, client) = setup().await;

    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(201).set_body_json(envelope(json!({}))))
        .mount(&server)
        .await;

    let result = client.put("/api/cpeConfig/cpes/SN0001/logicPorts/wan", &json!({})).await;
    assert!(
        matches!(result, Err(Error::Controller(_))),
        "Expected Controller error for 201, got {:?}",
        result
    );
}

#[tokio::test]
async fn test_body_level_failure_is_an_error() {
    let (server, client) = setup().await;

    Mock::given(method("PUT"))
        .and(path("/rejected"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"success": true, "ret": 7, "msg": "stale version"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/denied"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": false, "ret": 0})))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/garbled"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy</html>"))
        .mount(&server)
        .await;

    let rejected = client.put("/rejected", &json!({})).await.unwrap_err();
    assert!(rejected.to_string().contains("stale version"));
    assert!(client.put("/denied", &json!({})).await.is_err());
    assert!(client.put("/garbled", &json!({})).await.is_err());
}

#[tokio::test]
async fn test_unreachable_controller_is_an_error() {
    let server = MockServer::start().await;
    let addr = server.address();
    let endpoint = ControllerEndpoint {
        address: addr.ip().to_string(),
        port: addr.port(),
        proto: ControllerProto::Http,
    };
    drop(server);

    let client = HttpControllerClient::new(endpoint).unwrap();
    let result = client.get("/api/cpeConfig/cpes/SN0001/dpConfig").await;
    assert!(matches!(result, Err(Error::Controller(_))), "got {:?}", result);
}
