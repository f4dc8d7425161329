//! Handshake against a mock vendor gateway.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use mowerlink::{
    cloud::{
        session::{
            AEP_AUTH_PATH, CONNECT_PATH, CREATE_SESSION_PATH, INVOKE_SERVICE_PATH,
            LIST_BINDINGS_PATH, LOGIN_PATH, REFRESH_SESSION_PATH, REGION_PATH,
        },
        signing::{self, HeaderMap, SIGNATURE_HEADER, SIGNED_HEADERS_HEADER},
    },
    AppCredentials, CloudConfig, CloudGateway, MowerError,
};
use serde_json::{json, Value};
use wiremock::{
    matchers::{body_partial_json, header, header_exists, method, path},
    Mock, MockServer, Request, ResponseTemplate,
};

const APP_KEY: &str = "34231230";
const APP_SECRET: &str = "test-app-secret";

fn gateway(server: &MockServer) -> CloudGateway {
    let host = server.address().to_string();
    let config = CloudConfig {
        gateway_domain: host.clone(),
        open_account_domain: host,
        scheme: "http".to_string(),
        ..CloudConfig::default()
    };
    CloudGateway::new(AppCredentials::new(APP_KEY, APP_SECRET), config).unwrap()
}

fn ok(data: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "code": 200, "data": data, "id": "r-1" }))
}

async fn mount_through_login(server: &MockServer) {
    let host = server.address().to_string();

    Mock::given(method("POST"))
        .and(path(REGION_PATH))
        .and(header_exists(SIGNATURE_HEADER))
        .and(body_partial_json(json!({
            "params": { "type": "THIRD_AUTHCODE", "authCode": "auth-1", "countryCode": "US" }
        })))
        .respond_with(ok(json!({
            "regionId": "us-east-1",
            "mqttEndpoint": "mqtt.example",
            "apiGatewayEndpoint": host,
            "oaApiGatewayEndpoint": host,
        })))
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path(AEP_AUTH_PATH))
        .and(body_partial_json(json!({ "request": { "apiVer": "1.0.0" } })))
        .respond_with(ok(json!({
            "productKey": "pk-1",
            "deviceName": "dn-1",
            "deviceSecret": "ds-1",
        })))
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path(CONNECT_PATH))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "success": true, "data": { "vid": "vid-1" } })),
        )
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path(LOGIN_PATH))
        .and(header("vid", "vid-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": { "data": { "loginSuccessResult": { "sid": "sid-1" } } },
        })))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_create_session(server: &MockServer, iot_token_expire: i64) {
    mount_session_tokens(
        server,
        json!({
            "iotToken": "iot-1",
            "iotTokenExpire": iot_token_expire,
            "refreshToken": "refresh-1",
            "refreshTokenExpire": 720_000,
            "identityId": "identity-1",
        }),
    )
    .await;
}

async fn mount_session_tokens(server: &MockServer, tokens: Value) {
    Mock::given(method("POST"))
        .and(path(CREATE_SESSION_PATH))
        .and(body_partial_json(json!({
            "params": { "request": { "authCode": "sid-1", "accountType": "OA_SESSION" } }
        })))
        .respond_with(ok(tokens))
        .expect(1)
        .mount(server)
        .await;
}

fn header_value<'a>(request: &'a Request, key: &str) -> &'a str {
    request
        .headers
        .get(key)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

/// Recompute the signature a request should carry
fn expected_signature(request: &Request, resource: &str) -> String {
    let mut headers = HeaderMap::new();
    for key in ["accept", "content-md5", "content-type", "date"] {
        if request.headers.contains_key(key) {
            headers.insert(key.to_string(), header_value(request, key).to_string());
        }
    }
    for key in header_value(request, SIGNED_HEADERS_HEADER).split(',') {
        headers.insert(key.to_string(), header_value(request, key).to_string());
    }
    signing::sign(APP_SECRET, &signing::string_to_sign("POST", &headers, resource)).unwrap()
}

#[tokio::test]
async fn test_full_handshake() {
    let server = MockServer::start().await;
    mount_through_login(&server).await;
    mount_create_session(&server, 72_000).await;

    let cloud = gateway(&server);
    let session = cloud.establish_session("US", "auth-1").await.unwrap();

    assert_eq!(session.region.region_id, "us-east-1");
    assert_eq!(session.aep.device_name, "dn-1");
    assert_eq!(session.vid, "vid-1");
    assert_eq!(session.sid, "sid-1");
    assert_eq!(session.tokens.iot_token, "iot-1");
    assert!(Some(session.expires_at) < session.refresh_expires_at);
    assert_eq!(cloud.session().await, Some(session));
}

#[tokio::test]
async fn test_requests_are_signed() {
    let server = MockServer::start().await;
    mount_through_login(&server).await;
    mount_create_session(&server, 72_000).await;

    let cloud = gateway(&server);
    cloud.establish_session("US", "auth-1").await.unwrap();

    let requests = server.received_requests().await.unwrap();

    let region = requests
        .iter()
        .find(|request| request.url.path() == REGION_PATH)
        .unwrap();
    assert_eq!(header_value(region, "x-ca-key"), APP_KEY);
    assert_eq!(
        header_value(region, "content-md5"),
        signing::content_md5(&region.body)
    );
    assert_eq!(
        header_value(region, SIGNATURE_HEADER),
        expected_signature(region, REGION_PATH)
    );

    let connect = requests
        .iter()
        .find(|request| request.url.path() == CONNECT_PATH)
        .unwrap();
    let (_, body) = connect
        .url
        .query_pairs()
        .find(|(key, _)| key == "request")
        .unwrap();
    let context: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(context["context"]["appKey"], APP_KEY);
    assert_eq!(context["context"]["utDid"], cloud.identity().utdid.as_str());
    assert_eq!(
        header_value(connect, SIGNATURE_HEADER),
        expected_signature(connect, &format!("{CONNECT_PATH}?request={body}"))
    );

    let login = requests
        .iter()
        .find(|request| request.url.path() == LOGIN_PATH)
        .unwrap();
    assert!(header_value(login, SIGNED_HEADERS_HEADER).contains("vid"));
}

#[tokio::test]
async fn test_rejected_step_aborts_handshake() {
    let server = MockServer::start().await;
    mount_through_login(&server).await;

    Mock::given(method("POST"))
        .and(path(CREATE_SESSION_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "code": 2401, "message": "identityId is blank" })),
        )
        .mount(&server)
        .await;

    let cloud = gateway(&server);
    let error = cloud.establish_session("US", "auth-1").await.unwrap_err();

    assert!(matches!(
        error,
        MowerError::Gateway { code: 2401, ref message } if message == "identityId is blank"
    ));
    assert!(error.is_auth_failure());
    assert!(cloud.session().await.is_none());
}

#[tokio::test]
async fn test_missing_field_names_the_step() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(REGION_PATH))
        .respond_with(ok(json!({ "regionId": "us-east-1" })))
        .mount(&server)
        .await;

    let error = gateway(&server)
        .establish_session("US", "auth-1")
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        MowerError::Handshake {
            step: "region lookup",
            ..
        }
    ));
}

#[tokio::test]
async fn test_refresh_keeps_identity() {
    let server = MockServer::start().await;
    mount_through_login(&server).await;
    mount_create_session(&server, 72_000).await;

    Mock::given(method("POST"))
        .and(path(REFRESH_SESSION_PATH))
        .and(body_partial_json(json!({
            "params": { "request": { "refreshToken": "refresh-1", "identityId": "identity-1" } }
        })))
        .respond_with(ok(json!({ "iotToken": "iot-2", "iotTokenExpire": 72_000 })))
        .expect(1)
        .mount(&server)
        .await;

    let cloud = gateway(&server);
    let established = cloud.establish_session("US", "auth-1").await.unwrap();
    let refreshed = cloud.refresh_session().await.unwrap();

    assert_eq!(refreshed.tokens.iot_token, "iot-2");
    assert_eq!(refreshed.tokens.refresh_token, "refresh-1");
    assert_eq!(refreshed.tokens.identity_id, "identity-1");
    assert_eq!(refreshed.vid, established.vid);
    assert_eq!(cloud.session().await, Some(refreshed));
}

#[tokio::test]
async fn test_rejected_refresh_discards_session() {
    let server = MockServer::start().await;
    mount_through_login(&server).await;
    mount_create_session(&server, 72_000).await;

    Mock::given(method("POST"))
        .and(path(REFRESH_SESSION_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "code": 29003, "message": "refreshToken invalid" })),
        )
        .mount(&server)
        .await;

    let cloud = gateway(&server);
    cloud.establish_session("US", "auth-1").await.unwrap();

    assert!(matches!(
        cloud.refresh_session().await,
        Err(MowerError::Gateway { code: 29003, .. })
    ));
    assert!(cloud.session().await.is_none());
    assert!(matches!(
        cloud.refresh_session().await,
        Err(MowerError::NoSession)
    ));
}

#[tokio::test]
async fn test_ensure_valid_session_refreshes_near_expiry() {
    let server = MockServer::start().await;
    mount_through_login(&server).await;
    // Inside the default 300 s refresh margin.
    mount_create_session(&server, 60).await;

    Mock::given(method("POST"))
        .and(path(REFRESH_SESSION_PATH))
        .respond_with(ok(json!({ "iotToken": "iot-2", "iotTokenExpire": 72_000 })))
        .expect(1)
        .mount(&server)
        .await;

    let cloud = gateway(&server);
    cloud.establish_session("US", "auth-1").await.unwrap();

    let session = cloud.ensure_valid_session().await.unwrap();
    assert_eq!(session.tokens.iot_token, "iot-2");

    // Fresh token now; no second refresh.
    let again = cloud.ensure_valid_session().await.unwrap();
    assert_eq!(again.tokens.iot_token, "iot-2");
}

#[tokio::test]
async fn test_out_of_range_token_lifetime_aborts_handshake() {
    let server = MockServer::start().await;
    mount_through_login(&server).await;
    mount_session_tokens(
        &server,
        json!({
            "iotToken": "iot-1",
            "iotTokenExpire": 72_000,
            "refreshToken": "refresh-1",
            "refreshTokenExpire": i64::MAX,
            "identityId": "identity-1",
        }),
    )
    .await;

    let cloud = gateway(&server);
    let error = cloud.establish_session("US", "auth-1").await.unwrap_err();

    assert!(matches!(
        error,
        MowerError::Handshake {
            step: "create session",
            ..
        }
    ));
    assert!(cloud.session().await.is_none());
}

#[tokio::test]
async fn test_unknown_refresh_expiry_still_refreshes() {
    let server = MockServer::start().await;
    mount_through_login(&server).await;
    mount_session_tokens(
        &server,
        json!({
            "iotToken": "iot-1",
            "iotTokenExpire": 60,
            "refreshToken": "refresh-1",
            "identityId": "identity-1",
        }),
    )
    .await;

    Mock::given(method("POST"))
        .and(path(REFRESH_SESSION_PATH))
        .respond_with(ok(json!({ "iotToken": "iot-2", "iotTokenExpire": 72_000 })))
        .expect(1)
        .mount(&server)
        .await;

    let cloud = gateway(&server);
    let established = cloud.establish_session("US", "auth-1").await.unwrap();
    assert_eq!(established.refresh_expires_at, None);

    let session = cloud.ensure_valid_session().await.unwrap();
    assert_eq!(session.tokens.iot_token, "iot-2");
    assert_eq!(session.tokens.refresh_token, "refresh-1");
}

#[tokio::test]
async fn test_post_login_services() {
    let server = MockServer::start().await;
    mount_through_login(&server).await;
    mount_create_session(&server, 72_000).await;

    Mock::given(method("POST"))
        .and(path(LIST_BINDINGS_PATH))
        .and(body_partial_json(json!({
            "request": { "apiVer": "1.0.8", "iotToken": "iot-1" },
            "params": { "pageNo": 1 }
        })))
        .respond_with(ok(json!({
            "total": 1,
            "data": [{
                "iotId": "iot-1",
                "deviceName": "Luba-VS1234",
                "productKey": "pk-1",
                "nickName": "Front lawn",
                "status": 1,
            }],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let payload = br#"{"sys":{"todev_report_cfg":{}}}"#;
    Mock::given(method("POST"))
        .and(path(INVOKE_SERVICE_PATH))
        .and(body_partial_json(json!({
            "request": { "iotToken": "iot-1" },
            "params": {
                "identifier": "device_protobuf_sync_service",
                "iotId": "iot-1",
                "args": { "content": STANDARD.encode(payload) },
            }
        })))
        .respond_with(ok(json!({ "messageId": "msg-77" })))
        .expect(1)
        .mount(&server)
        .await;

    let cloud = gateway(&server);
    cloud.establish_session("US", "auth-1").await.unwrap();

    let bindings = cloud.list_bindings().await.unwrap();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].device_name, "Luba-VS1234");
    assert_eq!(bindings[0].nick_name.as_deref(), Some("Front lawn"));

    let message_id = cloud.invoke_service("iot-1", payload).await.unwrap();
    assert_eq!(message_id, "msg-77");
}

#[tokio::test]
async fn test_services_require_a_session() {
    let server = MockServer::start().await;
    let cloud = gateway(&server);

    assert!(matches!(
        cloud.list_bindings().await,
        Err(MowerError::NoSession)
    ));
    assert!(matches!(
        cloud.invoke_service("iot-1", b"{}").await,
        Err(MowerError::NoSession)
    ));
}
