//! HTTP adapters against a mock server: work queue, webhook notifier, protocol bridge

use custody_runner::{
    config::WorkQueueSettings,
    types::{Phase, RequestStatus},
    BridgeCustodian, ConnectionState, Custodian, HttpWorkQueue, Notifier, OfferSpec, OfferState,
    TradeKind, TradeRequest, WebhookNotifier, WorkQueue,
};
use std::time::Duration;
use wiremock::matchers::{body_json, body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn queue_settings(server: &MockServer) -> WorkQueueSettings {
    WorkQueueSettings {
        fetch_url: format!("{}/pending", server.uri()),
        callback_url: format!("{}/process", server.uri()),
        timeout_secs: 5,
    }
}

#[tokio::test]
async fn test_work_queue_fetches_pending() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pending"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "Deposits": [
                {"SteamId": 76561198000000001u64, "QueId": 31, "SecurityToken": "AB",
                 "RU_Token": "t1", "item_Ids": ["100;7"]}
            ],
            "withdrawal": null
        })))
        .mount(&server)
        .await;

    let queue = HttpWorkQueue::new(&queue_settings(&server)).unwrap();
    let pending = queue.fetch_pending().await.unwrap();

    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, TradeKind::Deposit);
    assert_eq!(pending[0].request_id, "31");
    assert_eq!(pending[0].requested[0].asset_handle, "100");
}

#[tokio::test]
async fn test_work_queue_fetch_error_carries_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pending"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let queue = HttpWorkQueue::new(&queue_settings(&server)).unwrap();
    let err = queue.fetch_pending().await.unwrap_err().to_string();

    assert!(err.contains("503"));
    assert!(err.contains("maintenance"));
}

#[tokio::test]
async fn test_work_queue_posts_status_form() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/process"))
        .and(body_string_contains("action=invtradecallback"))
        .and(body_string_contains("Status="))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let queue = HttpWorkQueue::new(&queue_settings(&server)).unwrap();
    let mut request = TradeRequest::new(TradeKind::Withdraw, "32", "765", "tok", "SEC", Vec::new());
    request.set_phase(Phase::Sent);
    request.offer_id = Some("offer-9".to_string());
    assert_eq!(request.status, RequestStatus::Withdraw(Phase::Sent));

    queue.push_status(&[request.status_update()]).await.unwrap();
    // Nothing to report means no request at all
    queue.push_status(&[]).await.unwrap();
}

#[tokio::test]
async fn test_webhook_notifier_posts_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_json(serde_json::json!({"content": "intake loop has exited: boom"})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let notifier =
        WebhookNotifier::new(&format!("{}/hook", server.uri()), Duration::from_secs(5)).unwrap();
    notifier.post_message("intake loop has exited: boom").await;
}

#[tokio::test]
async fn test_bridge_session_and_offers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session/connect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"state": "connected"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/offers"))
        .and(body_json(serde_json::json!({
            "counterparty_id": "765",
            "token": "tok",
            "give": ["500"],
            "receive": [],
            "message": "EXAMPLE DEPOSIT | SEC"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"offer_id": "4411"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/offers/4411"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "offer_id": "4411",
            "state": "countered",
            "created_at": "2026-01-05T10:00:00Z"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/offers/4411/decline"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .mount(&server)
        .await;

    let bridge = BridgeCustodian::new("host", &server.uri(), Duration::from_secs(5)).unwrap();
    assert_eq!(bridge.connection_state().await, ConnectionState::Unknown);
    assert_eq!(bridge.connect().await.unwrap(), ConnectionState::Connected);
    assert_eq!(bridge.connection_state().await, ConnectionState::Connected);

    let spec = OfferSpec {
        counterparty_id: "765".to_string(),
        token: "tok".to_string(),
        give: vec!["500".to_string()],
        receive: Vec::new(),
    };
    let offer_id = bridge.send_offer(&spec, "EXAMPLE DEPOSIT | SEC").await.unwrap();
    assert_eq!(offer_id, "4411");

    let remote = bridge.get_offer(&offer_id).await.unwrap();
    assert_eq!(remote.state, OfferState::Countered);
    assert!(bridge.decline_offer(&offer_id).await.unwrap());
}

#[tokio::test]
async fn test_bridge_inventory_escrow_and_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/inventory"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"asset_handle": "500", "type_id": "7"},
            {"asset_handle": "501", "type_id": "8"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/escrow/765"))
        .and(query_param("token", "tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"days": 123})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/offers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"offer_id": " "})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/offers/accept-incoming"))
        .respond_with(ResponseTemplate::new(500).set_body_string("session expired"))
        .mount(&server)
        .await;

    let bridge = BridgeCustodian::new("store", &format!("{}/", server.uri()), Duration::from_secs(5)).unwrap();

    let inventory = bridge.get_inventory().await.unwrap();
    assert_eq!(inventory.len(), 2);
    assert_eq!(inventory[1].type_id, "8");

    assert_eq!(
        bridge.escrow_days("765", "tok").await.unwrap(),
        custody_runner::ESCROW_UNDETERMINED
    );

    let spec = OfferSpec {
        counterparty_id: "host".to_string(),
        token: "host-token".to_string(),
        give: vec!["500".to_string()],
        receive: Vec::new(),
    };
    assert!(bridge.send_offer(&spec, "STORAGE").await.is_err());

    let err = bridge.accept_incoming_offers().await.unwrap_err().to_string();
    assert!(err.contains("500"));
    assert!(err.contains("session expired"));
}
