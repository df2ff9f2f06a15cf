//! Handshake behavior over a real socket.

mod common;

use std::time::Duration;

use chat_protocol::{AuthRequest, Envelope, MessageType};
use chat_test_utils::MockChatClient;
use common::*;

#[tokio::test]
async fn valid_token_authenticates() {
    let hub = spawn_hub(test_config()).await;
    let _alice = connect_as(&hub, ALICE_TOKEN).await;
    wait_until(|| async { hub.state.hub.is_user_online(ALICE).await }).await;
    assert_eq!(hub.state.hub.connected_total().await, 1);
}

#[tokio::test]
async fn bearer_prefixed_token_is_accepted() {
    let hub = spawn_hub(test_config()).await;
    let mut client = MockChatClient::connect(&hub.ws_url).await.expect("connect");
    client
        .authenticate(&format!("Bearer {ALICE_TOKEN}"))
        .await
        .expect("authenticate");
}

#[tokio::test]
async fn first_envelope_must_be_auth() {
    let hub = spawn_hub(test_config()).await;
    let mut client = MockChatClient::connect(&hub.ws_url).await.expect("connect");
    client
        .send_envelope(&Envelope {
            message_type: MessageType::Typing,
            payload: serde_json::json!({"to": BOB, "is_typing": true}),
        })
        .await
        .expect("send");

    let close = client.recv_close().await.expect("read close");
    let close = close.expect("close frame expected");
    assert_eq!(close.code, 1008);
    assert_eq!(close.reason, "authentication required");
}

#[tokio::test]
async fn invalid_token_closes_with_policy_reason() {
    let hub = spawn_hub(test_config()).await;
    let mut client = MockChatClient::connect(&hub.ws_url).await.expect("connect");
    client
        .send_envelope(
            &Envelope::new(
                MessageType::Auth,
                &AuthRequest {
                    token: "no-such-token".to_owned(),
                },
            )
            .expect("envelope"),
        )
        .await
        .expect("send");

    let close = client.recv_close().await.expect("read close");
    let close = close.expect("close frame expected");
    assert_eq!(close.code, 1008);
    assert_eq!(close.reason, "invalid token");
}

#[tokio::test]
async fn revoked_token_closes_with_policy_reason() {
    let hub = spawn_hub(test_config()).await;
    hub.revoked
        .revoked
        .lock()
        .expect("lock")
        .insert("jti-alice".to_owned());

    let mut client = MockChatClient::connect(&hub.ws_url).await.expect("connect");
    client
        .send_envelope(
            &Envelope::new(
                MessageType::Auth,
                &AuthRequest {
                    token: ALICE_TOKEN.to_owned(),
                },
            )
            .expect("envelope"),
        )
        .await
        .expect("send");

    let close = client.recv_close().await.expect("read close");
    let close = close.expect("close frame expected");
    assert_eq!(close.code, 1008);
    assert_eq!(close.reason, "token revoked");
}

#[tokio::test]
async fn auth_deadline_expiry_closes_the_socket() {
    let mut config = test_config();
    config.ws_auth_timeout = Duration::from_millis(300);
    let hub = spawn_hub(config).await;

    let mut client = MockChatClient::connect(&hub.ws_url).await.expect("connect");
    // Say nothing and wait out the deadline.
    let close = client.recv_close().await.expect("read close");
    let close = close.expect("close frame expected");
    assert_eq!(close.code, 1008);
    assert_eq!(close.reason, "authentication required");
}

#[tokio::test]
async fn malformed_auth_frame_closes_with_invalid_payload_code() {
    let hub = spawn_hub(test_config()).await;
    let mut client = MockChatClient::connect(&hub.ws_url).await.expect("connect");
    client.send_raw("{not json").await.expect("send");

    let close = client.recv_close().await.expect("read close");
    let close = close.expect("close frame expected");
    assert_eq!(close.code, 1007);
}

#[tokio::test]
async fn second_auth_envelope_gets_unknown_message_type_error() {
    let hub = spawn_hub(test_config()).await;
    let mut alice = connect_as(&hub, ALICE_TOKEN).await;

    alice
        .send_envelope(
            &Envelope::new(
                MessageType::Auth,
                &AuthRequest {
                    token: ALICE_TOKEN.to_owned(),
                },
            )
            .expect("envelope"),
        )
        .await
        .expect("send");

    let reply = recv_within(&mut alice, 2).await.expect("error envelope");
    assert_eq!(reply.message_type, MessageType::Error);
    assert_eq!(
        reply.payload.get("code").and_then(|v| v.as_str()),
        Some("UNKNOWN_MESSAGE_TYPE")
    );
}
