//! Shared fixture for the WebSocket integration tests: a hub bound to an
//! ephemeral port with in-memory collaborators, so no database is needed.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chat_protocol::Envelope;
use chat_test_utils::MockChatClient;
use hub::auth::{AuthError, RevokedTokenChecker, TokenClaims, TokenVerifier};
use hub::config::HubConfig;
use hub::repo::identity::IdentityService;
use hub::repo::users::{User, UserRepository};
use hub::repo::RepoError;
use hub::{build_router, AppState, Collaborators};
use uuid::Uuid;

pub const ALICE: &str = "11111111-1111-4111-8111-111111111111";
pub const BOB: &str = "22222222-2222-4222-8222-222222222222";

pub const ALICE_TOKEN: &str = "token-alice";
pub const BOB_TOKEN: &str = "token-bob";

pub struct FakeUsers {
    pub known: Mutex<HashSet<String>>,
    pub fail_batches: AtomicBool,
    pub batches: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl UserRepository for FakeUsers {
    async fn find_by_id(&self, user_id: &str) -> Result<User, RepoError> {
        if self.known.lock().expect("lock").contains(user_id) {
            Ok(User {
                user_id: Uuid::parse_str(user_id).unwrap_or_else(|_| Uuid::new_v4()),
                username: "user".to_owned(),
                last_seen: None,
            })
        } else {
            Err(RepoError::NotFound)
        }
    }

    async fn update_last_seen_batch(&self, user_ids: &[String]) -> Result<(), RepoError> {
        if self.fail_batches.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RepoError::Database("injected failure".to_owned()));
        }
        self.batches.lock().expect("lock").push(user_ids.to_vec());
        Ok(())
    }
}

pub struct FakeVerifier {
    pub tokens: HashMap<String, TokenClaims>,
}

#[async_trait]
impl TokenVerifier for FakeVerifier {
    async fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

pub struct FakeRevoked {
    pub revoked: Mutex<HashSet<String>>,
}

#[async_trait]
impl RevokedTokenChecker for FakeRevoked {
    async fn is_revoked(&self, jti: &str) -> Result<bool, RepoError> {
        Ok(self.revoked.lock().expect("lock").contains(jti))
    }
}

pub struct FakeIdentity {
    pub keys: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl IdentityService for FakeIdentity {
    async fn get_public_key(&self, user_id: &str) -> Result<Vec<u8>, RepoError> {
        self.keys
            .lock()
            .expect("lock")
            .get(user_id)
            .cloned()
            .ok_or(RepoError::NotFound)
    }

    async fn get_fingerprint(&self, user_id: &str) -> Result<String, RepoError> {
        let key = self.get_public_key(user_id).await?;
        Ok(hub::repo::identity::fingerprint(&key))
    }
}

pub struct TestHub {
    pub state: AppState,
    pub ws_url: String,
    pub users: Arc<FakeUsers>,
    pub revoked: Arc<FakeRevoked>,
}

pub fn test_config() -> HubConfig {
    HubConfig {
        shard_count: 1,
        send_timeout: Duration::from_millis(500),
        ws_auth_timeout: Duration::from_secs(2),
        ws_ping_period: Duration::from_secs(1),
        ws_pong_wait: Duration::from_secs(10),
        ws_write_wait: Duration::from_secs(2),
        ws_send_buf_size: 32,
        processor_workers: 2,
        processor_queue_size: 64,
        ..HubConfig::default()
    }
}

/// Binds the hub on an ephemeral port with Alice and Bob provisioned.
pub async fn spawn_hub(config: HubConfig) -> TestHub {
    let users = Arc::new(FakeUsers {
        known: Mutex::new([ALICE.to_owned(), BOB.to_owned()].into()),
        fail_batches: AtomicBool::new(false),
        batches: Mutex::new(Vec::new()),
    });
    let revoked = Arc::new(FakeRevoked {
        revoked: Mutex::new(HashSet::new()),
    });
    let verifier = Arc::new(FakeVerifier {
        tokens: [
            (
                ALICE_TOKEN.to_owned(),
                TokenClaims {
                    user_id: ALICE.to_owned(),
                    username: "alice".to_owned(),
                    jti: "jti-alice".to_owned(),
                },
            ),
            (
                BOB_TOKEN.to_owned(),
                TokenClaims {
                    user_id: BOB.to_owned(),
                    username: "bob".to_owned(),
                    jti: "jti-bob".to_owned(),
                },
            ),
        ]
        .into(),
    });
    let identity = Arc::new(FakeIdentity {
        keys: Mutex::new(HashMap::new()),
    });

    let state = AppState::new(
        config,
        Collaborators {
            users: Arc::clone(&users) as Arc<dyn UserRepository>,
            verifier,
            revoked: Arc::clone(&revoked) as Arc<dyn RevokedTokenChecker>,
            identity,
        },
    );
    let router = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });

    TestHub {
        state,
        ws_url: format!("ws://{addr}/ws/v1/chat"),
        users,
        revoked,
    }
}

pub async fn connect_as(hub: &TestHub, token: &str) -> MockChatClient {
    let mut client = MockChatClient::connect(&hub.ws_url).await.expect("connect");
    client.authenticate(token).await.expect("authenticate");
    client
}

pub async fn recv_within(client: &mut MockChatClient, secs: u64) -> Option<Envelope> {
    match tokio::time::timeout(Duration::from_secs(secs), client.recv_envelope()).await {
        Ok(Ok(envelope)) => Some(envelope),
        _ => None,
    }
}

/// Asserts quiet: nothing arrives for a short window.
pub async fn assert_no_frame(client: &mut MockChatClient) {
    let got = tokio::time::timeout(Duration::from_millis(400), client.recv_envelope()).await;
    assert!(got.is_err(), "expected silence, got {got:?}");
}

/// Polls until the predicate holds or the deadline passes.
pub async fn wait_until<F, Fut>(mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if predicate().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within deadline");
}
