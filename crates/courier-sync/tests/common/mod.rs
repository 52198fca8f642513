#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use courier_shared::{ConnectionQuality, ConnectivityState};
use courier_store::LocalCache;
use courier_sync::connectivity::{self, ConnectivityPublisher};
use courier_sync::{ChatRuntime, MemoryRemoteStore, RetryPolicy, SyncConfig};
use serde_json::json;

pub struct Harness {
    pub remote: Arc<MemoryRemoteStore>,
    pub network: ConnectivityPublisher,
    pub runtime: ChatRuntime,
}

impl Harness {
    pub fn go_online(&self) {
        self.network.go_online(ConnectionQuality::Good);
    }

    pub fn go_offline(&self) {
        self.network.go_offline();
    }
}

pub fn config() -> SyncConfig {
    SyncConfig {
        network_timeout: Duration::from_millis(500),
        retry: RetryPolicy::immediate(3),
        typing_ttl: Duration::from_millis(200),
        ..SyncConfig::default()
    }
}

/// In-memory cache, in-memory remote, replay worker not started.
pub fn harness(online: bool) -> Harness {
    let state = if online {
        ConnectivityState::online(ConnectionQuality::Good)
    } else {
        ConnectivityState::offline()
    };
    let (network, reader) = connectivity::channel(state);
    let remote = Arc::new(MemoryRemoteStore::new());
    let cache = LocalCache::open_in_memory().expect("in-memory cache");
    let runtime = ChatRuntime::with_cache(&config(), cache, remote.clone(), reader);
    Harness {
        remote,
        network,
        runtime,
    }
}

/// Put a chat between u1 (Alice) and u2 (Bob) straight into the remote
/// store, as another device would have.
pub fn seed_chat(remote: &MemoryRemoteStore, chat_id: &str) {
    remote
        .seed(
            &format!("chats/{chat_id}"),
            json!({
                "id": chat_id,
                "participants": [{"id": "u1", "name": "Alice"}, {"id": "u2", "name": "Bob"}],
                "participantIds": ["u1", "u2"],
                "createdAt": 1_000,
            }),
        )
        .expect("seed chat");
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
