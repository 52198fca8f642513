//! Source selection, live streams and write-through of the chat repository.

mod common;

use chrono::DateTime;
use courier_shared::{total_unread, ChatPreview, Message, OperationType, Participant};
use courier_sync::WriteOutcome;
use serde_json::json;

use common::{harness, seed_chat, wait_for};

fn at(id: &str, sender: &str, ts_millis: i64) -> Message {
    let mut m = Message::text(sender, id);
    m.id = id.to_string();
    m.timestamp = DateTime::from_timestamp_millis(ts_millis).unwrap();
    m
}

fn preview(chat_id: &str, unread: u32) -> ChatPreview {
    ChatPreview {
        chat_id: chat_id.to_string(),
        other_party_id: format!("peer-{chat_id}"),
        other_party_name: format!("Peer {chat_id}"),
        last_message: String::new(),
        last_message_time: None,
        unread_count: unread,
        is_online: false,
    }
}

fn alice() -> Participant {
    Participant::new("u1", "Alice")
}

fn bob() -> Participant {
    Participant::new("u2", "Bob")
}

#[tokio::test]
async fn messages_are_sorted_and_resends_are_ignored() {
    let h = harness(true);
    let chats = h.runtime.chats();
    let (chat, _) = chats.create_chat(&alice(), &bob()).await.unwrap();

    chats.send_message_with(&chat.id, at("m2", "u1", 2_000)).await.unwrap();
    chats.send_message_with(&chat.id, at("m1", "u2", 1_000)).await.unwrap();
    chats.send_message_with(&chat.id, at("m1", "u2", 1_000)).await.unwrap();

    let mut stream = chats.get_messages(&chat.id);
    let ids: Vec<String> = stream
        .recv()
        .await
        .unwrap()
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec!["m1", "m2"]);

    let remote_unread = h
        .remote
        .get_value(&format!("chats/{}/unread/u1", chat.id))
        .unwrap();
    assert_eq!(remote_unread, json!(1));
}

#[tokio::test]
async fn chat_list_total_unread() {
    let h = harness(false);
    h.runtime
        .cache()
        .cache_chat_previews("u1", vec![preview("c1", 3), preview("c2", 2)])
        .await
        .unwrap();

    let mut list = h.runtime.chats().get_chat_list("u1");
    let previews = list.recv().await.unwrap().unwrap();
    assert_eq!(total_unread(&previews), 5);
}

#[tokio::test]
async fn offline_chat_list_follows_local_writes() {
    let h = harness(false);
    let chats = h.runtime.chats();
    let (chat, outcome) = chats.create_chat(&alice(), &bob()).await.unwrap();
    assert_eq!(outcome, WriteOutcome::LocalOnly);

    let mut list = chats.get_chat_list("u1");
    let first = list.recv().await.unwrap().unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].other_party_name, "Bob");

    chats.send_message(&chat.id, "u2", "are you there?").await.unwrap();
    let updated = list.recv().await.unwrap().unwrap();
    assert_eq!(updated[0].last_message, "are you there?");
    assert_eq!(updated[0].unread_count, 1);

    chats.mark_all_as_read(&chat.id, "u1").await.unwrap();
    let read = list.recv().await.unwrap().unwrap();
    assert_eq!(read[0].unread_count, 0);
}

#[tokio::test]
async fn create_chat_dedups_through_remote_when_online() {
    let h = harness(true);
    let chats = h.runtime.chats();

    let (first, outcome) = chats.create_chat(&alice(), &bob()).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Synced);
    let (again, _) = chats.create_chat(&bob(), &alice()).await.unwrap();

    assert_eq!(first.id, again.id);
    assert_eq!(h.remote.get_value("chats").unwrap().as_object().unwrap().len(), 1);
}

#[tokio::test]
async fn create_chat_dedups_locally_when_offline() {
    let h = harness(false);
    let chats = h.runtime.chats();

    let (first, _) = chats.create_chat(&alice(), &bob()).await.unwrap();
    let (again, _) = chats.create_chat(&bob(), &alice()).await.unwrap();
    assert_eq!(first.id, again.id);

    let queued = h.runtime.sync_manager().pending_operations().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].op_type, OperationType::CreateChat);
}

#[tokio::test]
async fn chat_id_lookup_uses_one_source_and_never_caches_misses() {
    let h = harness(false);
    let chats = h.runtime.chats();
    assert_eq!(chats.get_chat_id("u1", "u2").await.unwrap(), None);

    seed_chat(&h.remote, "c9");

    h.go_online();
    assert_eq!(chats.get_chat_id("u2", "u1").await.unwrap().as_deref(), Some("c9"));

    h.go_offline();
    assert_eq!(chats.get_chat_id("u1", "u2").await.unwrap().as_deref(), Some("c9"));
}

#[tokio::test]
async fn remote_messages_are_written_through_for_offline_reads() {
    let h = harness(true);
    let chats = h.runtime.chats();
    h.remote
        .seed("messages/c1/r1", serde_json::to_value(at("r1", "u2", 5_000)).unwrap())
        .unwrap();

    let mut online = chats.get_messages("c1");
    assert_eq!(online.recv().await.unwrap().unwrap().len(), 1);
    online.cancel();

    h.go_offline();
    let mut offline = chats.get_messages("c1");
    let cached = offline.recv().await.unwrap().unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].id, "r1");
}

#[tokio::test]
async fn queued_send_stays_visible_in_the_online_view() {
    let h = harness(true);
    let chats = h.runtime.chats();
    seed_chat(&h.remote, "c1");
    h.remote
        .seed("messages/c1/r1", serde_json::to_value(at("r1", "u2", 1_000)).unwrap())
        .unwrap();

    h.remote.fail_next_writes(1);
    let (mine, outcome) = chats.send_message("c1", "u1", "pending").await.unwrap();
    assert!(matches!(outcome, WriteOutcome::QueuedForRetry { .. }));

    let mut stream = chats.get_messages("c1");
    let shown = stream.recv().await.unwrap().unwrap();
    assert_eq!(shown.len(), 2);
    assert!(shown.iter().any(|m| m.id == mine.id));

    let cache = h.runtime.cache().clone();
    let id = mine.id.clone();
    wait_for("merged list to be cached", || {
        let cache = cache.clone();
        let id = id.clone();
        async move {
            let cached = cache.get_cached_messages("c1").await.unwrap();
            cached.len() == 2 && cached.iter().any(|m| m.id == id)
        }
    })
    .await;
}

#[tokio::test]
async fn typing_subscription_releases_remote_listener_on_cancel() {
    let h = harness(true);
    let chats = h.runtime.chats();

    let mut typing = chats.get_typing_status("c1", "u2");
    assert!(!typing.recv().await.unwrap().unwrap().is_typing);
    assert_eq!(h.remote.listener_count(), 1);

    chats.set_typing_status("c1", "u2", true).await.unwrap();
    assert!(typing.recv().await.unwrap().unwrap().is_typing);

    // Nobody refreshes the indicator, so it lapses after the TTL.
    let lapsed = tokio::time::timeout(std::time::Duration::from_secs(2), typing.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!lapsed.is_typing);

    typing.cancel();
    assert_eq!(h.remote.listener_count(), 0);
}

#[tokio::test]
async fn search_reads_the_source_picked_at_call_time() {
    let h = harness(true);
    let chats = h.runtime.chats();
    chats.create_chat(&alice(), &bob()).await.unwrap();
    chats
        .create_chat(&alice(), &Participant::new("u3", "Carol"))
        .await
        .unwrap();

    let online = chats.search_chats("u1", "car").await.unwrap();
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].other_party_name, "Carol");

    h.go_offline();
    let offline = chats.search_chats("u1", "bo").await.unwrap();
    assert_eq!(offline.len(), 1);
    assert_eq!(offline[0].other_party_name, "Bob");
}

#[tokio::test]
async fn presence_is_published_only_online() {
    let h = harness(false);
    let chats = h.runtime.chats();
    chats.set_presence("u1", true).await.unwrap();
    assert_eq!(h.remote.write_count(), 0);
    assert!(!h.runtime.sync_manager().has_pending_operations().await.unwrap());

    h.go_online();
    chats.set_presence("u1", true).await.unwrap();
    assert_eq!(h.remote.get_value("users/u1/online"), Some(json!(true)));
}
