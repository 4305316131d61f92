//! End-to-end scenarios for the exchange client.
//!
//! Two or more clients share one in-memory directory and relay, exactly as two
//! browsers would share one hosted backend.

use std::collections::HashMap;
use std::time::Duration;

use sealed_relay::{
    AuthState, ExchangeConfig, ExchangeError, FeedStatus, FileSecretStore, InMemoryDirectory, InMemoryRelay,
    InMemorySecretStore, MessageBody, MessageDirection, MessageLog, PlaceholderReason, SecretStore, SecureExchange,
    SyncConfig, ViewUpdate, PRIVATE_KEY_SLOT,
};
use tokio::sync::broadcast;

type Client<S> = SecureExchange<InMemoryDirectory, InMemoryRelay, S>;

fn test_messages() -> HashMap<&'static str, &'static str> {
    let mut messages = HashMap::new();
    messages.insert("single_char", "X");
    messages.insert("whitespace", "   \t\n   ");
    messages.insert("punctuation", "!@#$%^&*()_+-=[]{}\\|;':\",./<>?");
    messages.insert("newlines", "Line 1\nLine 2\nLine 3");
    messages.insert("emoji_zwj", "Family: 👨‍👩‍👧‍👦");
    messages.insert("chinese", "你好世界 - Hello World");
    messages.insert("arabic", "مرحبا بالعالم");
    messages.insert("accents", "Café résumé naïve");
    messages.insert("json", r#"{"key": "value", "num": 42}"#);
    messages
}

fn config() -> ExchangeConfig {
    ExchangeConfig {
        sync: SyncConfig {
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(40),
            feed_buffer: 64,
        },
        ..Default::default()
    }
}

fn signed_in(identity: &str) -> AuthState {
    AuthState::SignedIn {
        identity: identity.to_string(),
        handle: format!("{}@example.com", identity.to_lowercase()),
    }
}

async fn client<S: SecretStore>(
    directory: &InMemoryDirectory,
    relay: &InMemoryRelay,
    secrets: S,
    identity: &str,
    username: &str,
) -> Client<S> {
    let client = SecureExchange::new(directory.clone(), relay.clone(), secrets, config());
    client.apply_auth(&signed_in(identity)).await.unwrap();
    client.bootstrap(username).await.unwrap();
    client
}

async fn wait_for(updates: &mut broadcast::Receiver<ViewUpdate>, wanted: fn(&ViewUpdate) -> bool) -> ViewUpdate {
    loop {
        match tokio::time::timeout(Duration::from_secs(10), updates.recv()).await {
            Ok(Ok(update)) if wanted(&update) => return update,
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(e)) => panic!("update channel closed: {}", e),
            Err(_) => panic!("timed out waiting for update"),
        }
    }
}

#[tokio::test]
async fn test_hello_between_two_users() {
    let directory = InMemoryDirectory::new();
    let relay = InMemoryRelay::new();
    let alice = client(&directory, &relay, InMemorySecretStore::new(), "A", "alice").await;
    let bob = client(&directory, &relay, InMemorySecretStore::new(), "B", "bob").await;

    let mut updates = alice.subscribe_updates();
    alice.select_peer(Some("B")).await.unwrap();
    wait_for(&mut updates, |u| matches!(u, ViewUpdate::Connected)).await;

    let found = bob.search_users("ali").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].identity, "A");
    bob.select_peer(Some(found[0].identity.as_str())).await.unwrap();
    bob.send_to_selected("hello").await.unwrap();

    let update = wait_for(&mut updates, |u| matches!(u, ViewUpdate::Message(_))).await;
    let ViewUpdate::Message(record) = update else { unreachable!() };
    assert_eq!(record.body, MessageBody::Text("hello".to_string()));
    assert_eq!(record.sender, "B");
    assert_eq!(record.direction, MessageDirection::Received);

    // Only ciphertext reached the relay.
    let stored = relay.query_for("A").await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(!stored[0].payload.ciphertext.contains("hello"));
    assert_eq!(alice.feed_status().await, FeedStatus::Live);
}

#[tokio::test]
async fn test_unicode_messages_arrive_in_order() {
    let directory = InMemoryDirectory::new();
    let relay = InMemoryRelay::new();
    let alice = client(&directory, &relay, InMemorySecretStore::new(), "A", "alice").await;
    let bob = client(&directory, &relay, InMemorySecretStore::new(), "B", "bob").await;

    let mut names: Vec<&str> = test_messages().keys().copied().collect();
    names.sort();
    let messages = test_messages();
    for name in &names {
        bob.send_text("A", messages[name]).await.unwrap();
    }

    let records = alice.select_peer(Some("B")).await.unwrap();
    let received: Vec<&str> = records.iter().map(|r| r.body.display()).collect();
    let expected: Vec<&str> = names.iter().map(|name| messages[name]).collect();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_unknown_user_and_failed_send() {
    let directory = InMemoryDirectory::new();
    let relay = InMemoryRelay::new();
    let alice = client(&directory, &relay, InMemorySecretStore::new(), "A", "alice").await;

    assert!(alice.search_users("zed").await.unwrap().is_empty());
    assert_eq!(
        alice.send_text("Z", "anyone?").await,
        Err(ExchangeError::RecipientKeyNotFound("Z".to_string()))
    );

    directory.set_offline(true);
    assert!(matches!(
        alice.search_users("bob").await,
        Err(ExchangeError::DirectoryUnavailable(_))
    ));
    directory.set_offline(false);

    // Alice can always message herself; a rejected insert must leave no trace.
    relay.set_reject_inserts(true);
    assert!(matches!(
        alice.send_text("A", "note to self").await,
        Err(ExchangeError::Transmission(_))
    ));
    assert!(alice.records().await.is_empty());
}

#[tokio::test]
async fn test_feed_survives_relay_restart() {
    let directory = InMemoryDirectory::new();
    let relay = InMemoryRelay::new();
    let alice = client(&directory, &relay, InMemorySecretStore::new(), "A", "alice").await;
    let bob = client(&directory, &relay, InMemorySecretStore::new(), "B", "bob").await;

    let mut updates = alice.subscribe_updates();
    alice.select_peer(Some("B")).await.unwrap();
    wait_for(&mut updates, |u| matches!(u, ViewUpdate::Connected)).await;

    bob.send_text("A", "before").await.unwrap();
    wait_for(&mut updates, |u| matches!(u, ViewUpdate::Message(_))).await;

    relay.set_refuse_listen(true);
    relay.disconnect_all("relay restarting").await;
    wait_for(&mut updates, |u| matches!(u, ViewUpdate::Reconnecting { .. })).await;
    bob.send_text("A", "while down").await.unwrap();
    relay.set_refuse_listen(false);

    wait_for(&mut updates, |u| matches!(u, ViewUpdate::Resynced { .. })).await;
    bob.send_text("A", "after").await.unwrap();
    wait_for(&mut updates, |u| matches!(u, ViewUpdate::Message(_))).await;

    let texts: Vec<String> = alice
        .conversation()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.body.display().to_string())
        .collect();
    assert_eq!(texts, vec!["before", "while down", "after"]);
}

#[tokio::test]
async fn test_key_persists_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("secrets.json");
    let directory = InMemoryDirectory::new();
    let relay = InMemoryRelay::new();

    let alice = client(&directory, &relay, FileSecretStore::new(&path), "A", "alice").await;
    let bob = client(&directory, &relay, InMemorySecretStore::new(), "B", "bob").await;
    let first_fingerprint = alice.key_fingerprint().await.unwrap();
    bob.send_text("A", "still readable").await.unwrap();
    drop(alice);

    // A new process on the same device
    let alice = client(&directory, &relay, FileSecretStore::new(&path), "A", "alice").await;
    assert_eq!(alice.key_fingerprint().await.unwrap(), first_fingerprint);
    let records = alice.select_peer(Some("B")).await.unwrap();
    assert_eq!(records[0].body.text(), Some("still readable"));
}

#[tokio::test]
async fn test_key_loss_shows_placeholders() {
    let directory = InMemoryDirectory::new();
    let relay = InMemoryRelay::new();
    let bob = client(&directory, &relay, InMemorySecretStore::new(), "B", "bob").await;
    let alice = client(&directory, &relay, InMemorySecretStore::new(), "A", "alice").await;
    bob.send_text("A", "sealed to the old key").await.unwrap();

    // Alice clears storage and bootstraps again, rotating her key.
    let fresh = client(&directory, &relay, InMemorySecretStore::new(), "A", "alice").await;
    assert_ne!(fresh.key_fingerprint().await, alice.key_fingerprint().await);

    let records = fresh.select_peer(Some("B")).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].body,
        MessageBody::Placeholder(PlaceholderReason::Undecryptable)
    );
    assert_eq!(records[0].body.display(), "[decrypt error]");

    // Without any key at all the reason is explicit.
    let keyless = SecureExchange::new(directory.clone(), relay.clone(), InMemorySecretStore::new(), config());
    keyless.apply_auth(&signed_in("A")).await.unwrap();
    let records = keyless.select_peer(Some("B")).await.unwrap();
    assert_eq!(records[0].body.display(), "[no private key stored locally]");
}

#[tokio::test]
async fn test_logout_stops_feed() {
    let directory = InMemoryDirectory::new();
    let relay = InMemoryRelay::new();
    let secrets = InMemorySecretStore::new();
    let alice = client(&directory, &relay, secrets.clone(), "A", "alice").await;

    let mut updates = alice.subscribe_updates();
    alice.select_peer(Some("B")).await.unwrap();
    wait_for(&mut updates, |u| matches!(u, ViewUpdate::Connected)).await;

    alice.apply_auth(&AuthState::SignedOut).await.unwrap();
    assert_eq!(alice.feed_status().await, FeedStatus::Closed);
    assert_eq!(relay.listener_count().await, 0);
    assert!(alice.session().await.is_none());
    assert!(matches!(alice.conversation().await, Err(ExchangeError::NotSignedIn)));

    // The private key stays on the device.
    assert!(secrets.get(PRIVATE_KEY_SLOT).await.unwrap().is_some());
}
