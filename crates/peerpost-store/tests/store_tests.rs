//! Record store integration tests
//!
//! Exercise the public `RecordStore` API across accounts, contacts and messages,
//! including cascading deletes, conversation isolation and event delivery.

use peerpost_core::{
    Contact, EventBroker, EventPayload, IdentityKeyPair, Message, MessageState, PeerpostError,
    PublicKeyHex, StorageError, StoreConfig, Timestamp, Topic,
};
use peerpost_store::{keys, RecordStore};

fn open_store(broker: EventBroker) -> RecordStore {
    let store = RecordStore::new(StoreConfig::testing(), broker);
    store.open_temporary("integration").expect("open store");
    store
}

fn remote() -> PublicKeyHex {
    IdentityKeyPair::generate().public_key_hex()
}

#[test]
fn deleting_account_cascades_to_every_record() {
    let store = open_store(EventBroker::default());
    let doomed = store.auto_create_account().unwrap().public_key;
    let survivor = store.auto_create_account().unwrap().public_key;
    let peer = remote();

    for owner in [&doomed, &survivor] {
        let mut outgoing = Message::new(owner.clone(), peer.clone(), "out", Timestamp::now());
        store.save_or_update_message(owner, &mut outgoing).unwrap();
        let mut incoming = Message::new(peer.clone(), owner.clone(), "in", Timestamp::now());
        store.save_or_update_message(owner, &mut incoming).unwrap();
    }
    assert_eq!(store.contacts_count(&doomed).unwrap(), 1);

    let removed = store.delete_accounts(&[doomed.clone()]).unwrap();
    assert_eq!(removed, 4);

    assert!(!store.account_exists(&doomed).unwrap());
    assert_eq!(store.contacts_count(&doomed).unwrap(), 0);
    assert_eq!(store.messages_count(&doomed, &peer).unwrap(), 0);
    assert_eq!(store.account().unwrap().public_key, survivor);
    assert_eq!(store.messages_count(&survivor, &peer).unwrap(), 2);
    assert_eq!(store.contacts_count(&survivor).unwrap(), 1);
}

#[test]
fn conversations_are_isolated_and_ordered() {
    let store = open_store(EventBroker::default());
    let me = store.auto_create_account().unwrap().public_key;
    let alice = remote();
    let bob = remote();

    for ts in [5u64, 1, 3] {
        let mut to_alice = Message::new(me.clone(), alice.clone(), "a", Timestamp::new(ts));
        store.save_or_update_message(&me, &mut to_alice).unwrap();
        let mut from_bob = Message::new(bob.clone(), me.clone(), "b", Timestamp::new(ts + 1));
        store.save_or_update_message(&me, &mut from_bob).unwrap();
    }

    let with_alice = store.messages(&me, &alice, 0, 100).unwrap();
    assert_eq!(with_alice.len(), 3);
    assert!(with_alice.iter().all(|m| m.recipient == alice));
    assert!(with_alice
        .windows(2)
        .all(|pair| pair[0].created_at <= pair[1].created_at));

    let with_bob = store.messages(&me, &bob, 1, 1).unwrap();
    assert_eq!(with_bob.len(), 1);
    assert_eq!(with_bob[0].created_at, Timestamp::new(4));
    assert_eq!(store.unread_messages_count(&me, &bob).unwrap(), 3);
    assert_eq!(store.unread_messages_count(&me, &alice).unwrap(), 0);
}

#[test]
fn read_acknowledgement_raises_state_once() {
    let broker = EventBroker::default();
    let store = open_store(broker.clone());
    let me = store.auto_create_account().unwrap().public_key;
    let peer = remote();
    let mut changes = broker.subscribe(&[Topic::MessageStateChanged]);

    let mut sent = Message::new(me.clone(), peer.clone(), "hi", Timestamp::now());
    store.save_or_update_message(&me, &mut sent).unwrap();

    for state in [
        MessageState::Received,
        MessageState::Read,
        MessageState::Read,
        MessageState::Received,
    ] {
        let mut echo = sent.clone();
        echo.state = state;
        store.save_or_update_message(&me, &mut echo).unwrap();
    }

    let mut transitions = Vec::new();
    while let Some(event) = changes.try_recv() {
        if let EventPayload::MessageStateChanged { message, previous } = event.payload {
            transitions.push((previous, message.state));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (MessageState::Stateless, MessageState::Received),
            (MessageState::Received, MessageState::Read),
        ]
    );
    let stored = store.message(&me, &peer, &sent.id).unwrap().unwrap();
    assert_eq!(stored.state, MessageState::Read);
}

#[test]
fn late_subscriber_sees_cached_event() {
    let broker = EventBroker::default();
    let store = open_store(broker.clone());
    let account = store.auto_create_account().unwrap();

    let mut late = broker.subscribe(&[Topic::CurrentAccountChanged]);
    let event = late.try_recv().expect("cached event");
    assert!(event.cached);
    assert_eq!(
        event.payload,
        EventPayload::CurrentAccountChanged {
            previous: None,
            current: Some(account.public_key),
        }
    );
}

#[test]
fn contact_refresh_on_new_message() {
    let store = open_store(EventBroker::default());
    let me = store.auto_create_account().unwrap().public_key;
    let peer = remote();

    let mut contact = Contact::new(me.clone(), peer.clone());
    contact.identified = true;
    store.add_update_contact(&mut contact).unwrap();

    let mut msg = Message::new(peer.clone(), me.clone(), "yo", Timestamp::now());
    store.save_or_update_message(&me, &mut msg).unwrap();

    let refreshed = store.contact(&me, &peer).unwrap().unwrap();
    assert!(refreshed.identified);
    assert_eq!(refreshed.created_at, contact.created_at);
    assert!(refreshed.updated_at > contact.updated_at);
    assert_eq!(store.contacts_count(&me).unwrap(), 1);
}

#[test]
fn reopen_with_wrong_password_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::testing().with_path(dir.path().join("store"));

    let store = RecordStore::new(config.clone(), EventBroker::default());
    store.open("right").unwrap();
    let account = store.auto_create_account().unwrap();
    store.close().unwrap();

    let reopened = RecordStore::new(config.clone(), EventBroker::default());
    let err = reopened.open("wrong").unwrap_err();
    assert!(matches!(
        err,
        PeerpostError::Storage(StorageError::EncryptionKeyMismatch)
    ));

    reopened.open("right").unwrap();
    assert_eq!(reopened.account().unwrap().public_key, account.public_key);
    assert_eq!(reopened.account().unwrap().private_key, account.private_key);
}

#[test]
fn stored_keys_follow_layout() {
    let store = open_store(EventBroker::default());
    let me = store.auto_create_account().unwrap().public_key;
    let peer = remote();
    let mut msg = Message::new(me.clone(), peer.clone(), "layout", Timestamp::new(42));
    store.save_or_update_message(&me, &mut msg).unwrap();

    let expected = keys::message_key(&me, &msg).unwrap();
    let stored = store.message(&me, &peer, &msg.id).unwrap().unwrap();
    assert_eq!(keys::message_key(&me, &stored).unwrap(), expected);
    assert!(expected.starts_with(&keys::conversation_prefix(&me, &peer)));
    assert!(expected.contains("00000000000000000042"));
}

#[tokio::test]
async fn subscriber_wakes_on_inbound_message() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let broker = EventBroker::default();
    let store = open_store(broker.clone());
    let me = store.auto_create_account().unwrap().public_key;
    let peer = remote();
    let mut received = broker.subscribe(&[Topic::MessageReceived]);

    let writer = store.clone();
    let (me_w, peer_w) = (me.clone(), peer.clone());
    tokio::spawn(async move {
        let mut msg = Message::new(peer_w, me_w.clone(), "wake", Timestamp::now());
        writer.save_or_update_message(&me_w, &mut msg).unwrap();
    });

    let event = tokio::time::timeout(std::time::Duration::from_secs(5), received.recv())
        .await
        .expect("event in time")
        .expect("subscription open");
    match event.payload {
        EventPayload::MessageReceived(message) => {
            assert_eq!(message.text, "wake");
            assert_eq!(message.state, MessageState::Received);
            assert_eq!(message.sender, peer);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(store.unread_messages_count(&me, &peer).unwrap(), 1);
}
