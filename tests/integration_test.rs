use hyphae::{
    ChannelKey, Database, DatabaseConfig, DatabaseKey, DatabaseOptions, EphemeralMessage, Event, EventListener,
    InMemorySettingsStore, LogStorage, NodeSettings, PutError, SessionError, SessionHandle, SessionState,
};
use serde_json::{json, Value};
use slog::Drain;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

const SANITY_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn read_only_peer_syncs_then_writes_after_authorization() -> Result<(), Box<dyn Error>> {
    let a = create_origin("a", None).await?;
    a.put("/table", json!({"k1": "v1"})).await?;

    let b = open_peer("b", a.database_key(), None).await?;
    sync_once(&a, &b).await?;
    assert_eq!(json!({"k1": "v1"}), b.get("/table").await?);

    // B can read but not write until A authorizes it.
    let b_key = b.local_read_key().expect("Peer has a writer key");
    match b.put("/table", json!({"k2": "v2"})).await {
        Err(e @ PutError::Unauthorized(_)) => assert!(!e.is_retryable()),
        other => panic!("Expected unauthorized, got {:?}", other),
    }

    a.authorize(b_key).await?;
    sync_once(&a, &b).await?;
    assert!(b.is_authorized(b_key).await?);

    b.put("/table", json!({"k2": "v2"})).await?;
    sync_once(&a, &b).await?;

    assert_eq!(json!({"k2": "v2"}), a.get("/table").await?);
    assert_eq!(json!({"k2": "v2"}), b.get("/table").await?);

    Ok(())
}

#[tokio::test]
async fn read_only_node_syncs_but_never_writes() -> Result<(), Box<dyn Error>> {
    let a = create_origin("a", None).await?;
    a.put("/table", json!({"k1": "v1"})).await?;

    let reader = hyphae::try_open_database_read_only(config("reader", None), a.database_key()).await?;
    assert_eq!(None, reader.local_read_key());
    sync_once(&a, &reader).await?;
    assert_eq!(json!({"k1": "v1"}), reader.get("/table").await?);

    match reader.put("/table", json!({"k2": "v2"})).await {
        Err(e @ PutError::NotAWriter) => assert!(!e.is_retryable()),
        other => panic!("Expected not a writer, got {:?}", other),
    }

    Ok(())
}

#[tokio::test]
async fn syncing_twice_changes_nothing() -> Result<(), Box<dyn Error>> {
    let a = create_origin("a", None).await?;
    for i in 0..10 {
        a.put(format!("/n/{}", i), json!(i)).await?;
    }

    let b = open_peer("b", a.database_key(), None).await?;
    sync_once(&a, &b).await?;
    let before = b.get("/n/9").await?;

    let mut b_events = b.events().await?;
    sync_once(&a, &b).await?;
    sync_once(&b, &a).await?;

    assert_eq!(before, b.get("/n/9").await?);
    while let Some(event) = next_event_within(&mut b_events, Duration::from_millis(200)).await {
        match event {
            Event::EntryReceived(data) => panic!("Entry applied twice: {:?}", data),
            Event::SessionClosed(data) => assert_eq!(None, data.error),
            _ => {}
        }
    }

    Ok(())
}

#[tokio::test]
async fn live_session_pushes_new_entries() -> Result<(), Box<dyn Error>> {
    let a = create_origin("a", None).await?;
    let b = open_peer("b", a.database_key(), None).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watch = b
        .watch("/status", move |value: Option<&Value>| {
            let _ = tx.send(value.cloned());
        })
        .await?;

    let (mut a_session, mut b_session) = connect(&a, &b, true).await?;
    assert_eq!(SessionState::Live, wait_for_state(&mut a_session, SessionState::Live).await);
    assert_eq!(SessionState::Live, wait_for_state(&mut b_session, SessionState::Live).await);

    a.put("/status", json!("online")).await?;
    let pushed = tokio::time::timeout(SANITY_TIMEOUT, rx.recv())
        .await
        .expect("Unexpected timeout")
        .expect("Watch closed");
    assert_eq!(Some(json!("online")), pushed);

    a_session.close();
    assert!(a_session.join().await.is_ok());
    // B sees a peer hanging up while live, which is a clean end too.
    assert!(b_session.join().await.is_ok());

    Ok(())
}

#[tokio::test]
async fn redundant_sessions_deliver_message_once() -> Result<(), Box<dyn Error>> {
    let channel_key = ChannelKey::generate();
    let a = create_origin("a", Some(channel_key.clone())).await?;
    let b = open_peer("b", a.database_key(), Some(channel_key)).await?;
    let mut b_events = b.events().await?;

    let mut sessions = vec![];
    for _ in 0..2 {
        let (a_session, b_session) = connect(&a, &b, true).await?;
        sessions.push(a_session);
        sessions.push(b_session);
    }
    for session in sessions.iter_mut() {
        assert_eq!(SessionState::Live, wait_for_state(session, SessionState::Live).await);
    }

    a.broadcast("authorization-request", json!({"name": "b"})).await?;

    let message = next_message(&mut b_events).await;
    assert_eq!("authorization-request", message.action);
    assert_eq!(a.local_read_key(), Some(message.sender));
    assert_eq!(json!({"name": "b"}), message.payload);
    assert_no_message(&mut b_events, Duration::from_millis(300)).await;

    Ok(())
}

#[tokio::test]
async fn relay_forwards_without_reading() -> Result<(), Box<dyn Error>> {
    let channel_key = ChannelKey::generate();
    let a = create_origin("a", Some(channel_key.clone())).await?;
    let relay = open_peer("relay", a.database_key(), None).await?;
    let c = open_peer("c", a.database_key(), Some(channel_key)).await?;
    let mut relay_events = relay.events().await?;
    let mut c_events = c.events().await?;

    let (mut a_relay, mut relay_a) = connect(&a, &relay, true).await?;
    let (mut relay_c, mut c_relay) = connect(&relay, &c, true).await?;
    for session in vec![&mut a_relay, &mut relay_a, &mut relay_c, &mut c_relay] {
        assert_eq!(SessionState::Live, wait_for_state(session, SessionState::Live).await);
    }

    // A and C are never connected directly.
    a.broadcast("hello", json!(1)).await?;
    let message = next_message(&mut c_events).await;
    assert_eq!("hello", message.action);
    assert_no_message(&mut relay_events, Duration::from_millis(300)).await;

    assert!(matches!(
        relay.broadcast("hello", json!(2)).await,
        Err(hyphae::BroadcastError::NoChannelKey)
    ));

    // Log entries travel the same way.
    a.put("/through", json!("relay")).await?;
    let deadline = tokio::time::Instant::now() + SANITY_TIMEOUT;
    loop {
        if let Ok(value) = c.get("/through").await {
            assert_eq!(json!("relay"), value);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "Entry never reached C");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    Ok(())
}

#[tokio::test]
async fn sessions_for_different_databases_are_refused() -> Result<(), Box<dyn Error>> {
    let a = create_origin("a", None).await?;
    let d = create_origin("d", None).await?;

    let (a_session, d_session) = connect(&a, &d, false).await?;
    for result in vec![a_session.join().await, d_session.join().await] {
        match result {
            Err(e @ SessionError::WrongDatabase) => assert!(!e.is_retryable()),
            other => panic!("Expected wrong database, got {:?}", other),
        }
    }

    Ok(())
}

// -- Helpers --

async fn create_origin(name: &str, channel_key: Option<ChannelKey>) -> Result<Database, Box<dyn Error>> {
    Ok(hyphae::try_create_database(config(name, channel_key)).await?)
}

async fn open_peer(
    name: &str,
    database_key: DatabaseKey,
    channel_key: Option<ChannelKey>,
) -> Result<Database, Box<dyn Error>> {
    Ok(hyphae::try_open_database(config(name, channel_key), database_key).await?)
}

fn config(name: &str, channel_key: Option<ChannelKey>) -> DatabaseConfig {
    DatabaseConfig {
        info_logger: create_root_logger_for_stdout(name.to_string()),
        settings: NodeSettings::default(),
        settings_store: Arc::new(InMemorySettingsStore::new()),
        storage: LogStorage::InMemory,
        channel_key,
        options: DatabaseOptions {
            sync_batch_size: Some(4),
            ..DatabaseOptions::default()
        },
    }
}

async fn connect(a: &Database, b: &Database, live: bool) -> Result<(SessionHandle, SessionHandle), Box<dyn Error>> {
    let (a_stream, b_stream) = tokio::io::duplex(64 * 1024);
    let a_session = a.replicate(a_stream, live).await?;
    let b_session = b.replicate(b_stream, live).await?;
    Ok((a_session, b_session))
}

/// One non-live sync, which ends on its own once both sides have everything.
async fn sync_once(a: &Database, b: &Database) -> Result<(), Box<dyn Error>> {
    let (a_session, b_session) = connect(a, b, false).await?;
    tokio::time::timeout(SANITY_TIMEOUT, a_session.join())
        .await
        .expect("Unexpected timeout")?;
    tokio::time::timeout(SANITY_TIMEOUT, b_session.join())
        .await
        .expect("Unexpected timeout")?;
    Ok(())
}

async fn wait_for_state(session: &mut SessionHandle, state: SessionState) -> SessionState {
    tokio::time::timeout(SANITY_TIMEOUT, session.wait_for(state))
        .await
        .expect("Unexpected timeout")
}

async fn next_event_within(listener: &mut EventListener, timeout: Duration) -> Option<Event> {
    tokio::time::timeout(timeout, listener.next_event()).await.ok().flatten()
}

async fn next_message(listener: &mut EventListener) -> EphemeralMessage {
    loop {
        match next_event_within(listener, SANITY_TIMEOUT).await {
            Some(Event::Message(message)) => return message,
            Some(_) => {}
            None => panic!("No message arrived"),
        }
    }
}

async fn assert_no_message(listener: &mut EventListener, timeout: Duration) {
    while let Some(event) = next_event_within(listener, timeout).await {
        if let Event::Message(message) = event {
            panic!("Unexpected message {:?}", message);
        }
    }
}

fn create_root_logger_for_stdout(node_name: String) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("Node" => node_name))
}
