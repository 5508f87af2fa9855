#![cfg(unix)]

use ricecoder_child_process::{
    spawn, ChildEvent, ChildEvents, ChildProcess, Message, ProcessError, SerializationMode,
    SpawnOptions, StdioSpec,
};
use ricecoder_ipc::{IpcError, KeepAlive};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio::time::timeout;

const ECHO: &str = env!("CARGO_BIN_EXE_ricecoder-ipc-echo");

fn echo_child(mode: SerializationMode, count: usize) -> ChildProcess {
    let options = SpawnOptions::new(ECHO)
        .arg(count.to_string())
        .stdio(StdioSpec::from_keywords(&["ignore", "ignore", "inherit", "ipc"]).unwrap())
        .serialization(mode)
        .keep_alive(KeepAlive::new());
    spawn(options).unwrap()
}

async fn collect(mut events: ChildEvents) -> Vec<ChildEvent> {
    timeout(Duration::from_secs(10), async move {
        let mut all = Vec::new();
        while let Some(event) = events.recv().await {
            all.push(event);
        }
        all
    })
    .await
    .expect("child did not close in time")
}

fn position(events: &[ChildEvent], wanted: fn(&ChildEvent) -> bool) -> usize {
    events
        .iter()
        .position(wanted)
        .unwrap_or_else(|| panic!("missing event in {:?}", events))
}

fn assert_channel_lifecycle(events: &[ChildEvent]) {
    assert!(matches!(events.first(), Some(ChildEvent::Spawn)));
    assert!(matches!(
        events.last(),
        Some(ChildEvent::Close {
            code: Some(0),
            signal: None
        })
    ));
    let disconnects = events
        .iter()
        .filter(|e| matches!(e, ChildEvent::Disconnect))
        .count();
    assert_eq!(disconnects, 1);
    assert!(
        position(events, |e| matches!(e, ChildEvent::Exit { .. }))
            < position(events, |e| matches!(e, ChildEvent::Close { .. }))
    );
}

fn echoed(message: Message) -> Message {
    let mut map = BTreeMap::new();
    map.insert("echo".to_string(), message);
    Message::Map(map)
}

#[tokio::test]
async fn test_json_echo_before_child_listens() {
    let child = echo_child(SerializationMode::Json, 1);
    let events = child.take_events().unwrap();

    assert!(child.connected());
    assert!(child.send(json!({"hello": "world"})));

    let mut messages = child.messages().unwrap();
    let reply = timeout(Duration::from_secs(10), messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, Message::from(json!({"echo": {"hello": "world"}})));

    let events = collect(events).await;
    assert_channel_lifecycle(&events);
    assert!(!events.iter().any(|e| matches!(e, ChildEvent::Error(_))));
    assert!(messages.recv().await.is_none());
    assert!(!child.connected());
}

#[tokio::test]
async fn test_advanced_mode_carries_binary() {
    let child = echo_child(SerializationMode::Advanced, 2);
    let events = child.take_events().unwrap();
    let mut messages = child.messages().unwrap();

    let first = Message::Bytes(vec![0, 1, 2, 255]);
    let mut second = BTreeMap::new();
    second.insert("ratio".to_string(), Message::Float(0.5));
    second.insert("raw".to_string(), Message::Bytes(b"abc".to_vec()));
    let second = Message::Map(second);

    assert!(child.send(first.clone()));
    assert!(child.send(second.clone()));

    for expected in [first, second] {
        let reply = timeout(Duration::from_secs(10), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, echoed(expected));
    }

    assert_channel_lifecycle(&collect(events).await);
}

#[tokio::test]
async fn test_send_callback_reports_delivery() {
    let child = echo_child(SerializationMode::Json, 1);
    let events = child.take_events().unwrap();
    let (tx, rx) = oneshot::channel();

    assert!(child.send_with("ping", move |outcome| {
        let _ = tx.send(outcome);
    }));

    let outcome = timeout(Duration::from_secs(10), rx).await.unwrap().unwrap();
    assert!(outcome.is_ok());

    let reply = child.messages().unwrap().recv().await.unwrap();
    assert_eq!(reply, echoed(Message::from("ping")));
    collect(events).await;
}

#[tokio::test]
async fn test_disconnect_twice_reports_not_connected() {
    let child = echo_child(SerializationMode::Json, 1);
    let events = child.take_events().unwrap();

    child.disconnect();
    assert!(!child.connected());
    child.disconnect();

    let events = collect(events).await;
    assert_channel_lifecycle(&events);
    assert!(events.iter().any(|e| matches!(
        e,
        ChildEvent::Error(ProcessError::Ipc(IpcError::NotConnected))
    )));
    assert!(
        position(&events, |e| matches!(e, ChildEvent::Disconnect))
            < position(&events, |e| matches!(e, ChildEvent::Close { .. }))
    );
}

#[tokio::test]
async fn test_send_after_disconnect_fails() {
    let child = echo_child(SerializationMode::Json, 1);
    let events = child.take_events().unwrap();
    child.disconnect();

    let (tx, rx) = oneshot::channel();
    assert!(!child.send_with("late", move |outcome| {
        let _ = tx.send(outcome);
    }));
    let outcome = timeout(Duration::from_secs(10), rx).await.unwrap().unwrap();
    assert!(matches!(
        outcome,
        Err(ProcessError::Ipc(IpcError::ChannelClosed))
    ));

    assert!(!child.send("later"));
    let events = collect(events).await;
    assert!(events.iter().any(|e| matches!(
        e,
        ChildEvent::Error(ProcessError::Ipc(IpcError::ChannelClosed))
    )));
}

#[tokio::test]
async fn test_kill_disconnects_channel() {
    let child = echo_child(SerializationMode::Json, 1);
    let events = child.take_events().unwrap();

    assert!(child.kill().unwrap());
    assert!(!child.connected());

    let events = collect(events).await;
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, ChildEvent::Disconnect))
            .count(),
        1
    );
    assert!(matches!(events.last(), Some(ChildEvent::Close { .. })));
}

#[tokio::test]
async fn test_child_sees_channel_environment() {
    let options = SpawnOptions::new("sh")
        .args([
            "-c",
            "echo $RICECODER_CHANNEL_FD $RICECODER_CHANNEL_SERIALIZATION_MODE",
        ])
        .stdio(StdioSpec::from_keywords(&["ignore", "pipe", "inherit", "ipc"]).unwrap())
        .serialization(SerializationMode::Advanced)
        .keep_alive(KeepAlive::new());
    let child = spawn(options).unwrap();
    let events = child.take_events().unwrap();

    let mut out = String::new();
    child
        .take_stdout()
        .unwrap()
        .read_to_string(&mut out)
        .await
        .unwrap();
    assert_eq!(out, "3 advanced\n");

    // The shell never speaks on the channel; its exit closes it
    assert_channel_lifecycle(&collect(events).await);
}

#[tokio::test]
async fn test_no_channel_without_ipc_slot() {
    let child = spawn(
        SpawnOptions::new("true")
            .stdio(StdioSpec::parse("ignore").unwrap())
            .keep_alive(KeepAlive::new()),
    )
    .unwrap();
    let events = child.take_events().unwrap();

    assert!(child.channel().is_none());
    assert!(child.messages().is_none());
    assert!(!child.send("nobody listening"));

    let events = collect(events).await;
    assert!(!events.iter().any(|e| matches!(e, ChildEvent::Disconnect)));
}
