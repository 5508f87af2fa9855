use ricecoder_ipc::{
    ChannelConfig, ChannelEvent, ChannelEvents, ControlChannel, DisconnectOrigin, IpcError,
    KeepAlive, Message, SerializationMode,
};
use serde_json::json;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;

fn isolated_config() -> ChannelConfig {
    ChannelConfig::default().keep_alive(KeepAlive::new())
}

type Endpoint = (ControlChannel, ChannelEvents);

fn pair(mode: SerializationMode) -> (Endpoint, Endpoint) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (
        ControlChannel::open(a, mode, isolated_config()),
        ControlChannel::open(b, mode, isolated_config()),
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_event(events: &mut ChannelEvents) -> ChannelEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for channel event")
        .expect("event stream ended")
}

#[tokio::test]
async fn test_messages_buffered_until_first_listener() {
    let ((parent, _pe), (child, _ce)) = pair(SerializationMode::Json);

    for i in 1..=3 {
        parent.send(json!({"seq": i})).unwrap().completed().await.unwrap();
    }
    wait_until(|| child.buffered() == 3).await;

    let mut messages = child.subscribe();
    assert_eq!(child.buffered(), 0);
    for i in 1..=3 {
        let message = messages.recv().await.unwrap();
        assert_eq!(message, Message::from(json!({"seq": i})));
    }
    assert!(messages.try_recv().is_none());
}

#[tokio::test]
async fn test_attached_listener_receives_directly() {
    let ((parent, _pe), (child, _ce)) = pair(SerializationMode::Json);
    let mut messages = child.subscribe();

    parent.send(json!({"hello": "world"})).unwrap();
    let received = timeout(Duration::from_secs(5), messages.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(received, Message::from(json!({"hello": "world"})));
    assert_eq!(child.buffered(), 0);
}

#[tokio::test]
async fn test_every_listener_gets_a_copy() {
    let ((parent, _pe), (child, _ce)) = pair(SerializationMode::Json);
    let mut first = child.subscribe();
    let mut second = child.subscribe();

    parent.send("ping").unwrap();

    assert_eq!(first.recv().await, Some(Message::from("ping")));
    assert_eq!(second.recv().await, Some(Message::from("ping")));
}

#[tokio::test]
async fn test_dropped_listener_resumes_buffering() {
    let ((parent, _pe), (child, _ce)) = pair(SerializationMode::Json);
    drop(child.subscribe());

    parent.send(1_i64).unwrap().completed().await.unwrap();
    wait_until(|| child.buffered() == 1).await;
}

#[tokio::test]
async fn test_send_after_disconnect_fails_before_writing() {
    let ((parent, _pe), _child) = pair(SerializationMode::Json);

    parent.disconnect().unwrap();
    assert!(!parent.is_connected());
    assert!(matches!(parent.send("late"), Err(IpcError::ChannelClosed)));
    assert_eq!(parent.queued_bytes(), 0);
    assert_eq!(parent.pending_sends(), 0);
}

#[tokio::test]
async fn test_second_disconnect_is_an_error() {
    let ((parent, _pe), _child) = pair(SerializationMode::Json);

    parent.disconnect().unwrap();
    assert!(matches!(parent.disconnect(), Err(IpcError::NotConnected)));
}

#[tokio::test]
async fn test_disconnect_notifies_both_ends() {
    let ((parent, mut parent_events), (child, mut child_events)) = pair(SerializationMode::Json);

    parent.disconnect().unwrap();

    assert!(matches!(
        next_event(&mut parent_events).await,
        ChannelEvent::Disconnected(DisconnectOrigin::Local)
    ));
    assert!(matches!(
        next_event(&mut child_events).await,
        ChannelEvent::Disconnected(DisconnectOrigin::Peer)
    ));
    assert!(!child.is_connected());
}

#[tokio::test]
async fn test_frames_queued_before_disconnect_still_arrive() {
    let ((parent, _pe), (child, mut child_events)) = pair(SerializationMode::Json);
    let mut messages = child.subscribe();

    let delivery = parent.send(json!({"last": true})).unwrap();
    parent.disconnect().unwrap();
    delivery.completed().await.unwrap();

    assert_eq!(messages.recv().await, Some(Message::from(json!({"last": true}))));
    assert!(matches!(
        next_event(&mut child_events).await,
        ChannelEvent::Disconnected(DisconnectOrigin::Peer)
    ));
    assert_eq!(messages.recv().await, None);
}

#[tokio::test]
async fn test_unknown_internal_commands_are_forwarded() {
    let ((parent, _pe), (child, _ce)) = pair(SerializationMode::Json);
    let mut messages = child.subscribe();

    parent.send(json!({"cmd": "RICECODER_PING"})).unwrap();

    let received = messages.recv().await.unwrap();
    assert_eq!(received.internal_command(), Some("RICECODER_PING"));
    assert!(child.is_connected());
}

#[tokio::test]
async fn test_end_of_stream_disconnects() {
    let (a, b) = tokio::io::duplex(1024);
    let (channel, mut events) = ControlChannel::open(a, SerializationMode::Json, isolated_config());

    drop(b);

    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::Disconnected(DisconnectOrigin::Peer)
    ));
    assert!(!channel.is_connected());
}

#[tokio::test]
async fn test_malformed_frame_reports_error() {
    use tokio::io::AsyncWriteExt;

    let (a, mut b) = tokio::io::duplex(1024);
    let (_channel, mut events) =
        ControlChannel::open(a, SerializationMode::Json, isolated_config());

    b.write_all(b"{not json}\n").await.unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::Error(IpcError::Json(_))
    ));
    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::Disconnected(DisconnectOrigin::Peer)
    ));
}

#[tokio::test]
async fn test_advanced_mode_carries_binary_buffers() {
    let ((parent, _pe), (child, _ce)) = pair(SerializationMode::Advanced);
    let mut messages = child.subscribe();

    let payload = Message::Array(vec![
        Message::Bytes(vec![0, 1, 2, 255]),
        Message::Float(f64::NAN),
    ]);
    parent.send(payload).unwrap();

    match messages.recv().await.unwrap() {
        Message::Array(items) => {
            assert_eq!(items[0], Message::Bytes(vec![0, 1, 2, 255]));
            assert!(matches!(items[1], Message::Float(f) if f.is_nan()));
        }
        other => panic!("unexpected message: {:?}", other),
    }
}

#[tokio::test]
async fn test_json_mode_rejects_bytes_synchronously() {
    let ((parent, _pe), _child) = pair(SerializationMode::Json);

    let result = parent.send(Message::Bytes(vec![1]));
    assert!(matches!(result, Err(IpcError::UnsupportedValue { .. })));
    assert_eq!(parent.pending_sends(), 0);
    assert!(parent.is_connected());
}

#[tokio::test]
async fn test_backpressure_flag_tracks_high_water_mark() {
    let (a, _b) = tokio::io::duplex(1024);
    let config = isolated_config().high_water_mark(16);
    let (channel, _events) = ControlChannel::open(a, SerializationMode::Json, config);

    let small = channel.send(1_i64).unwrap();
    assert!(small.within_limits());

    let large = channel.send("a string well past sixteen bytes").unwrap();
    assert!(!large.within_limits());
}

#[tokio::test]
async fn test_pending_send_keeps_handle_referenced() {
    let registry = KeepAlive::new();
    // Tiny pipe nobody reads: the write stalls until drained below
    let (a, mut raw) = tokio::io::duplex(8);
    let (channel, _events) = ControlChannel::open(
        a,
        SerializationMode::Json,
        ChannelConfig::default().keep_alive(registry.clone()),
    );

    assert_eq!(registry.active(), 0);
    let delivery = channel.send("this frame is longer than eight bytes").unwrap();
    assert_eq!(channel.pending_sends(), 1);
    assert!(channel.is_referenced());
    assert_eq!(registry.active(), 1);

    let drain = tokio::spawn(async move {
        let mut buf = vec![0u8; 128];
        let mut total = Vec::new();
        while !total.ends_with(b"\n") {
            let n = raw.read(&mut buf).await.unwrap();
            total.extend_from_slice(&buf[..n]);
        }
        (raw, total)
    });

    delivery.completed().await.unwrap();
    let (_raw, written) = drain.await.unwrap();
    assert_eq!(written, b"\"this frame is longer than eight bytes\"\n");

    wait_until(|| registry.active() == 0).await;
    assert_eq!(channel.pending_sends(), 0);
}

#[tokio::test]
async fn test_explicit_ref_pins_state() {
    let registry = KeepAlive::new();
    let (a, _b) = tokio::io::duplex(1024);
    let (channel, _events) = ControlChannel::open(
        a,
        SerializationMode::Json,
        ChannelConfig::default().keep_alive(registry.clone()),
    );

    channel.ref_handle();
    assert_eq!(registry.active(), 1);
    channel.send(1_i64).unwrap().completed().await.unwrap();
    assert_eq!(registry.active(), 1);

    channel.unref_handle();
    assert_eq!(registry.active(), 0);

    channel.ref_handle();
    channel.disconnect().unwrap();
    assert_eq!(registry.active(), 0);
}
