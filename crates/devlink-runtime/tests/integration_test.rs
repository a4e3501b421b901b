//! Integration tests for the devlink runtime.
//!
//! These tests run a mock device WebSocket endpoint and drive it through the
//! shell to verify end-to-end behavior.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use devlink_core::{ConfigStorage, MemoryConfigStorage};
use devlink_protocol::{
    decode_host_frame, encode_device_frame, DeviceFrame, DeviceHello, EventFrame, HostFrame,
    ReplyFrame,
};
use devlink_runtime::{
    AccessPoint, BusError, ChannelHandler, Command, CommandSchema, ConnectionState, DeviceId,
    DevlinkConfig, Endpoint, FaultReason, FieldKind, NetworkError, NetworkJoiner,
    ProvisioningState, Shell, ShellSeams, StaticDetector, TelemetryEvent, TransportError,
};

enum Control {
    Event { topic: String, seq: u64, payload: serde_json::Value },
    Drop,
}

/// A fake device: answers the handshake, replies to every request and sends
/// events on demand.
struct MockDevice {
    url: String,
    control: mpsc::UnboundedSender<Control>,
}

impl MockDevice {
    /// `associate_ip` makes the device report a successful association on
    /// `wifi/sta` after each `wifi/connect`.
    async fn spawn(device_id: &str, associate_ip: Option<&str>) -> Self {
        Self::spawn_with(device_id, associate_ip, vec![]).await
    }

    /// Like [`MockDevice::spawn`], sending `greeting` right after the hello.
    async fn spawn_with(
        device_id: &str,
        associate_ip: Option<&str>,
        greeting: Vec<EventFrame>,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let (control, mut control_rx) = mpsc::unbounded_channel();
        let device_id = device_id.to_string();
        let associate_ip = associate_ip.map(str::to_string);

        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => return,
                    },
                    control = control_rx.recv() => match control {
                        Some(Control::Drop) | None => return,
                        Some(Control::Event { .. }) => continue,
                    },
                };
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

                // Host speaks first.
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        assert!(matches!(decode_host_frame(&text), Ok(HostFrame::Hello(_))));
                    }
                    _ => continue,
                }
                let hello = DeviceFrame::Hello(DeviceHello {
                    device_id: DeviceId::new(&device_id),
                    name: None,
                    firmware: Some("1.4.2".to_string()),
                });
                send(&mut ws, &hello).await;
                for event in &greeting {
                    send(&mut ws, &DeviceFrame::Event(event.clone())).await;
                }

                let mut sta_seq = greeting.iter().filter(|e| e.topic == "wifi/sta").count() as u64;
                loop {
                    tokio::select! {
                        control = control_rx.recv() => match control {
                            Some(Control::Event { topic, seq, payload }) => {
                                send(&mut ws, &DeviceFrame::Event(EventFrame { topic, seq, payload })).await;
                            }
                            Some(Control::Drop) | None => {
                                let _ = ws.close(None).await;
                                return;
                            }
                        },
                        frame = ws.next() => {
                            let text = match frame {
                                Some(Ok(Message::Text(text))) => text,
                                Some(Ok(_)) => continue,
                                _ => break,
                            };
                            let Ok(HostFrame::Request(request)) = decode_host_frame(&text) else {
                                continue;
                            };
                            let reply = DeviceFrame::Reply(ReplyFrame {
                                id: request.id,
                                ok: request.topic != "system/reject",
                                payload: json!({ "topic": request.topic }),
                                error: None,
                            });
                            send(&mut ws, &reply).await;

                            if let ("wifi/connect", Some(ip)) = (request.topic.as_str(), &associate_ip) {
                                sta_seq += 1;
                                let event = DeviceFrame::Event(EventFrame {
                                    topic: "wifi/sta".to_string(),
                                    seq: sta_seq,
                                    payload: json!({
                                        "associated": true,
                                        "ssid": request.payload["ssid"],
                                        "ip": ip,
                                    }),
                                });
                                send(&mut ws, &event).await;
                            }
                        }
                    }
                }
            }
        });

        Self { url, control }
    }

    fn event(&self, topic: &str, seq: u64, payload: serde_json::Value) {
        let _ = self.control.send(Control::Event {
            topic: topic.to_string(),
            seq,
            payload,
        });
    }

    /// Close the channel and stop accepting connections.
    fn drop_link(&self) {
        let _ = self.control.send(Control::Drop);
    }
}

async fn send<S>(ws: &mut S, frame: &DeviceFrame)
where
    S: Sink<Message> + Unpin,
{
    let text = encode_device_frame(frame).unwrap();
    let _ = ws.send(Message::Text(text)).await;
}

/// Records joins and leaves; joins take `delay` to complete.
#[derive(Default)]
struct RecordingJoiner {
    delay: Duration,
    calls: Mutex<Vec<String>>,
}

impl RecordingJoiner {
    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkJoiner for RecordingJoiner {
    async fn join(&self, ssid: &str, _passphrase: Option<&str>) -> Result<(), NetworkError> {
        self.calls.lock().unwrap().push(format!("join {}", ssid));
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn leave(&self, ssid: &str) -> Result<(), NetworkError> {
        self.calls.lock().unwrap().push(format!("leave {}", ssid));
        Ok(())
    }
}

fn associated(ssid: &str) -> EventFrame {
    EventFrame {
        topic: "wifi/sta".to_string(),
        seq: 1,
        payload: json!({ "associated": true, "ssid": ssid }),
    }
}

fn start_shell(config: DevlinkConfig) -> Shell {
    Shell::start(
        config,
        ShellSeams::new(Arc::new(MemoryConfigStorage::new())),
        vec![],
    )
    .unwrap()
}

async fn recv_seqs(rx: &mut mpsc::Receiver<TelemetryEvent>, count: usize) -> Vec<u64> {
    let mut seqs = Vec::new();
    for _ in 0..count {
        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("Timeout waiting for event")
            .expect("Channel closed");
        seqs.push(event.seq);
    }
    seqs
}

#[tokio::test]
async fn test_send_without_connection_fails_fast() {
    let shell = start_shell(DevlinkConfig::default());
    shell.bus().register_schema("system/info", CommandSchema::empty());

    let err = shell
        .publish(Command::new("system/info", json!({})))
        .unwrap_err();
    assert!(matches!(err, BusError::Transport(TransportError::NotConnected)));

    shell.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_events_delivered_once() {
    let device = MockDevice::spawn("esp32m-1a2b", None).await;
    let shell = start_shell(DevlinkConfig::default());

    let (first, mut first_rx) = ChannelHandler::new(16);
    let (second, mut second_rx) = ChannelHandler::new(16);
    let _first = shell.subscribe("wifi/rssi", first).unwrap();
    let _second = shell.subscribe("wifi/*", second).unwrap();

    let id = shell.connect(Endpoint::direct(&device.url)).await.unwrap();
    assert_eq!(id, DeviceId::new("esp32m-1a2b"));
    assert_eq!(shell.link_state().borrow().clone(), ConnectionState::Connected);

    for seq in [1, 2, 2, 3] {
        device.event("wifi/rssi", seq, json!({ "rssi": -60 - seq as i64 }));
    }

    assert_eq!(recv_seqs(&mut first_rx, 3).await, vec![1, 2, 3]);
    assert_eq!(recv_seqs(&mut second_rx, 3).await, vec![1, 2, 3]);
    assert!(timeout(Duration::from_millis(100), first_rx.recv()).await.is_err());
    assert_eq!(shell.diagnostics().bus.duplicates, 1);

    shell.shutdown().await;
}

#[tokio::test]
async fn test_request_reply() {
    let device = MockDevice::spawn("esp32m-1a2b", None).await;
    let shell = start_shell(DevlinkConfig::default());
    shell.bus().register_schema("system/info", CommandSchema::empty());
    shell.bus().register_schema("system/reject", CommandSchema::empty());

    shell.connect(Endpoint::direct(&device.url)).await.unwrap();

    let reply = shell
        .request(Command::new("system/info", json!({})))
        .await
        .unwrap();
    assert!(reply.ok);
    assert_eq!(reply.payload["topic"], "system/info");
    assert_eq!(shell.diagnostics().pending_replies, 0);

    let err = shell
        .request(Command::new("system/reject", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Rejected { .. }));

    shell.shutdown().await;
}

#[tokio::test]
async fn test_schema_violation_not_sent() {
    let device = MockDevice::spawn("esp32m-1a2b", None).await;
    let shell = start_shell(DevlinkConfig::default());
    shell.bus().register_schema(
        "sntp/config",
        CommandSchema::empty().optional("host", FieldKind::String),
    );
    shell.connect(Endpoint::direct(&device.url)).await.unwrap();

    let err = shell
        .publish(Command::new("sntp/config", json!({ "host": 42 })))
        .unwrap_err();
    assert!(matches!(err, BusError::SchemaViolation(_)));
    assert_eq!(shell.diagnostics().pending_replies, 0);

    shell.shutdown().await;
}

#[tokio::test]
async fn test_session_switch_clears_cache() {
    let first = MockDevice::spawn("device-a", None).await;
    let second = MockDevice::spawn("device-b", None).await;
    let shell = start_shell(DevlinkConfig::default());

    let (handler, mut rx) = ChannelHandler::new(16);
    let _handle = shell.subscribe("wifi/rssi", handler).unwrap();

    shell.connect(Endpoint::direct(&first.url)).await.unwrap();
    first.event("wifi/rssi", 40, json!({ "rssi": -50 }));
    assert_eq!(recv_seqs(&mut rx, 1).await, vec![40]);
    assert_eq!(shell.cached("wifi/rssi").unwrap().len(), 1);

    shell.connect(Endpoint::direct(&second.url)).await.unwrap();
    assert!(shell.cached("wifi/rssi").unwrap().is_empty());
    assert_eq!(
        shell.active_session().map(|s| s.id),
        Some(DeviceId::new("device-b"))
    );

    // Sequence numbers restart with the new device.
    second.event("wifi/rssi", 1, json!({ "rssi": -70 }));
    assert_eq!(recv_seqs(&mut rx, 1).await, vec![1]);
    let cached = shell.cached("wifi/rssi").unwrap();
    assert_eq!(cached[0].event.payload["rssi"], -70);

    shell.shutdown().await;
}

#[tokio::test]
async fn test_captive_portal_provisioning() {
    let device = MockDevice::spawn("esp32m-1a2b", Some("127.0.0.1")).await;
    let mut config = DevlinkConfig::default();
    config.provisioning.portal_url = device.url.clone();

    let detector = StaticDetector::new(vec![
        AccessPoint {
            ssid: "esp32m-1a2b".to_string(),
            signal: Some(70),
            secured: false,
        },
        AccessPoint {
            ssid: "home-net".to_string(),
            signal: Some(90),
            secured: true,
        },
    ]);
    let seams = ShellSeams::new(Arc::new(MemoryConfigStorage::new()))
        .with_detector(Arc::new(detector));
    let shell = Shell::start(config, seams, vec![]).unwrap();
    let mut state = shell.active_state();

    let found = shell.probe_portal().await.unwrap();
    assert_eq!(found.len(), 1);
    assert!(found[0].via_portal);
    timeout(
        Duration::from_secs(2),
        state.wait_for(|s| matches!(s, ProvisioningState::ApMode { .. })),
    )
    .await
    .unwrap()
    .unwrap();

    shell.connect(found[0].endpoint.clone()).await.unwrap();
    assert!(matches!(
        shell.provisioning().state(),
        ProvisioningState::ApMode { .. }
    ));

    shell.provisioning().request_scan().await.unwrap();
    assert_eq!(shell.provisioning().state(), ProvisioningState::Scanning);

    let err = shell
        .provisioning()
        .submit_credentials("home-net", "short")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        devlink_runtime::ProvisioningError::InvalidCredentials(_)
    ));
    assert_eq!(shell.provisioning().state(), ProvisioningState::Scanning);

    shell
        .provisioning()
        .submit_credentials("home-net", "correct horse")
        .await
        .unwrap();
    timeout(
        Duration::from_secs(2),
        state.wait_for(|s| matches!(s, ProvisioningState::Joined { .. })),
    )
    .await
    .unwrap()
    .unwrap();

    // The device is now reached on its station address.
    let session = shell.active_session().unwrap();
    assert_eq!(session.endpoint, Endpoint::direct("ws://127.0.0.1/ws"));
    assert!(!session.via_portal);

    shell.shutdown().await;
}

#[tokio::test]
async fn test_join_timeout_faults() {
    let device = MockDevice::spawn("esp32m-1a2b", None).await;
    let mut config = DevlinkConfig::default();
    config.provisioning.join_timeout_ms = 100;
    let shell = start_shell(config);
    let mut state = shell.active_state();

    shell
        .connect(Endpoint::captive("esp32m-1a2b", &device.url))
        .await
        .unwrap();
    shell.provisioning().request_scan().await.unwrap();
    shell
        .provisioning()
        .submit_credentials("home-net", "correct horse")
        .await
        .unwrap();

    let faulted = timeout(
        Duration::from_secs(2),
        state.wait_for(|s| matches!(s, ProvisioningState::Faulted { .. })),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert_eq!(
        faulted,
        ProvisioningState::Faulted {
            reason: FaultReason::ProvisioningTimeout
        }
    );

    // Only an explicit retry leaves Faulted.
    shell.provisioning().retry().await.unwrap();
    assert_eq!(shell.provisioning().state(), ProvisioningState::Scanning);

    shell.shutdown().await;
}

#[tokio::test]
async fn test_link_loss_ends_unreachable() {
    let device = MockDevice::spawn("esp32m-1a2b", None).await;
    let mut config = DevlinkConfig::default();
    config.transport.backoff.initial_delay_ms = 20;
    config.transport.backoff.max_delay_ms = 40;
    config.transport.backoff.jitter = 0.0;
    config.transport.backoff.max_attempts = 2;
    let shell = start_shell(config);
    shell.bus().register_schema("system/info", CommandSchema::empty());
    let mut link = shell.link_state();

    shell.connect(Endpoint::direct(&device.url)).await.unwrap();
    device.drop_link();

    timeout(
        Duration::from_secs(5),
        link.wait_for(|s| *s == ConnectionState::Unreachable),
    )
    .await
    .unwrap()
    .unwrap();

    let err = shell
        .publish(Command::new("system/info", json!({})))
        .unwrap_err();
    assert!(matches!(err, BusError::Transport(TransportError::NotConnected)));

    shell.shutdown().await;
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    drop(listener);

    let shell = start_shell(DevlinkConfig::default());
    let err = shell.connect(Endpoint::direct(&url)).await.unwrap_err();
    assert!(matches!(err, TransportError::ConnectRefused { .. }));
    assert_eq!(shell.link_state().borrow().clone(), ConnectionState::Disconnected);
    assert!(shell.active_session().is_none());

    shell.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_keeps_last_selection() {
    let device = MockDevice::spawn("esp32m-1a2b", None).await;
    let shell = start_shell(DevlinkConfig::default());

    shell.connect(Endpoint::direct(&device.url)).await.unwrap();
    shell.disconnect().await;
    // Idempotent.
    shell.disconnect().await;

    assert!(shell.active_session().is_none());
    assert!(shell.sessions().is_empty());
    assert_eq!(shell.link_state().borrow().clone(), ConnectionState::Disconnected);

    let id = shell.reconnect_last().await.unwrap();
    assert_eq!(id, Some(DeviceId::new("esp32m-1a2b")));

    shell.forget_device().await;
    assert_eq!(shell.reconnect_last().await.unwrap(), None);

    shell.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_session_expires() {
    let device = MockDevice::spawn("esp32m-1a2b", None).await;
    let mut config = DevlinkConfig::default();
    config.transport.backoff.initial_delay_ms = 20;
    config.transport.backoff.max_delay_ms = 40;
    config.transport.backoff.jitter = 0.0;
    config.transport.backoff.max_attempts = 2;
    config.session.expiry_ms = 50;
    config.session.housekeeping_interval_ms = 20;
    let storage = Arc::new(MemoryConfigStorage::new());
    let shell = Shell::start(config, ShellSeams::new(storage.clone()), vec![]).unwrap();
    let mut link = shell.link_state();

    shell.connect(Endpoint::direct(&device.url)).await.unwrap();
    let epoch = shell.diagnostics().bus.epoch;
    device.drop_link();

    // Reconnecting, then Unreachable, then expired by housekeeping.
    timeout(
        Duration::from_secs(5),
        link.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(shell.active_session().is_none());
    assert!(shell.sessions().is_empty());
    assert!(shell.diagnostics().bus.epoch > epoch);
    assert_eq!(shell.provisioning().state(), ProvisioningState::Unconfigured);
    let last = storage.load_last_session().unwrap().unwrap();
    assert_eq!(last.device_id, DeviceId::new("esp32m-1a2b"));

    shell.shutdown().await;
}

#[tokio::test]
async fn test_report_right_after_hello_applies_to_new_session() {
    let device = MockDevice::spawn_with("esp32m-1a2b", None, vec![associated("home-net")]).await;
    let shell = start_shell(DevlinkConfig::default());
    let mut state = shell.active_state();

    shell.connect(Endpoint::direct(&device.url)).await.unwrap();

    timeout(
        Duration::from_secs(2),
        state.wait_for(|s| matches!(s, ProvisioningState::Joined { .. })),
    )
    .await
    .unwrap()
    .unwrap();
    // Nothing later puts the machine back to Unconfigured.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        shell.provisioning().state(),
        ProvisioningState::Joined {
            ssid: "home-net".to_string()
        }
    );

    shell.shutdown().await;
}

#[tokio::test]
async fn test_wifi_commands_only_through_provisioning() {
    let device = MockDevice::spawn_with("esp32m-1a2b", None, vec![associated("home-net")]).await;
    let shell = start_shell(DevlinkConfig::default());
    let mut state = shell.active_state();

    shell.connect(Endpoint::direct(&device.url)).await.unwrap();
    timeout(
        Duration::from_secs(2),
        state.wait_for(|s| matches!(s, ProvisioningState::Joined { .. })),
    )
    .await
    .unwrap()
    .unwrap();

    for topic in ["wifi/forget", "wifi/scan", "wifi/connect"] {
        let err = shell
            .publish(Command::new(topic, json!({})))
            .unwrap_err();
        assert!(matches!(err, BusError::Reserved { .. }), "{} was sent", topic);
    }
    let err = shell
        .request(Command::new("wifi/forget", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Reserved { .. }));
    assert!(matches!(
        shell.provisioning().state(),
        ProvisioningState::Joined { .. }
    ));
    assert_eq!(shell.diagnostics().pending_replies, 0);

    // Forgetting the network goes through the state machine.
    shell.provisioning().factory_reset().await.unwrap();
    assert_eq!(shell.provisioning().state(), ProvisioningState::Unconfigured);

    shell.shutdown().await;
}

#[tokio::test]
async fn test_failed_captive_connect_leaves_portal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    drop(listener);

    let joiner = Arc::new(RecordingJoiner::default());
    let seams = ShellSeams::new(Arc::new(MemoryConfigStorage::new())).with_joiner(joiner.clone());
    let shell = Shell::start(DevlinkConfig::default(), seams, vec![]).unwrap();

    let err = shell
        .connect(Endpoint::captive("esp32m-1a2b", &url))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ConnectRefused { .. }));
    assert_eq!(joiner.calls(), vec!["join esp32m-1a2b", "leave esp32m-1a2b"]);
    assert_eq!(shell.link_state().borrow().clone(), ConnectionState::Disconnected);
    assert!(shell.active_session().is_none());

    shell.shutdown().await;
}

#[tokio::test]
async fn test_session_switch_cancels_connect_in_flight() {
    let device = MockDevice::spawn("device-b", None).await;
    let joiner = Arc::new(RecordingJoiner::slow(Duration::from_secs(30)));
    let seams = ShellSeams::new(Arc::new(MemoryConfigStorage::new())).with_joiner(joiner.clone());
    let shell = Arc::new(Shell::start(DevlinkConfig::default(), seams, vec![]).unwrap());
    let mut link = shell.link_state();

    let first = tokio::spawn({
        let shell = shell.clone();
        async move {
            shell
                .connect(Endpoint::captive("esp32m-slow", "ws://192.168.4.1/ws"))
                .await
        }
    });
    timeout(
        Duration::from_secs(2),
        link.wait_for(|s| *s == ConnectionState::JoiningPortal),
    )
    .await
    .unwrap()
    .unwrap();

    let id = timeout(
        Duration::from_secs(5),
        shell.connect(Endpoint::direct(&device.url)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(id, DeviceId::new("device-b"));

    let superseded = timeout(Duration::from_secs(2), first).await.unwrap().unwrap();
    assert!(matches!(superseded, Err(TransportError::Cancelled)));
    // The half-joined portal network was released.
    assert_eq!(joiner.calls(), vec!["join esp32m-slow", "leave esp32m-slow"]);

    assert_eq!(shell.link_state().borrow().clone(), ConnectionState::Connected);
    assert_eq!(
        shell.active_session().map(|s| s.id),
        Some(DeviceId::new("device-b"))
    );
    assert_eq!(shell.provisioning().state(), ProvisioningState::Unconfigured);

    shell.shutdown().await;
}
