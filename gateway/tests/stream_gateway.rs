//! Streaming gateway integration tests: registration flow, SSRC binding,
//! admission control, transcript fan-out, and the widget socket.

use std::time::Duration;

use futures::StreamExt;

use tapgate::config::{RoleMode, SpeechConfig, StreamConfig};
use tapgate::stream::{CallContext, Direction, StreamGateway, UNKNOWN_CALL, UNKNOWN_ROOM};

fn test_config() -> StreamConfig {
    StreamConfig {
        http_port: 0,
        rtp_in: "127.0.0.1:0".parse().unwrap(),
        rtp_out: "127.0.0.1:0".parse().unwrap(),
        speech: SpeechConfig {
            // Nothing listens here; upstream connects fail fast and retry
            // with backoff, which the tests below do not depend on.
            url: "ws://127.0.0.1:9/listen".to_string(),
            api_key: "test-key".to_string(),
            language: "en".to_string(),
            interim_results: true,
            punctuate: true,
            smart_format: false,
            diarize: false,
        },
        byte_swap: false,
        max_sessions: 64,
        inactivity: Duration::from_secs(8),
        pending_ttl: Duration::from_secs(4),
        boot_frames: 50,
        role_mode: RoleMode::CallerIn,
        dump_enabled: false,
        dump_dir: std::env::temp_dir(),
        assist: None,
    }
}

fn context(uuid: &str, exten: &str, caller: &str, caller_name: &str) -> CallContext {
    CallContext {
        uuid: uuid.to_string(),
        extension: exten.to_string(),
        caller: caller.to_string(),
        caller_name: caller_name.to_string(),
    }
}

/// RTP datagram with an explicit SSRC.
fn rtp_packet(ssrc: u32, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0x80, 0x00, 0, 1, 0, 0, 0, 0];
    packet.extend_from_slice(&ssrc.to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

#[tokio::test]
async fn register_emits_call_start_once_unless_forced() {
    let gateway = StreamGateway::new(test_config());
    let mut room = gateway.rooms().subscribe("200");

    gateway.register_call(
        context("A1", "200", "+34600000000", "Ana"),
        Direction::In,
        false,
    );
    let event: serde_json::Value =
        serde_json::from_str(&room.recv().await.unwrap()).unwrap();
    assert_eq!(event["event"], "call-start");
    assert_eq!(event["data"]["uuid"], "A1");
    assert_eq!(event["data"]["from"], "Ana");
    assert_eq!(event["data"]["to"], "200");

    // Second direction of the same call: no new call-start.
    gateway.register_call(
        context("A1", "200", "+34600000000", "Ana"),
        Direction::Out,
        false,
    );
    assert!(room.try_recv().is_err());

    // force_start re-emits for a known call.
    gateway.register_call(
        context("A1", "200", "+34600000000", "Ana"),
        Direction::In,
        true,
    );
    let event: serde_json::Value =
        serde_json::from_str(&room.recv().await.unwrap()).unwrap();
    assert_eq!(event["event"], "call-start");
}

#[tokio::test]
async fn unregister_drops_context_and_announces_end() {
    let gateway = StreamGateway::new(test_config());
    let mut room = gateway.rooms().subscribe("200");

    gateway.register_call(context("A1", "200", "", ""), Direction::In, false);
    let _call_start = room.recv().await.unwrap();
    assert_eq!(gateway.room_for_call("A1").as_deref(), Some("200"));

    gateway.unregister_call("A1");
    let event: serde_json::Value =
        serde_json::from_str(&room.recv().await.unwrap()).unwrap();
    assert_eq!(event["event"], "stt-end");
    assert_eq!(event["data"]["uuid"], "A1");
    assert!(gateway.room_for_call("A1").is_none());
}

#[tokio::test]
async fn first_packet_adopts_pending_binding_permanently() {
    let gateway = StreamGateway::new(test_config());
    gateway.register_call(context("A1", "200", "+34600000000", "Ana"), Direction::In, false);

    gateway.intake(Direction::In, &rtp_packet(0xAAAA_1111, &[0u8; 320]));
    let session = gateway.session(Direction::In, 0xAAAA_1111).unwrap();
    assert_eq!(session.context.uuid, "A1");
    assert_eq!(session.room, "200");
    assert_eq!(session.speaker, "Ana");

    // A later register cannot rebind the SSRC.
    gateway.register_call(context("B2", "300", "", ""), Direction::In, false);
    gateway.intake(Direction::In, &rtp_packet(0xAAAA_1111, &[0u8; 320]));
    let session = gateway.session(Direction::In, 0xAAAA_1111).unwrap();
    assert_eq!(session.context.uuid, "A1");
    assert_eq!(gateway.session_count(), 1);
}

#[tokio::test]
async fn unannounced_ssrc_binds_to_unknown_and_mix() {
    let gateway = StreamGateway::new(test_config());

    gateway.intake(Direction::In, &rtp_packet(0xCCCC_0000, &[0u8; 320]));
    let session = gateway.session(Direction::In, 0xCCCC_0000).unwrap();
    assert_eq!(session.context.uuid, UNKNOWN_CALL);
    assert_eq!(session.room, UNKNOWN_ROOM);
    assert_eq!(gateway.metrics().unknown_bindings.get(), 1);

    // A register arriving after the fact changes nothing for this SSRC.
    gateway.register_call(context("X9", "400", "", ""), Direction::In, false);
    gateway.intake(Direction::In, &rtp_packet(0xCCCC_0000, &[0u8; 320]));
    assert_eq!(
        gateway.session(Direction::In, 0xCCCC_0000).unwrap().context.uuid,
        UNKNOWN_CALL
    );
}

#[tokio::test]
async fn expired_pending_bindings_are_invisible() {
    let mut config = test_config();
    config.pending_ttl = Duration::from_millis(0);
    let gateway = StreamGateway::new(config);

    gateway.register_call(context("A1", "200", "", ""), Direction::In, false);
    tokio::time::sleep(Duration::from_millis(10)).await;

    gateway.intake(Direction::In, &rtp_packet(0xDDDD_0000, &[0u8; 320]));
    let session = gateway.session(Direction::In, 0xDDDD_0000).unwrap();
    assert_eq!(session.context.uuid, UNKNOWN_CALL);
}

#[tokio::test]
async fn directions_key_sessions_independently() {
    let gateway = StreamGateway::new(test_config());
    gateway.register_call(context("A1", "200", "", "Ana"), Direction::In, false);
    gateway.register_call(context("A1", "200", "", "Ana"), Direction::Out, false);

    gateway.intake(Direction::In, &rtp_packet(0xAAAA_1111, &[0u8; 320]));
    gateway.intake(Direction::Out, &rtp_packet(0xBBBB_2222, &[0u8; 320]));

    assert_eq!(gateway.session_count(), 2);
    let inbound = gateway.session(Direction::In, 0xAAAA_1111).unwrap();
    let outbound = gateway.session(Direction::Out, 0xBBBB_2222).unwrap();
    assert_eq!(inbound.speaker, "Ana");
    assert_eq!(outbound.speaker, "200");
}

#[tokio::test]
async fn session_cap_drops_new_ssrcs() {
    let mut config = test_config();
    config.max_sessions = 1;
    let gateway = StreamGateway::new(config);

    gateway.intake(Direction::In, &rtp_packet(0x0000_0001, &[0u8; 320]));
    assert_eq!(gateway.session_count(), 1);

    gateway.intake(Direction::In, &rtp_packet(0x0000_0002, &[0u8; 320]));
    assert_eq!(gateway.session_count(), 1);
    assert_eq!(gateway.metrics().dropped_over_capacity.get(), 1);

    // Existing sessions keep flowing.
    gateway.intake(Direction::In, &rtp_packet(0x0000_0001, &[0u8; 320]));
    assert_eq!(gateway.metrics().dropped_over_capacity.get(), 1);
}

#[tokio::test]
async fn transcripts_fan_out_to_the_session_room() {
    let gateway = StreamGateway::new(test_config());
    gateway.register_call(context("A1", "200", "+34600000000", "Ana"), Direction::In, false);
    gateway.intake(Direction::In, &rtp_packet(0xAAAA_1111, &[0u8; 320]));
    let session = gateway.session(Direction::In, 0xAAAA_1111).unwrap();

    let mut room = gateway.rooms().subscribe("200");
    let body = r#"{
        "type": "Results",
        "is_final": true,
        "channel": {"alternatives": [{"transcript": "buenas tardes", "words": []}]}
    }"#;
    gateway.handle_transcript(&session, body);

    let event: serde_json::Value =
        serde_json::from_str(&room.recv().await.unwrap()).unwrap();
    assert_eq!(event["event"], "stt");
    assert_eq!(event["data"]["text"], "buenas tardes");
    assert_eq!(event["data"]["isFinal"], true);
    assert_eq!(event["data"]["speaker"], "Ana");
    assert_eq!(event["data"]["dir"], "in");
    assert_eq!(event["data"]["uuid"], "A1");
    assert_eq!(gateway.metrics().transcripts.get(), 1);

    // Non-Results noise is not forwarded.
    gateway.handle_transcript(&session, r#"{"type":"Metadata"}"#);
    assert!(room.try_recv().is_err());
}

#[tokio::test]
async fn inactive_sessions_are_swept() {
    let mut config = test_config();
    config.inactivity = Duration::from_millis(50);
    let gateway = StreamGateway::new(config);

    gateway.intake(Direction::In, &rtp_packet(0x5555_0000, &[0u8; 320]));
    assert!(gateway.has_session(Direction::In, 0x5555_0000));

    tokio::time::sleep(Duration::from_millis(100)).await;
    // Driven manually here; in production a 2 s sweeper task does this.
    gateway.remove_session(Direction::In, 0x5555_0000, "inactivity");
    assert!(!gateway.has_session(Direction::In, 0x5555_0000));

    // A second removal is a no-op.
    gateway.remove_session(Direction::In, 0x5555_0000, "inactivity");
    assert_eq!(gateway.metrics().sessions_active.get(), 0);
}

#[tokio::test]
async fn widget_socket_receives_room_events() {
    let gateway = StreamGateway::new(test_config());
    let app = tapgate::stream::routes::router(gateway.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (socket, _response) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws?room=200"))
            .await
            .unwrap();
    let (_sink, mut stream) = socket.split();

    // Wait for the subscription to land before publishing.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while gateway.rooms().subscriber_count() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "subscriber never attached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    gateway.register_call(context("A1", "200", "", "Ana"), Direction::In, false);

    let message = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("no widget event")
        .unwrap()
        .unwrap();
    let event: serde_json::Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
    assert_eq!(event["event"], "call-start");
    assert_eq!(event["data"]["exten"], "200");
}
