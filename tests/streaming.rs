use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use meeting_audio_hub::{
    audio::{AudioBus, AudioFrame, AudioType},
    config::{Config, ManagerMode},
    sdk::SimulatedCapability,
    server::build_router,
    services::{LocalMeetingManager, MeetingManager},
};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(flush_interval_ms: u64) -> (String, Arc<AudioBus>) {
    start_server_with(|config| config.websocket.flush_interval_ms = flush_interval_ms).await
}

async fn start_server_with(configure: impl FnOnce(&mut Config)) -> (String, Arc<AudioBus>) {
    let mut config = Config::default();
    config.workers.mode = ManagerMode::InProcess;
    configure(&mut config);

    let bus = Arc::new(AudioBus::new());
    let capability = Arc::new(SimulatedCapability::from_config(&config));
    let manager: Arc<dyn MeetingManager> =
        Arc::new(LocalMeetingManager::new(config.clone(), capability, bus.clone()));
    let app = build_router(manager, bus.clone(), &config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    (format!("ws://{}", addr), bus)
}

async fn connect(base: &str, path_and_query: &str) -> Client {
    let (mut client, _) = connect_async(format!("{}{}", base, path_and_query)).await.unwrap();
    let first = next_message(&mut client).await.expect("audio_format message");
    let format: serde_json::Value = match first {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected audio_format text, got {:?}", other),
    };
    assert_eq!(format["type"], "audio_format");
    assert_eq!(format["sample_rate"], 32000);
    assert_eq!(format["channels"], 1);
    assert_eq!(format["sample_format"], "s16le");
    client
}

async fn next_message(client: &mut Client) -> Option<Message> {
    tokio::time::timeout(Duration::from_secs(2), client.next())
        .await
        .ok()
        .flatten()
        .map(|message| message.unwrap())
}

/// Next binary frame within `wait`, skipping control traffic
async fn next_frame(client: &mut Client, wait: Duration) -> Option<AudioFrame> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let message = tokio::time::timeout_at(deadline, client.next()).await.ok()??;
        if let Message::Binary(data) = message.unwrap() {
            return Some(AudioFrame::decode(&data).unwrap());
        }
    }
}

#[tokio::test]
async fn test_filtered_subscribers_receive_matching_frames_only() {
    let (base, bus) = start_server(20).await;
    let mut mixed_only = connect(&base, "/ws/audio/m1?type=mixed").await;
    let mut everything = connect(&base, "/ws/audio/m1").await;

    bus.publish("m1", &AudioFrame::new(AudioType::OneWay, 7, vec![1u8, 2, 3, 4]));

    let frame = next_frame(&mut everything, Duration::from_secs(2)).await.unwrap();
    assert_eq!(frame.audio_type, AudioType::OneWay);
    assert_eq!(frame.speaker_id, 7);
    assert_eq!(&frame.payload[..], &[1, 2, 3, 4]);

    assert!(next_frame(&mut mixed_only, Duration::from_millis(300)).await.is_none());

    bus.publish("m1", &AudioFrame::new(AudioType::Mixed, 0, vec![9u8, 9]));
    let frame = next_frame(&mut mixed_only, Duration::from_secs(2)).await.unwrap();
    assert_eq!(frame.audio_type, AudioType::Mixed);

    // Autre meeting: jamais livré
    bus.publish("m2", &AudioFrame::new(AudioType::Mixed, 0, vec![5u8, 5]));
    assert!(next_frame(&mut mixed_only, Duration::from_millis(300)).await.is_none());

    mixed_only.close(None).await.unwrap();
    everything.close(None).await.unwrap();
}

#[tokio::test]
async fn test_frames_aggregated_per_flush_interval() {
    let (base, bus) = start_server(500).await;
    let mut client = connect(&base, "/ws/audio/m1?user_id=42").await;

    for chunk in [[1u8, 1], [2, 2], [3, 3]] {
        bus.publish("m1", &AudioFrame::new(AudioType::OneWay, 42, chunk.to_vec()));
    }
    bus.publish("m1", &AudioFrame::new(AudioType::OneWay, 43, vec![0u8; 2]));

    let frame = next_frame(&mut client, Duration::from_secs(2)).await.unwrap();
    assert_eq!(frame.speaker_id, 42);
    assert_eq!(&frame.payload[..], &[1, 1, 2, 2, 3, 3]);

    assert!(next_frame(&mut client, Duration::from_millis(700)).await.is_none());
}

#[tokio::test]
async fn test_invalid_query_is_rejected_with_error_message() {
    let (base, bus) = start_server(20).await;
    let (mut client, _) = connect_async(format!("{}/ws/audio/m1?type=bogus", base))
        .await
        .unwrap();

    let error: serde_json::Value = match next_message(&mut client).await {
        Some(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected error message, got {:?}", other),
    };
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], 400);

    assert!(matches!(next_message(&mut client).await, Some(Message::Close(_)) | None));
    assert_eq!(bus.subscriber_count(), 0);
}

#[tokio::test]
async fn test_disconnect_unsubscribes() {
    let (base, bus) = start_server(20).await;
    let client = connect(&base, "/ws/audio/m1").await;
    assert_eq!(bus.subscriber_count(), 1);

    drop(client);
    let mut remaining = 1;
    for _ in 0..50 {
        remaining = bus.subscriber_count();
        if remaining == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(remaining, 0);
}

async fn wait_for_no_subscribers(bus: &AudioBus, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if bus.subscriber_count() == 0 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    bus.subscriber_count() == 0
}

/// Collects every message received during `window`
async fn collect_for(client: &mut Client, window: Duration) -> Vec<Message> {
    let deadline = Instant::now() + window;
    let mut messages = Vec::new();
    while let Ok(Some(Ok(message))) = tokio::time::timeout_at(deadline, client.next()).await {
        messages.push(message);
    }
    messages
}

fn heartbeats(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .filter_map(|message| match message {
            Message::Text(text) => serde_json::from_str::<serde_json::Value>(text).ok(),
            _ => None,
        })
        .filter(|value| value["type"] == "heartbeat")
        .collect()
}

#[tokio::test]
async fn test_silent_client_hits_read_deadline() {
    let (base, bus) = start_server_with(|config| config.websocket.read_timeout_secs = 1).await;
    let mut client = connect(&base, "/ws/audio/m1").await;
    assert_eq!(bus.subscriber_count(), 1);

    // Le client ne dit rien : le serveur ferme après l'échéance de lecture
    let messages = collect_for(&mut client, Duration::from_secs(3)).await;
    assert!(messages.iter().any(|m| matches!(m, Message::Close(_))));
    assert!(wait_for_no_subscribers(&bus, Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_heartbeat_sent_unless_disabled() {
    let (base, _bus) =
        start_server_with(|config| config.websocket.heartbeat_interval_secs = 1).await;

    let mut with_heartbeat = connect(&base, "/ws/audio/m1").await;
    let mut without_heartbeat = connect(&base, "/ws/audio/m1?heartbeat=false").await;

    let (enabled, disabled) = tokio::join!(
        collect_for(&mut with_heartbeat, Duration::from_millis(2500)),
        collect_for(&mut without_heartbeat, Duration::from_millis(2500)),
    );

    let received = heartbeats(&enabled);
    assert!(!received.is_empty());
    assert!(received[0]["timestamp"].as_u64().unwrap() > 0);
    assert!(heartbeats(&disabled).is_empty());
}

#[tokio::test]
async fn test_ping_keepalive_sent() {
    let (base, _bus) = start_server_with(|config| config.websocket.ping_interval_secs = 1).await;
    let mut client = connect(&base, "/ws/audio/m1").await;

    let messages = collect_for(&mut client, Duration::from_millis(2500)).await;
    assert!(messages.iter().any(|m| matches!(m, Message::Ping(_))));
}

#[tokio::test]
async fn test_full_session_queue_drops_without_closing() {
    let (base, bus) = start_server_with(|config| config.websocket.flush_interval_ms = 200).await;
    let mut client = connect(&base, "/ws/audio/m1?queue_size=2").await;

    // Rafale synchrone : la session n'a pas la main avant la fin de la boucle
    for _ in 0..50 {
        bus.publish("m1", &AudioFrame::new(AudioType::OneWay, 7, vec![1u8, 1]));
    }
    assert_eq!(bus.stats().total_dropped, 48);

    let frame = next_frame(&mut client, Duration::from_secs(2)).await.unwrap();
    assert_eq!(frame.payload.len(), 4);

    // La session reste ouverte et continue de livrer
    assert_eq!(bus.subscriber_count(), 1);
    bus.publish("m1", &AudioFrame::new(AudioType::OneWay, 7, vec![2u8, 2]));
    let frame = next_frame(&mut client, Duration::from_secs(2)).await.unwrap();
    assert_eq!(&frame.payload[..], &[2, 2]);
}

#[tokio::test]
async fn test_stalled_writer_ends_session() {
    let (base, bus) = start_server_with(|config| {
        config.websocket.write_timeout_secs = 1;
        config.websocket.flush_interval_ms = 20;
    })
    .await;
    let client = connect(&base, "/ws/audio/m1").await;

    // Le client ne lit plus : les tampons TCP se remplissent et l'écriture expire
    for speaker in 0..16u64 {
        bus.publish("m1", &AudioFrame::new(AudioType::OneWay, speaker, vec![0u8; 4 << 20]));
    }

    assert!(wait_for_no_subscribers(&bus, Duration::from_secs(10)).await);
    drop(client);
}
