use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    response::Response,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    audio::{AudioBus, AudioFrame, FrameAggregator, Subscriber, SubscriptionGuard},
    config::{AudioConfig, WebSocketConfig},
    models::ControlMessage,
    networking::ConnectionConfig,
    Error, Result,
};

/// Serves `/ws/audio/:meeting_id`: one bus subscriber per client, audio aggregated
/// per speaker and flushed as binary frames at a fixed interval.
pub struct StreamingHandler {
    bus: Arc<AudioBus>,
    audio: AudioConfig,
    websocket: WebSocketConfig,
}

impl StreamingHandler {
    pub fn new(bus: Arc<AudioBus>, audio: AudioConfig, websocket: WebSocketConfig) -> Self {
        Self {
            bus,
            audio,
            websocket,
        }
    }

    pub async fn handle_upgrade(
        State(handler): State<Arc<Self>>,
        Path(meeting_id): Path<String>,
        Query(params): Query<Vec<(String, String)>>,
        ws: WebSocketUpgrade,
    ) -> Response {
        let connection = ConnectionConfig::from_params(&meeting_id, &params, &handler.websocket);
        ws.on_upgrade(move |socket| handler.handle_socket(socket, connection))
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, connection: Result<ConnectionConfig>) {
        let session_id = format!("ws-{}", Uuid::new_v4());
        let (mut sender, receiver) = socket.split();
        let write_timeout = self.websocket.write_timeout();

        let connection = match connection {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(session = %session_id, "Rejecting streaming session: {}", e);
                if let Ok(text) = ControlMessage::error(e.to_string(), 400).to_json() {
                    let _ = send_with_timeout(&mut sender, Message::Text(text), write_timeout).await;
                }
                let _ = send_with_timeout(&mut sender, Message::Close(None), write_timeout).await;
                return;
            }
        };

        let (subscriber, frames) = self.bus.subscribe_with(
            session_id.clone(),
            connection.filter(),
            connection.queue_size,
        );
        let _guard = SubscriptionGuard::new(self.bus.clone(), session_id.clone());

        tracing::info!(
            session = %session_id,
            meeting_id = %connection.meeting_id,
            audio_types = ?connection.audio_types,
            user_ids = ?connection.user_ids,
            "WebSocket client connected"
        );

        let cancel = CancellationToken::new();
        let reader = tokio::spawn(read_loop(
            receiver,
            subscriber,
            self.websocket.read_timeout(),
            cancel.clone(),
            session_id.clone(),
        ));

        let result = self.write_loop(sender, frames, &connection, cancel.clone()).await;
        cancel.cancel();
        let _ = reader.await;

        match result {
            Ok(()) => tracing::info!(session = %session_id, "WebSocket client disconnected"),
            Err(e) => tracing::warn!(session = %session_id, "WebSocket session ended: {}", e),
        }
    }

    async fn write_loop(
        &self,
        mut sender: SplitSink<WebSocket, Message>,
        mut frames: mpsc::Receiver<AudioFrame>,
        connection: &ConnectionConfig,
        cancel: CancellationToken,
    ) -> Result<()> {
        let write_timeout = self.websocket.write_timeout();

        // Le format est toujours le premier message
        let format = ControlMessage::audio_format(self.audio.sample_rate, self.audio.channels);
        send_with_timeout(&mut sender, Message::Text(format.to_json()?), write_timeout).await?;

        let mut aggregator = FrameAggregator::new();
        let mut flush = ticker(self.websocket.flush_interval().max(Duration::from_millis(1)));
        let mut ping = ticker(self.websocket.ping_interval().max(Duration::from_secs(1)));
        let mut heartbeat = ticker(connection.heartbeat_interval.max(Duration::from_secs(1)));

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                frame = frames.recv() => match frame {
                    Some(frame) => aggregator.push(&frame),
                    None => {
                        tracing::debug!("Subscription closed by the bus");
                        break Ok(());
                    }
                },
                _ = flush.tick() => {
                    if let Err(e) = flush_frames(&mut sender, &mut aggregator, write_timeout).await {
                        break Err(e);
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = send_with_timeout(&mut sender, Message::Ping(Vec::new()), write_timeout).await {
                        break Err(e);
                    }
                }
                _ = heartbeat.tick(), if connection.heartbeat_enabled => {
                    let sent = match ControlMessage::heartbeat().to_json() {
                        Ok(text) => send_with_timeout(&mut sender, Message::Text(text), write_timeout).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        break Err(e);
                    }
                }
            }
        };

        if outcome.is_ok() {
            flush_frames(&mut sender, &mut aggregator, write_timeout).await?;
            let _ = send_with_timeout(&mut sender, Message::Close(None), write_timeout).await;
        }
        outcome
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn flush_frames(
    sender: &mut SplitSink<WebSocket, Message>,
    aggregator: &mut FrameAggregator,
    write_timeout: Duration,
) -> Result<()> {
    for frame in aggregator.drain() {
        send_with_timeout(sender, Message::Binary(frame.to_vec()), write_timeout).await?;
    }
    Ok(())
}

async fn send_with_timeout(
    sender: &mut SplitSink<WebSocket, Message>,
    message: Message,
    limit: Duration,
) -> Result<()> {
    match tokio::time::timeout(limit, sender.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::WriteFailure(e.to_string())),
        Err(_) => Err(Error::WriteFailure(format!("write timed out after {:?}", limit))),
    }
}

/// Toute donnée entrante (pongs compris) repousse l'échéance d'inactivité
async fn read_loop(
    mut receiver: SplitStream<WebSocket>,
    subscriber: Arc<Subscriber>,
    read_timeout: Duration,
    cancel: CancellationToken,
    session_id: String,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(read_timeout, receiver.next()) => match next {
                Err(_) => {
                    tracing::info!(session = %session_id, "Read deadline expired");
                    break;
                }
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
                Ok(Some(Err(e))) => {
                    tracing::debug!(session = %session_id, "WebSocket read error: {}", e);
                    break;
                }
                Ok(Some(Ok(_))) => subscriber.touch(),
            }
        }
    }
    cancel.cancel();
}
