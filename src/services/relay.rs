use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    audio::{AudioBus, LineDecoder, WorkerPacket},
    services::WorkerProcess,
    Error, Result,
};

/// Relaie le flux `/audio` d'un worker vers le bus local, jusqu'à l'arrêt du worker
/// ou la fermeture du flux. Ne relance jamais le worker.
pub async fn run_relay(
    client: reqwest::Client,
    worker: Arc<WorkerProcess>,
    url: String,
    bus: Arc<AudioBus>,
    start_delay: Duration,
) {
    let stop = worker.stop_token().clone();

    // Laisser au worker le temps de finir son démarrage
    tokio::select! {
        _ = stop.cancelled() => return,
        _ = tokio::time::sleep(start_delay) => {}
    }

    let result = tokio::select! {
        _ = stop.cancelled() => Ok(()),
        result = relay_stream(&client, &worker, &url, &bus) => result,
    };

    match result {
        Ok(()) => tracing::info!(meeting_id = %worker.meeting_id(), "Audio relay stopped"),
        Err(e) => tracing::error!(meeting_id = %worker.meeting_id(), "Audio relay ended: {}", e),
    }
}

async fn relay_stream(
    client: &reqwest::Client,
    worker: &WorkerProcess,
    url: &str,
    bus: &AudioBus,
) -> Result<()> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::UpstreamDisconnect(format!("cannot reach {}: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(Error::UpstreamDisconnect(format!(
            "worker audio stream returned status {}",
            response.status()
        )));
    }

    tracing::info!(meeting_id = %worker.meeting_id(), "Audio streaming started from worker");

    let mut stream = response.bytes_stream();
    let mut decoder = LineDecoder::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::UpstreamDisconnect(e.to_string()))?;
        decoder.push(&chunk);

        while let Some(line) = decoder.next_line() {
            let frame = line
                .and_then(|line| WorkerPacket::from_line(&line))
                .and_then(WorkerPacket::into_frame);

            match frame {
                Ok(frame) => {
                    let delivered = bus.publish(worker.meeting_id(), &frame);
                    worker
                        .stats_recorder()
                        .record_frame(frame.payload.len(), delivered);
                }
                Err(e) => {
                    tracing::warn!(meeting_id = %worker.meeting_id(), "Skipping audio packet: {}", e);
                }
            }
        }
    }

    Err(Error::UpstreamDisconnect(
        "audio stream closed by worker".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioFrame, AudioType, SubscriberFilter};
    use axum::{routing::get, Router};

    #[tokio::test]
    async fn test_relay_publishes_packets_and_skips_garbage() {
        let first = WorkerPacket::from(&AudioFrame::new(AudioType::OneWay, 7, vec![1u8, 2]))
            .to_line()
            .unwrap();
        let second = WorkerPacket::from(&AudioFrame::new(AudioType::Mixed, 0, vec![3u8]))
            .to_line()
            .unwrap();
        let mut body = Vec::new();
        body.extend_from_slice(&first);
        body.extend_from_slice(b"{not a packet}\n");
        body.extend_from_slice(&second);

        let app = Router::new().route("/audio", get(move || async move { body }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let bus = Arc::new(AudioBus::new());
        let (_, mut rx) = bus.subscribe_with("relay-test", SubscriberFilter::for_meeting("m1"), 10);
        let worker = Arc::new(WorkerProcess::new("m1".to_string(), addr.port()));

        // Le flux se termine après le corps : le relais rend la main
        run_relay(
            reqwest::Client::new(),
            worker.clone(),
            format!("http://{}/audio", addr),
            bus,
            Duration::ZERO,
        )
        .await;

        assert_eq!(rx.try_recv().unwrap().speaker_id, 7);
        assert_eq!(rx.try_recv().unwrap().audio_type, AudioType::Mixed);
        assert!(rx.try_recv().is_err());

        let stats = worker.stats();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.bytes_received, 3);
    }

    #[tokio::test]
    async fn test_relay_stops_on_stop_signal() {
        let worker = Arc::new(WorkerProcess::new("m1".to_string(), 1));
        worker.stop_token().cancel();

        // Aucune connexion n'est tentée après l'arrêt
        tokio::time::timeout(
            Duration::from_secs(1),
            run_relay(
                reqwest::Client::new(),
                worker,
                "http://127.0.0.1:1/audio".to_string(),
                Arc::new(AudioBus::new()),
                Duration::from_secs(30),
            ),
        )
        .await
        .unwrap();
    }
}
