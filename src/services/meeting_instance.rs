use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    audio::{AudioBus, AudioFrame, AudioType},
    sdk::{AudioHandler, MeetingCapability, MeetingConfig, SdkThread},
    services::{MeetingStats, MeetingStatus, StatsRecorder, StatusCell},
    Error, Result,
};

/// Intervalle de lecture de l'état de la session native
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Une session native pilotée dans le processus courant.
///
/// La session vit sur son propre thread SDK ; le callback audio pousse dans une file
/// bornée (sans jamais bloquer) et une unique tâche la vide vers le bus.
#[derive(Debug)]
pub struct MeetingInstance {
    config: MeetingConfig,
    bus: Arc<AudioBus>,
    intake_queue_size: usize,
    status: Arc<StatusCell>,
    stats: Arc<StatsRecorder>,
    sdk: Mutex<Option<Arc<SdkThread>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl MeetingInstance {
    pub fn new(config: MeetingConfig, bus: Arc<AudioBus>, intake_queue_size: usize) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            intake_queue_size: intake_queue_size.max(1),
            status: Arc::new(StatusCell::default()),
            stats: Arc::new(StatsRecorder::new()),
            sdk: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn meeting_id(&self) -> &str {
        &self.config.meeting_id
    }

    pub fn status(&self) -> MeetingStatus {
        self.status.get()
    }

    pub fn stats(&self) -> MeetingStats {
        self.stats.snapshot()
    }

    /// Rejoint le meeting sur le thread SDK. En cas d'échec tout est libéré
    /// et l'état passe à Failed.
    pub async fn start(&self, capability: Arc<dyn MeetingCapability>) -> Result<()> {
        let meeting_id = self.config.meeting_id.clone();
        let sdk = Arc::new(SdkThread::spawn(format!("sdk-{}", meeting_id))?);
        {
            let mut slot = self.sdk.lock();
            if self.stopped.load(Ordering::SeqCst) {
                return Err(Error::Sdk(format!("Meeting {} was stopped before joining", meeting_id)));
            }
            *slot = Some(sdk.clone());
        }

        self.status.transition(MeetingStatus::Connecting);
        tracing::info!(meeting_id = %meeting_id, "Joining meeting");

        let (intake, receiver) = mpsc::channel(self.intake_queue_size);
        let processor = tokio::spawn(process_frames(
            meeting_id.clone(),
            receiver,
            self.bus.clone(),
            self.stats.clone(),
            self.cancel.clone(),
        ));
        self.tasks.lock().push(processor);

        let handler = intake_handler(meeting_id.clone(), intake, self.stats.clone());
        let config = self.config.clone();
        let joined = sdk
            .run(move |slot| {
                let mut session = capability.create_session(&config)?;
                session.register_audio_callback(handler)?;
                let status = session.status();
                *slot = Some(session);
                Ok(status)
            })
            .await;

        match joined {
            Ok(status) => {
                self.status.transition(status);
            }
            Err(e) => {
                tracing::error!(meeting_id = %meeting_id, "Failed to join meeting: {}", e);
                self.teardown().await;
                self.status.transition(MeetingStatus::Failed);
                return Err(e);
            }
        }

        let poller = tokio::spawn(poll_status(
            meeting_id.clone(),
            sdk,
            self.status.clone(),
            self.cancel.clone(),
        ));
        self.tasks.lock().push(poller);

        tracing::info!(meeting_id = %meeting_id, status = %self.status(), "Meeting session started");
        Ok(())
    }

    /// Quitte le meeting et libère le thread SDK. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!(meeting_id = %self.config.meeting_id, "Stopping meeting instance");
        self.teardown().await;
        self.status.transition(MeetingStatus::Ended);
        tracing::info!(meeting_id = %self.config.meeting_id, "Meeting instance stopped");
    }

    async fn teardown(&self) {
        self.cancel.cancel();

        let sdk = self.sdk.lock().take();
        if let Some(sdk) = sdk {
            let left = sdk
                .run(|slot| {
                    if let Some(mut session) = slot.take() {
                        session.leave()?;
                    }
                    Ok(())
                })
                .await;
            if let Err(e) = left {
                tracing::warn!(meeting_id = %self.config.meeting_id, "Error leaving session: {}", e);
            }
            sdk.shutdown().await;
        }

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Callback exécuté sur le thread du SDK : ne bloque jamais
fn intake_handler(
    meeting_id: String,
    intake: mpsc::Sender<AudioFrame>,
    stats: Arc<StatsRecorder>,
) -> AudioHandler {
    Arc::new(move |type_code, speaker_id, data: &[u8]| {
        let Some(audio_type) = AudioType::from_code(type_code) else {
            tracing::warn!(meeting_id = %meeting_id, type_code, "Ignoring audio with unknown type");
            return;
        };

        let frame = AudioFrame::new(audio_type, speaker_id, Bytes::copy_from_slice(data));
        match intake.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                stats.record_drop();
                tracing::warn!(meeting_id = %meeting_id, "Intake queue full, dropping audio");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    })
}

async fn process_frames(
    meeting_id: String,
    mut receiver: mpsc::Receiver<AudioFrame>,
    bus: Arc<AudioBus>,
    stats: Arc<StatsRecorder>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = receiver.recv() => {
                let Some(frame) = frame else { break };
                let delivered = bus.publish(&meeting_id, &frame);
                stats.record_frame(frame.payload.len(), delivered);
                if !delivered {
                    tracing::debug!(meeting_id = %meeting_id, "Dropped audio frame");
                }
            }
        }
    }
    tracing::debug!(meeting_id = %meeting_id, "Audio frame processor stopped");
}

async fn poll_status(
    meeting_id: String,
    sdk: Arc<SdkThread>,
    status: Arc<StatusCell>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(STATUS_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match sdk.run(|slot| Ok(slot.as_ref().map(|s| s.status()))).await {
                    Ok(Some(current)) => {
                        if status.transition(current) {
                            tracing::info!(meeting_id = %meeting_id, status = %current, "Meeting status updated");
                        }
                    }
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
        }
    }
}
