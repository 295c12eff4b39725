use dasp::{signal, Signal};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{AudioHandler, CallbackRegistry, MeetingCapability, MeetingConfig, MeetingSession, SessionHandle};
use crate::audio::AudioType;
use crate::config::{Config, SimulationConfig};
use crate::services::MeetingStatus;
use crate::{Error, Result};

/// Amplitude des tons générés, laisse de la marge pour le mix
const TONE_AMPLITUDE: f64 = 0.25;

/// Capacité de meeting simulée : chaque session produit un ton sinusoïdal
/// par speaker, plus un flux mixé (speaker 0).
#[derive(Debug, Clone)]
pub struct SimulatedCapability {
    registry: Arc<CallbackRegistry>,
    sample_rate: u32,
    frame_ms: u64,
    speakers: Vec<u64>,
    tone_hz: f64,
}

impl SimulatedCapability {
    pub fn new(sample_rate: u32, simulation: &SimulationConfig) -> Self {
        Self {
            registry: Arc::new(CallbackRegistry::new()),
            sample_rate,
            frame_ms: simulation.frame_ms.max(1),
            speakers: simulation.speakers.clone(),
            tone_hz: simulation.tone_hz,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.audio.sample_rate, &config.simulation)
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }
}

impl MeetingCapability for SimulatedCapability {
    fn create_session(&self, config: &MeetingConfig) -> Result<Box<dyn MeetingSession>> {
        if config.meeting_id.trim().is_empty() {
            return Err(Error::Sdk("Meeting id is required".to_string()));
        }

        let handle = self.registry.allocate();
        let status = Arc::new(Mutex::new(MeetingStatus::Connecting));
        let stop = Arc::new(AtomicBool::new(false));

        let generator = ToneGenerator {
            registry: self.registry.clone(),
            handle,
            status: status.clone(),
            stop: stop.clone(),
            sample_rate: self.sample_rate,
            frame: Duration::from_millis(self.frame_ms),
            speakers: self.speakers.clone(),
            tone_hz: self.tone_hz,
        };

        let thread = std::thread::Builder::new()
            .name(format!("sim-{}", config.meeting_id))
            .spawn(move || generator.run())?;

        tracing::info!(meeting_id = %config.meeting_id, handle = handle.value(), "Simulated session created");

        Ok(Box::new(SimulatedSession {
            registry: self.registry.clone(),
            handle,
            status,
            stop,
            thread: Some(thread),
        }))
    }
}

struct SimulatedSession {
    registry: Arc<CallbackRegistry>,
    handle: SessionHandle,
    status: Arc<Mutex<MeetingStatus>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatedSession {
    fn stop_generator(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(handle = self.handle.value(), "Tone generator panicked");
            }
        }
        self.registry.unregister(self.handle);
    }
}

impl MeetingSession for SimulatedSession {
    fn status(&self) -> MeetingStatus {
        *self.status.lock()
    }

    fn register_audio_callback(&mut self, handler: AudioHandler) -> Result<()> {
        if self.thread.is_none() {
            return Err(Error::Sdk("Session already left".to_string()));
        }
        self.registry.register(self.handle, handler);
        Ok(())
    }

    fn leave(&mut self) -> Result<()> {
        self.stop_generator();
        *self.status.lock() = MeetingStatus::Ended;
        Ok(())
    }
}

impl Drop for SimulatedSession {
    fn drop(&mut self) {
        self.stop_generator();
    }
}

struct ToneGenerator {
    registry: Arc<CallbackRegistry>,
    handle: SessionHandle,
    status: Arc<Mutex<MeetingStatus>>,
    stop: Arc<AtomicBool>,
    sample_rate: u32,
    frame: Duration,
    speakers: Vec<u64>,
    tone_hz: f64,
}

impl ToneGenerator {
    fn run(self) {
        let samples_per_frame =
            ((self.sample_rate as u128 * self.frame.as_millis()) / 1000).max(1) as usize;

        // Une fréquence distincte par speaker pour les différencier à l'écoute
        let mut tones: Vec<_> = self
            .speakers
            .iter()
            .enumerate()
            .map(|(i, _)| {
                signal::rate(self.sample_rate as f64)
                    .const_hz(self.tone_hz * (1.0 + i as f64 * 0.5))
                    .sine()
            })
            .collect();

        *self.status.lock() = MeetingStatus::InMeeting;

        let mut next_tick = Instant::now();
        let mut mix = vec![0i32; samples_per_frame];
        while !self.stop.load(Ordering::SeqCst) {
            mix.iter_mut().for_each(|s| *s = 0);

            for (speaker_id, tone) in self.speakers.iter().zip(tones.iter_mut()) {
                let mut pcm = Vec::with_capacity(samples_per_frame * 2);
                for acc in mix.iter_mut() {
                    let sample = (tone.next() * TONE_AMPLITUDE * i16::MAX as f64) as i16;
                    *acc += sample as i32;
                    pcm.extend_from_slice(&sample.to_le_bytes());
                }
                self.registry
                    .dispatch(self.handle, AudioType::OneWay.code(), *speaker_id, &pcm);
            }

            let mixed: Vec<u8> = mix
                .iter()
                .flat_map(|s| ((*s).clamp(i16::MIN as i32, i16::MAX as i32) as i16).to_le_bytes())
                .collect();
            self.registry
                .dispatch(self.handle, AudioType::Mixed.code(), 0, &mixed);

            next_tick += self.frame;
            let now = Instant::now();
            if next_tick > now {
                std::thread::sleep(next_tick - now);
            } else {
                next_tick = now;
            }
        }
    }
}
