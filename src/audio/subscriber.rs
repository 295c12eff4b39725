use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::audio::{AudioFrame, AudioType};

/// Filtres d'un abonné. Un ensemble vide (ou un meeting vide) accepte tout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberFilter {
    pub meeting_id: String,
    pub audio_types: HashSet<AudioType>,
    pub speaker_ids: HashSet<u64>,
}

impl SubscriberFilter {
    pub fn for_meeting(meeting_id: impl Into<String>) -> Self {
        Self {
            meeting_id: meeting_id.into(),
            ..Self::default()
        }
    }

    pub fn with_audio_types(mut self, types: impl IntoIterator<Item = AudioType>) -> Self {
        self.audio_types = types.into_iter().collect();
        self
    }

    pub fn with_speakers(mut self, speakers: impl IntoIterator<Item = u64>) -> Self {
        self.speaker_ids = speakers.into_iter().collect();
        self
    }

    /// Le meeting, le type et le speaker doivent correspondre simultanément
    pub fn matches(&self, meeting_id: &str, frame: &AudioFrame) -> bool {
        (self.meeting_id.is_empty() || self.meeting_id == meeting_id)
            && (self.audio_types.is_empty() || self.audio_types.contains(&frame.audio_type))
            && (self.speaker_ids.is_empty() || self.speaker_ids.contains(&frame.speaker_id))
    }
}

/// Résultat d'une tentative de livraison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// File pleine, frame abandonnée pour cet abonné uniquement
    Dropped,
    /// Abonné fermé entre le snapshot et l'envoi
    Closed,
}

#[derive(Debug)]
struct SubscriberState {
    sender: Option<mpsc::Sender<AudioFrame>>,
    last_activity: Instant,
}

/// Point de livraison filtré et borné enregistré sur le bus.
/// Le verrou est propre à l'abonné : un abonné lent ne bloque pas les autres.
#[derive(Debug)]
pub struct Subscriber {
    id: String,
    filter: SubscriberFilter,
    state: Mutex<SubscriberState>,
}

impl Subscriber {
    /// Crée un abonné et renvoie l'extrémité de lecture de sa file
    pub fn new(
        id: impl Into<String>,
        filter: SubscriberFilter,
        queue_size: usize,
    ) -> (Self, mpsc::Receiver<AudioFrame>) {
        let (sender, receiver) = mpsc::channel(queue_size.max(1));
        let subscriber = Self {
            id: id.into(),
            filter,
            state: Mutex::new(SubscriberState {
                sender: Some(sender),
                last_activity: Instant::now(),
            }),
        };
        (subscriber, receiver)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn filter(&self) -> &SubscriberFilter {
        &self.filter
    }

    pub fn should_receive(&self, meeting_id: &str, frame: &AudioFrame) -> bool {
        self.is_connected() && self.filter.matches(meeting_id, frame)
    }

    /// Envoi non bloquant : si la file est pleine la frame la plus récente est abandonnée
    pub fn send(&self, frame: AudioFrame) -> Delivery {
        let mut state = self.state.lock();
        let Some(sender) = state.sender.as_ref() else {
            return Delivery::Closed;
        };

        match sender.try_send(frame) {
            Ok(()) => {
                state.last_activity = Instant::now();
                Delivery::Delivered
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subscriber = %self.id, "Dropping frame (queue full)");
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Le lecteur a disparu : l'abonné est fermé pour de bon
                state.sender = None;
                Delivery::Closed
            }
        }
    }

    /// Ferme la file. Idempotent ; les frames déjà en file restent lisibles.
    pub fn close(&self) {
        self.state.lock().sender.take();
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().sender.is_some()
    }

    pub fn last_activity(&self) -> Instant {
        self.state.lock().last_activity
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// Marque l'abonné comme actif sans livraison (lecture côté client, etc.)
    pub fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }
}
