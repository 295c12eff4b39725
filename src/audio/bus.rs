use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use crate::audio::{AudioFrame, Delivery, Subscriber, SubscriberFilter};

/// Statistiques agrégées du bus
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub total_published: u64,
    pub total_dropped: u64,
    pub active_subscribers: usize,
    /// Millisecondes unix, absent tant que rien n'a été publié
    pub last_publish_time: Option<u64>,
}

/// Hub publish/subscribe en mémoire pour les frames audio
#[derive(Debug, Default)]
pub struct AudioBus {
    subscribers: RwLock<HashMap<String, Arc<Subscriber>>>,
    total_published: AtomicU64,
    total_dropped: AtomicU64,
    last_publish: Mutex<Option<SystemTime>>,
}

impl AudioBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enregistre un abonné. Un id déjà présent remplace l'ancien sans le fermer.
    pub fn subscribe(&self, subscriber: Arc<Subscriber>) {
        let id = subscriber.id().to_string();
        if self.subscribers.write().insert(id.clone(), subscriber).is_some() {
            tracing::debug!(subscriber = %id, "Replaced existing subscriber");
        } else {
            tracing::debug!(subscriber = %id, "Subscriber registered");
        }
    }

    /// Crée et enregistre un abonné en une étape
    pub fn subscribe_with(
        &self,
        id: impl Into<String>,
        filter: SubscriberFilter,
        queue_size: usize,
    ) -> (Arc<Subscriber>, mpsc::Receiver<AudioFrame>) {
        let (subscriber, receiver) = Subscriber::new(id, filter, queue_size);
        let subscriber = Arc::new(subscriber);
        self.subscribe(subscriber.clone());
        (subscriber, receiver)
    }

    pub fn unsubscribe(&self, id: &str) {
        if let Some(subscriber) = self.subscribers.write().remove(id) {
            subscriber.close();
            tracing::debug!(subscriber = %id, "Subscriber removed");
        }
    }

    /// Publie une frame vers tous les abonnés correspondants.
    /// Renvoie false si des abonnés correspondaient et qu'aucune livraison n'a réussi,
    /// y compris quand ils se sont tous fermés entre-temps.
    pub fn publish(&self, meeting_id: &str, frame: &AudioFrame) -> bool {
        self.total_published.fetch_add(1, Ordering::Relaxed);
        *self.last_publish.lock() = Some(SystemTime::now());

        // Snapshot sous verrou de lecture, livraison hors verrou
        let targets: Vec<Arc<Subscriber>> = {
            let subscribers = self.subscribers.read();
            subscribers
                .values()
                .filter(|s| s.should_receive(meeting_id, frame))
                .cloned()
                .collect()
        };

        if targets.is_empty() {
            return true;
        }

        let mut delivered = 0usize;
        for subscriber in &targets {
            match subscriber.send(frame.clone()) {
                Delivery::Delivered => delivered += 1,
                Delivery::Dropped => {
                    self.total_dropped.fetch_add(1, Ordering::Relaxed);
                }
                // Fermé entre le snapshot et l'envoi : le sweep l'évincera
                Delivery::Closed => {}
            }
        }

        delivered > 0
    }

    /// Ferme et retire les abonnés déconnectés ou inactifs depuis plus de `timeout`
    pub fn cleanup_inactive_subscribers(&self, timeout: Duration) -> usize {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();

        subscribers.retain(|id, subscriber| {
            let keep = subscriber.is_connected() && subscriber.idle_for() <= timeout;
            if !keep {
                subscriber.close();
                tracing::info!(subscriber = %id, "Evicting inactive subscriber");
            }
            keep
        });

        before - subscribers.len()
    }

    /// Ferme tous les abonnés. Le bus reste utilisable ensuite.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<Subscriber>> = self.subscribers.write().drain().map(|(_, s)| s).collect();
        for subscriber in &drained {
            subscriber.close();
        }
        tracing::info!(count = drained.len(), "Audio bus shut down");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn get_subscriber(&self, id: &str) -> Option<Arc<Subscriber>> {
        self.subscribers.read().get(id).cloned()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            total_published: self.total_published.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count(),
            last_publish_time: self.last_publish.lock().map(unix_millis),
        }
    }
}

pub(crate) fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Désabonne automatiquement quand la session qui le détient disparaît
#[derive(Debug)]
pub struct SubscriptionGuard {
    bus: Arc<AudioBus>,
    id: String,
}

impl SubscriptionGuard {
    pub fn new(bus: Arc<AudioBus>, id: impl Into<String>) -> Self {
        Self { bus, id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.id);
    }
}
