use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    audio::AudioBus,
    config::Config,
    models::{JoinMeetingRequest, MeetingSummary},
    sdk::MeetingCapability,
    services::{meeting_config, MeetingInstance, MeetingManager, MeetingStats, MeetingStatus},
    Error, Result,
};

/// Gestionnaire in-process : chaque meeting tourne dans le processus serveur
pub struct LocalMeetingManager {
    meetings: DashMap<String, Arc<MeetingInstance>>,
    capability: Arc<dyn MeetingCapability>,
    bus: Arc<AudioBus>,
    config: Config,
}

impl LocalMeetingManager {
    pub fn new(config: Config, capability: Arc<dyn MeetingCapability>, bus: Arc<AudioBus>) -> Self {
        Self {
            meetings: DashMap::new(),
            capability,
            bus,
            config,
        }
    }

    pub fn get_meeting(&self, meeting_id: &str) -> Option<Arc<MeetingInstance>> {
        self.meetings.get(meeting_id).map(|entry| entry.value().clone())
    }
}

/// Frees the slot and stops the instance when a join future is dropped mid-start
struct PendingJoin<'a> {
    meetings: &'a DashMap<String, Arc<MeetingInstance>>,
    instance: Arc<MeetingInstance>,
    armed: bool,
}

impl PendingJoin<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingJoin<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let meeting_id = self.instance.meeting_id().to_string();
        tracing::warn!(meeting_id = %meeting_id, "Join abandoned, stopping meeting");
        self.meetings
            .remove_if(&meeting_id, |_, current| Arc::ptr_eq(current, &self.instance));

        let instance = self.instance.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { instance.stop().await });
            }
            Err(_) => tracing::error!(meeting_id = %meeting_id, "No runtime to stop abandoned meeting"),
        }
    }
}

#[async_trait]
impl MeetingManager for LocalMeetingManager {
    async fn join_meeting(&self, request: JoinMeetingRequest) -> Result<()> {
        let meeting = meeting_config(&request, &self.config.sdk);
        let meeting_id = meeting.meeting_id.clone();

        // Réservation atomique de l'entrée avant tout travail lent
        let instance = match self.meetings.entry(meeting_id.clone()) {
            Entry::Occupied(_) => return Err(Error::DuplicateMeeting(meeting_id)),
            Entry::Vacant(slot) => {
                let instance = MeetingInstance::new(
                    meeting,
                    self.bus.clone(),
                    self.config.audio.intake_queue_size,
                );
                slot.insert(instance.clone());
                instance
            }
        };

        let pending = PendingJoin {
            meetings: &self.meetings,
            instance: instance.clone(),
            armed: true,
        };
        let started = instance.start(self.capability.clone()).await;
        pending.disarm();

        if let Err(e) = started {
            self.meetings
                .remove_if(&meeting_id, |_, current| Arc::ptr_eq(current, &instance));
            return Err(e);
        }

        tracing::info!(meeting_id = %meeting_id, "Successfully joined meeting");
        Ok(())
    }

    async fn leave_meeting(&self, meeting_id: &str) -> Result<()> {
        let (_, instance) = self
            .meetings
            .remove(meeting_id)
            .ok_or_else(|| Error::NotFound(meeting_id.to_string()))?;

        instance.stop().await;
        tracing::info!(meeting_id = %meeting_id, "Successfully left meeting");
        Ok(())
    }

    fn list_meetings(&self) -> Vec<MeetingSummary> {
        self.meetings
            .iter()
            .map(|entry| MeetingSummary {
                meeting_id: entry.key().clone(),
                status: entry.value().status(),
            })
            .collect()
    }

    fn meeting_status(&self, meeting_id: &str) -> Result<MeetingStatus> {
        self.get_meeting(meeting_id)
            .map(|instance| instance.status())
            .ok_or_else(|| Error::NotFound(meeting_id.to_string()))
    }

    fn get_meeting_stats(&self, meeting_id: &str) -> Result<MeetingStats> {
        self.get_meeting(meeting_id)
            .map(|instance| instance.stats())
            .ok_or_else(|| Error::NotFound(meeting_id.to_string()))
    }

    fn get_all_stats(&self) -> HashMap<String, MeetingStats> {
        self.meetings
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    fn meeting_count(&self) -> usize {
        self.meetings.len()
    }

    async fn shutdown(&self) {
        tracing::info!("Shutting down in-process meeting manager");

        let ids: Vec<String> = self.meetings.iter().map(|entry| entry.key().clone()).collect();
        let instances: Vec<Arc<MeetingInstance>> = ids
            .iter()
            .filter_map(|id| self.meetings.remove(id).map(|(_, instance)| instance))
            .collect();

        let stops = join_all(instances.iter().map(|instance| {
            tracing::info!(meeting_id = %instance.meeting_id(), "Stopping meeting");
            instance.stop()
        }));
        let limit = self.config.workers.shutdown_timeout();
        if tokio::time::timeout(limit, stops).await.is_err() {
            // Une session native bloquée ne peut pas être tuée : on l'abandonne
            let stragglers: Vec<&str> = instances
                .iter()
                .filter(|instance| !instance.status().is_terminal())
                .map(|instance| instance.meeting_id())
                .collect();
            tracing::warn!(?stragglers, "Meetings did not stop within {:?}, abandoning them", limit);
        }

        tracing::info!("Meeting manager shutdown complete");
    }
}
