use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// État d'un meeting (worker ou session in-process)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    Idle,
    Connecting,
    InMeeting,
    Reconnecting,
    Failed,
    Ended,
    Unknown,
}

impl MeetingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::InMeeting => "in_meeting",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Ended => "ended",
            Self::Unknown => "unknown",
        }
    }

    /// Failed et Ended sont définitifs
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Ended)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use MeetingStatus::*;
        match (self, next) {
            (current, _) if current.is_terminal() => false,
            (_, Unknown) | (_, Idle) => false,
            (current, next) if current == next => false,
            (_, Failed) | (_, Ended) => true,
            (Idle, Connecting) | (Idle, InMeeting) => true,
            (Connecting, InMeeting) | (Connecting, Reconnecting) => true,
            (InMeeting, Reconnecting) => true,
            (Reconnecting, InMeeting) => true,
            (Unknown, _) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MeetingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cellule d'état partagée appliquant la machine à états
#[derive(Debug)]
pub struct StatusCell {
    inner: Mutex<MeetingStatus>,
}

impl StatusCell {
    pub fn new(initial: MeetingStatus) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }

    pub fn get(&self) -> MeetingStatus {
        *self.inner.lock()
    }

    /// Applique la transition si elle est autorisée, renvoie true si l'état a changé
    pub fn transition(&self, next: MeetingStatus) -> bool {
        let mut current = self.inner.lock();
        if current.can_transition_to(next) {
            tracing::debug!(from = %*current, to = %next, "Meeting status changed");
            *current = next;
            true
        } else {
            false
        }
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new(MeetingStatus::Idle)
    }
}
