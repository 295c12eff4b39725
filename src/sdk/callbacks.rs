use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::AudioHandler;

/// Handle opaque d'une session native
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Table handle -> handler audio. L'enregistrement suit la durée de vie de la session.
#[derive(Default)]
pub struct CallbackRegistry {
    handlers: RwLock<HashMap<SessionHandle, AudioHandler>>,
    next_handle: AtomicU64,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Alloue un handle sans handler associé
    pub fn allocate(&self) -> SessionHandle {
        SessionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn register(&self, handle: SessionHandle, handler: AudioHandler) {
        self.handlers.write().insert(handle, handler);
    }

    pub fn unregister(&self, handle: SessionHandle) -> bool {
        self.handlers.write().remove(&handle).is_some()
    }

    pub fn is_registered(&self, handle: SessionHandle) -> bool {
        self.handlers.read().contains_key(&handle)
    }

    /// Route un packet vers le handler de la session. Faux si aucun handler.
    pub fn dispatch(&self, handle: SessionHandle, type_code: u64, speaker_id: u64, data: &[u8]) -> bool {
        // Le handler est cloné pour ne pas l'appeler sous le verrou
        let handler = self.handlers.read().get(&handle).cloned();
        match handler {
            Some(handler) => {
                handler(type_code, speaker_id, data);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("handlers", &self.len())
            .finish()
    }
}
