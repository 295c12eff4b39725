use parking_lot::Mutex;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};

use super::MeetingSession;
use crate::{Error, Result};

/// Emplacement de la session possédée par le thread SDK
pub type SessionSlot = Option<Box<dyn MeetingSession>>;

type Command = Box<dyn FnOnce(&mut SessionSlot) + Send>;

/// Thread OS dédié à une session native. Tous les appels au SDK y sont soumis
/// sous forme de commandes, le résultat revient par un canal oneshot.
pub struct SdkThread {
    name: String,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SdkThread {
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Command>();

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut slot: SessionSlot = None;
                while let Some(command) = receiver.blocking_recv() {
                    command(&mut slot);
                }
                // Plus aucun émetteur : on quitte proprement la session restante
                if let Some(mut session) = slot.take() {
                    if let Err(e) = session.leave() {
                        tracing::warn!("Failed to leave session on SDK thread exit: {}", e);
                    }
                }
            })?;

        tracing::debug!(thread = %name, "SDK thread started");

        Ok(Self {
            name,
            commands: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Soumet une commande au thread SDK et attend son résultat
    pub async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut SessionSlot) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let sender = self
            .commands
            .lock()
            .clone()
            .ok_or_else(|| Error::Sdk(format!("SDK thread {} is stopped", self.name)))?;

        let (reply, response) = oneshot::channel();
        let command: Command = Box::new(move |slot| {
            let _ = reply.send(f(slot));
        });

        sender
            .send(command)
            .map_err(|_| Error::Sdk(format!("SDK thread {} has exited", self.name)))?;

        response
            .await
            .map_err(|_| Error::Sdk(format!("SDK thread {} dropped the command", self.name)))?
    }

    pub fn is_running(&self) -> bool {
        self.commands.lock().is_some()
    }

    /// Ferme la file de commandes puis attend la fin du thread
    pub async fn shutdown(&self) {
        self.commands.lock().take();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => tracing::debug!(thread = %self.name, "SDK thread stopped"),
                Ok(Err(_)) => tracing::error!(thread = %self.name, "SDK thread panicked"),
                Err(e) => tracing::error!(thread = %self.name, "Failed to join SDK thread: {}", e),
            }
        }
    }
}

impl Drop for SdkThread {
    fn drop(&mut self) {
        // Le thread se termine seul dès que la file est fermée
        self.commands.lock().take();
    }
}

impl std::fmt::Debug for SdkThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdkThread")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commands_run_on_dedicated_thread() {
        let sdk = SdkThread::spawn("sdk-test").unwrap();

        let name = sdk
            .run(|_| Ok(std::thread::current().name().map(str::to_string)))
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some("sdk-test"));

        let empty = sdk.run(|slot| Ok(slot.is_none())).await.unwrap();
        assert!(empty);
    }

    #[tokio::test]
    async fn test_errors_propagate_and_shutdown_rejects() {
        let sdk = SdkThread::spawn("sdk-test").unwrap();

        let result: Result<()> = sdk.run(|_| Err(Error::Sdk("boom".to_string()))).await;
        assert!(matches!(result, Err(Error::Sdk(msg)) if msg == "boom"));

        sdk.shutdown().await;
        assert!(!sdk.is_running());
        assert!(sdk.run(|_| Ok(())).await.is_err());
    }
}
