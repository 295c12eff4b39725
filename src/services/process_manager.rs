use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::{
    audio::AudioBus,
    config::Config,
    models::{JoinMeetingRequest, MeetingSummary},
    services::{
        meeting_config, relay, MeetingManager, MeetingStats, MeetingStatus, PortAllocator,
        StatsRecorder, StatusCell,
    },
    worker::{WorkerConfig, WORKER_CONFIG_ENV},
    Error, Result,
};

/// Timeout of a single readiness check
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// Extra wait after force-killing stragglers at shutdown
const KILL_WAIT: Duration = Duration::from_secs(2);

/// One worker process supervised for one meeting.
#[derive(Debug)]
pub struct WorkerProcess {
    meeting_id: String,
    port: u16,
    pid: OnceLock<u32>,
    status: StatusCell,
    stats: StatsRecorder,
    /// Stop requested: cancels the relay and starts the grace period
    stop_token: CancellationToken,
    /// Skip the grace period and kill now
    kill_token: CancellationToken,
    /// Fired by the monitor once the process is reaped and reclaimed
    exited: CancellationToken,
    stopped: AtomicBool,
}

impl WorkerProcess {
    pub(crate) fn new(meeting_id: String, port: u16) -> Self {
        Self {
            meeting_id,
            port,
            pid: OnceLock::new(),
            status: StatusCell::new(MeetingStatus::Idle),
            stats: StatsRecorder::new(),
            stop_token: CancellationToken::new(),
            kill_token: CancellationToken::new(),
            exited: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn meeting_id(&self) -> &str {
        &self.meeting_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    pub fn status(&self) -> MeetingStatus {
        self.status.get()
    }

    pub fn stats(&self) -> MeetingStats {
        self.stats.snapshot()
    }

    pub(crate) fn stats_recorder(&self) -> &StatsRecorder {
        &self.stats
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop_token
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// Asks the worker to stop with SIGTERM. Idempotent; the monitor escalates to
    /// SIGKILL once the grace period is over.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!(meeting_id = %self.meeting_id, pid = ?self.pid(), "Stopping worker process");
        if let Some(pid) = self.pid() {
            if !self.has_exited() {
                send_sigterm(pid);
            }
        }
        self.stop_token.cancel();
    }

    fn kill(&self) {
        self.kill_token.cancel();
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    // SAFETY: kill(2) has no memory-safety preconditions
    let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if result != 0 {
        tracing::warn!(pid, "Failed to send SIGTERM: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

/// The worker dies with the supervisor, even when the supervisor is SIGKILLed.
///
/// The signal fires when the forking *thread* exits, not the process. Spawning must
/// therefore happen on a runtime worker thread, never inside `spawn_blocking`: idle
/// blocking-pool threads are retired after a few seconds and would take every
/// worker they forked with them.
#[cfg(target_os = "linux")]
fn set_parent_death_signal(command: &mut Command) {
    // SAFETY: the closure only calls the async-signal-safe prctl(2)
    unsafe {
        command.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn set_parent_death_signal(_command: &mut Command) {}

/// State shared between the manager and its monitor tasks
#[derive(Debug)]
struct Registry {
    workers: DashMap<String, Arc<WorkerProcess>>,
    ports: PortAllocator,
}

impl Registry {
    /// Single cleanup point for a worker, whatever the exit path
    fn reclaim(&self, worker: &Arc<WorkerProcess>) {
        worker.stop_token.cancel();
        self.ports.release(worker.port);
        self.workers
            .remove_if(&worker.meeting_id, |_, current| Arc::ptr_eq(current, worker));
        worker.exited.cancel();
    }
}

/// Undoes a join whose future is dropped before it completes (client gone,
/// request cancelled). The worker is stopped and its slot freed at once; the
/// monitor releases the port when the process exits.
struct PendingJoin<'a> {
    registry: &'a Registry,
    worker: Arc<WorkerProcess>,
    armed: bool,
}

impl<'a> PendingJoin<'a> {
    fn new(registry: &'a Registry, worker: Arc<WorkerProcess>) -> Self {
        Self {
            registry,
            worker,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingJoin<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(meeting_id = %self.worker.meeting_id, "Join abandoned, stopping worker");
        self.worker.status.transition(MeetingStatus::Failed);
        self.worker.stop();
        self.registry
            .workers
            .remove_if(&self.worker.meeting_id, |_, current| Arc::ptr_eq(current, &self.worker));
        // Aucun processus lancé : rien ne libérera le port à notre place
        if self.worker.pid().is_none() {
            self.registry.reclaim(&self.worker);
        }
    }
}

/// Supervises one worker process per meeting
pub struct ProcessManager {
    registry: Arc<Registry>,
    bus: Arc<AudioBus>,
    client: reqwest::Client,
    config: Config,
    worker_binary: PathBuf,
    callback_url: String,
}

impl ProcessManager {
    pub fn new(config: Config, bus: Arc<AudioBus>) -> Result<Self> {
        let worker_binary = match &config.workers.worker_binary {
            Some(path) => PathBuf::from(path),
            None => std::env::current_exe()?,
        };
        tracing::info!("Using worker binary: {} worker", worker_binary.display());

        let callback_url = config.workers.callback_url.clone().unwrap_or_else(|| {
            format!("http://127.0.0.1:{}/api/workers/ready", config.server.http_port)
        });

        Ok(Self {
            registry: Arc::new(Registry {
                workers: DashMap::new(),
                ports: PortAllocator::new(config.workers.base_port, config.workers.max_port),
            }),
            bus,
            client: reqwest::Client::builder().build()?,
            config,
            worker_binary,
            callback_url,
        })
    }

    pub fn get_worker(&self, meeting_id: &str) -> Option<Arc<WorkerProcess>> {
        self.registry
            .workers
            .get(meeting_id)
            .map(|entry| entry.value().clone())
    }

    pub fn is_port_allocated(&self, port: u16) -> bool {
        self.registry.ports.is_allocated(port)
    }

    fn worker_url(&self, port: u16, path: &str) -> String {
        format!("http://{}:{}{}", self.config.workers.bind_host, port, path)
    }

    /// Must run on an async worker thread, see `set_parent_death_signal`.
    fn spawn_worker(&self, request: &JoinMeetingRequest, worker: &WorkerProcess) -> Result<Child> {
        let worker_config = WorkerConfig {
            meeting: meeting_config(request, &self.config.sdk),
            worker_port: worker.port,
            bind_host: self.config.workers.bind_host.clone(),
            callback_url: Some(self.callback_url.clone()),
            audio: self.config.audio.clone(),
            simulation: self.config.simulation.clone(),
        };
        let config_json = serde_json::to_string(&worker_config)?;

        let mut command = Command::new(&self.worker_binary);
        command
            .arg("worker")
            .env(WORKER_CONFIG_ENV, config_json)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        set_parent_death_signal(&mut command);

        Ok(command.spawn()?)
    }

    /// Polls `/health` until it answers, the deadline passes or the process exits
    async fn wait_for_ready(&self, worker: &WorkerProcess) -> Result<()> {
        let url = self.worker_url(worker.port, "/health");
        let deadline = Instant::now() + self.config.workers.ready_timeout();

        loop {
            if worker.has_exited() || worker.stop_token.is_cancelled() {
                return Err(Error::SpawnFailure(format!(
                    "worker for meeting {} exited before becoming ready",
                    worker.meeting_id
                )));
            }

            match self.client.get(&url).timeout(HEALTH_CHECK_TIMEOUT).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::info!(meeting_id = %worker.meeting_id, pid = ?worker.pid(), "Worker ready");
                    return Ok(());
                }
                Ok(response) => {
                    tracing::debug!(meeting_id = %worker.meeting_id, status = %response.status(), "Worker not ready yet");
                }
                Err(e) => {
                    tracing::trace!(meeting_id = %worker.meeting_id, "Health check failed: {}", e);
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::SpawnFailure(format!(
                    "worker for meeting {} did not become ready within {:?}",
                    worker.meeting_id,
                    self.config.workers.ready_timeout()
                )));
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.workers.ready_poll_interval()) => {}
                _ = worker.exited.cancelled() => {}
            }
        }
    }
}

/// Owns the child process: waits for its exit, escalates a stop request to a kill
/// after the grace period, then reclaims everything.
async fn monitor_worker(
    registry: Arc<Registry>,
    mut child: Child,
    worker: Arc<WorkerProcess>,
    grace: Duration,
) {
    let exit = tokio::select! {
        status = child.wait() => status,
        _ = worker.stop_token.cancelled() => {
            tokio::select! {
                status = child.wait() => status,
                _ = tokio::time::sleep(grace) => {
                    tracing::warn!(meeting_id = %worker.meeting_id, "Worker ignored SIGTERM, killing it");
                    kill_and_wait(&mut child).await
                }
                _ = worker.kill_token.cancelled() => kill_and_wait(&mut child).await,
            }
        }
    };

    let stop_requested = worker.stopped.load(Ordering::SeqCst);
    match &exit {
        Ok(status) if status.success() || stop_requested => {
            tracing::info!(meeting_id = %worker.meeting_id, %status, "Worker process exited");
            worker.status.transition(MeetingStatus::Ended);
        }
        Ok(status) => {
            tracing::error!(meeting_id = %worker.meeting_id, %status, "Worker process exited with error");
            worker.status.transition(MeetingStatus::Failed);
        }
        Err(e) => {
            tracing::error!(meeting_id = %worker.meeting_id, "Failed to wait for worker process: {}", e);
            worker.status.transition(MeetingStatus::Failed);
        }
    }

    registry.reclaim(&worker);
}

async fn kill_and_wait(child: &mut Child) -> std::io::Result<std::process::ExitStatus> {
    if let Err(e) = child.start_kill() {
        tracing::warn!("Failed to kill worker process: {}", e);
    }
    child.wait().await
}

#[async_trait]
impl MeetingManager for ProcessManager {
    async fn join_meeting(&self, request: JoinMeetingRequest) -> Result<()> {
        let meeting_id = request.meeting_id.trim().to_string();

        let worker = match self.registry.workers.entry(meeting_id.clone()) {
            Entry::Occupied(_) => return Err(Error::DuplicateMeeting(meeting_id)),
            Entry::Vacant(slot) => {
                let port = self.registry.ports.allocate()?;
                let worker = Arc::new(WorkerProcess::new(meeting_id.clone(), port));
                slot.insert(worker.clone());
                worker
            }
        };
        worker.status.transition(MeetingStatus::Connecting);
        let pending = PendingJoin::new(&self.registry, worker.clone());

        let child = match self.spawn_worker(&request, &worker) {
            Ok(child) => child,
            Err(e) => {
                pending.disarm();
                worker.status.transition(MeetingStatus::Failed);
                self.registry.reclaim(&worker);
                return Err(Error::SpawnFailure(e.to_string()));
            }
        };

        if let Some(pid) = child.id() {
            let _ = worker.pid.set(pid);
        }
        tracing::info!(meeting_id = %meeting_id, pid = ?worker.pid(), port = worker.port, "Spawned worker process");

        tokio::spawn(monitor_worker(
            self.registry.clone(),
            child,
            worker.clone(),
            self.config.workers.stop_grace(),
        ));

        if let Err(e) = self.wait_for_ready(&worker).await {
            tracing::error!(meeting_id = %meeting_id, "{}", e);
            worker.status.transition(MeetingStatus::Failed);
            worker.stop();
            // Si l'attente est annulée, le guard retire quand même l'entrée
            worker.exited.cancelled().await;
            pending.disarm();
            return Err(e);
        }
        pending.disarm();

        if !worker.status.transition(MeetingStatus::InMeeting) {
            return Err(Error::SpawnFailure(format!(
                "worker for meeting {} ended while starting",
                meeting_id
            )));
        }

        tokio::spawn(relay::run_relay(
            self.client.clone(),
            worker.clone(),
            self.worker_url(worker.port, "/audio"),
            self.bus.clone(),
            self.config.workers.relay_start_delay(),
        ));

        tracing::info!(
            meeting_id = %meeting_id,
            pid = ?worker.pid(),
            port = worker.port,
            "Successfully spawned worker for meeting"
        );
        Ok(())
    }

    async fn leave_meeting(&self, meeting_id: &str) -> Result<()> {
        let (_, worker) = self
            .registry
            .workers
            .remove(meeting_id)
            .ok_or_else(|| Error::NotFound(meeting_id.to_string()))?;

        worker.stop();
        tracing::info!(meeting_id = %meeting_id, "Successfully stopped worker for meeting");
        Ok(())
    }

    fn list_meetings(&self) -> Vec<MeetingSummary> {
        self.registry
            .workers
            .iter()
            .map(|entry| MeetingSummary {
                meeting_id: entry.key().clone(),
                status: entry.value().status(),
            })
            .collect()
    }

    fn meeting_status(&self, meeting_id: &str) -> Result<MeetingStatus> {
        self.get_worker(meeting_id)
            .map(|worker| worker.status())
            .ok_or_else(|| Error::NotFound(meeting_id.to_string()))
    }

    fn get_meeting_stats(&self, meeting_id: &str) -> Result<MeetingStats> {
        self.get_worker(meeting_id)
            .map(|worker| worker.stats())
            .ok_or_else(|| Error::NotFound(meeting_id.to_string()))
    }

    fn get_all_stats(&self) -> HashMap<String, MeetingStats> {
        self.registry
            .workers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    fn meeting_count(&self) -> usize {
        self.registry.workers.len()
    }

    async fn shutdown(&self) {
        tracing::info!("Shutting down process manager");

        let workers: Vec<Arc<WorkerProcess>> = self
            .registry
            .workers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for worker in &workers {
            tracing::info!(meeting_id = %worker.meeting_id, pid = ?worker.pid(), "Stopping worker");
            worker.stop();
        }

        let all_exited = join_all(workers.iter().map(|w| w.exited.cancelled()));
        if tokio::time::timeout(self.config.workers.shutdown_timeout(), all_exited)
            .await
            .is_err()
        {
            let stragglers: Vec<_> = workers.iter().filter(|w| !w.has_exited()).collect();
            tracing::warn!(count = stragglers.len(), "Force-killing workers after shutdown timeout");
            for worker in &stragglers {
                worker.kill();
            }
            let killed = join_all(stragglers.iter().map(|w| w.exited.cancelled()));
            let _ = tokio::time::timeout(KILL_WAIT, killed).await;
        }

        self.registry.workers.clear();
        tracing::info!("Process manager shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_port: u16, max_port: u16) -> Config {
        let mut config = Config::default();
        config.workers.base_port = base_port;
        config.workers.max_port = max_port;
        config.workers.ready_timeout_ms = 300;
        config.workers.ready_poll_interval_ms = 50;
        config
    }

    fn request(meeting_id: &str) -> JoinMeetingRequest {
        JoinMeetingRequest {
            meeting_id: meeting_id.to_string(),
            ..JoinMeetingRequest::default()
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_port_and_slot() {
        let mut config = config(24100, 24101);
        config.workers.worker_binary = Some("/nonexistent/meeting-audio-worker".to_string());
        let manager = ProcessManager::new(config, Arc::new(AudioBus::new())).unwrap();

        assert!(matches!(
            manager.join_meeting(request("m1")).await,
            Err(Error::SpawnFailure(_))
        ));
        assert_eq!(manager.meeting_count(), 0);
        assert!(!manager.registry.ports.is_allocated(24100));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_exiting_early_is_reclaimed() {
        // `false worker` exits at once without ever serving /health
        let mut config = config(24110, 24111);
        config.workers.worker_binary = Some("false".to_string());
        config.workers.stop_grace_secs = 1;
        let manager = ProcessManager::new(config, Arc::new(AudioBus::new())).unwrap();

        let result = manager.join_meeting(request("m1")).await;
        assert!(matches!(result, Err(Error::SpawnFailure(_))));
        assert_eq!(manager.meeting_count(), 0);
        assert!(!manager.registry.ports.is_allocated(24110));
    }

    /// Executable that stays alive without ever serving /health
    #[cfg(unix)]
    fn silent_worker_script(name: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = std::env::temp_dir().join(format!("{}-{}.sh", name, std::process::id()));
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abandoned_join_frees_slot_and_port() {
        let mut config = config(24150, 24152);
        config.workers.worker_binary = Some(silent_worker_script("abandoned-join"));
        config.workers.ready_timeout_ms = 10_000;
        config.workers.stop_grace_secs = 1;
        let manager = Arc::new(ProcessManager::new(config, Arc::new(AudioBus::new())).unwrap());

        let join = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.join_meeting(request("m1")).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        let worker = manager.get_worker("m1").unwrap();
        assert_eq!(worker.status(), MeetingStatus::Connecting);
        let port = worker.port();

        join.abort();
        assert!(join.await.unwrap_err().is_cancelled());

        assert_eq!(manager.meeting_count(), 0);
        assert_eq!(worker.status(), MeetingStatus::Failed);

        // SIGTERM arrête le processus, le moniteur libère ensuite le port
        tokio::time::timeout(Duration::from_secs(5), worker.exited.cancelled())
            .await
            .unwrap();
        assert!(!manager.registry.ports.is_allocated(port));

        // Un nouveau join du même meeting est accepté
        let rejoin = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.join_meeting(request("m1")).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.meeting_status("m1").unwrap(), MeetingStatus::Connecting);

        rejoin.abort();
        let _ = rejoin.await;
        assert_eq!(manager.meeting_count(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_ports() {
        let manager = ProcessManager::new(config(24120, 24121), Arc::new(AudioBus::new())).unwrap();
        let _held = manager.registry.ports.allocate().unwrap();

        assert!(matches!(
            manager.join_meeting(request("m1")).await,
            Err(Error::AllocationExhausted { .. })
        ));
        assert_eq!(manager.meeting_count(), 0);
    }

    #[tokio::test]
    async fn test_leave_unknown_meeting() {
        let manager = ProcessManager::new(config(24130, 24140), Arc::new(AudioBus::new())).unwrap();
        assert!(matches!(
            manager.leave_meeting("missing").await,
            Err(Error::NotFound(_))
        ));
    }
}
