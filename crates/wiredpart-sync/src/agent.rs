//! # Sync Agent
//!
//! Runs the engine on a schedule: a round every `sync.interval_minutes`,
//! plus rounds triggered manually from the presentation layer.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncAgent Architecture                           │
//! │                                                                         │
//! │   SyncAgentHandle                         agent task (one per device)  │
//! │   ───────────────                         ──────────────────────────   │
//! │   trigger(mode) ──── AgentCommand ──────► select! {                    │
//! │        ▲                                    interval tick → Full round  │
//! │        └──────── oneshot reply ◄──────────  command      → mode round  │
//! │                                             shutdown     → exit         │
//! │   status() ◄──── Arc<RwLock<AgentStatus>> }                             │
//! │   shutdown()                                                           │
//! │                                                                         │
//! │  Rounds run one at a time on the agent task; the engine's own guard    │
//! │  additionally rejects rounds started outside the agent.                │
//! │                                                                         │
//! │  EVENTS (to the presentation layer):                                   │
//! │  emit_round  - RoundReport after every successful round                │
//! │  emit_health - SyncHealth after every round, success or not            │
//! │  emit_error  - message + retryable flag on failure                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use wiredpart_core::SyncHealth;

use crate::engine::{RoundMode, RoundReport, SyncEngine};
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Agent Status
// =============================================================================

/// Agent state for external queries.
#[derive(Debug, Clone, Default)]
pub struct AgentStatus {
    pub running: bool,
    pub round_in_progress: bool,
    pub rounds_completed: u64,
    pub last_round_at: Option<DateTime<Utc>>,
    /// Outcome label of the last failed round ("offline", "deferred", ...).
    pub last_outcome: Option<String>,
    pub last_error: Option<String>,
    pub health: Option<SyncHealth>,
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives sync events (implemented by the UI integration).
pub trait SyncEventEmitter: Send + Sync {
    /// A round finished successfully.
    fn emit_round(&self, report: &RoundReport);

    /// Health after a round.
    fn emit_health(&self, health: &SyncHealth);

    /// A round failed.
    fn emit_error(&self, message: &str, retryable: bool);
}

/// No-op event emitter for headless use.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_round(&self, _report: &RoundReport) {}
    fn emit_health(&self, _health: &SyncHealth) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

// =============================================================================
// Sync Agent
// =============================================================================

enum AgentCommand {
    Trigger {
        mode: RoundMode,
        reply: oneshot::Sender<SyncResult<RoundReport>>,
    },
}

/// Schedules rounds for one device.
pub struct SyncAgent {
    engine: Arc<SyncEngine>,
    status: Arc<RwLock<AgentStatus>>,
    emitter: Arc<dyn SyncEventEmitter>,
}

impl SyncAgent {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self::with_emitter(engine, Arc::new(NoOpEmitter))
    }

    pub fn with_emitter(engine: Arc<SyncEngine>, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        SyncAgent {
            engine,
            status: Arc::new(RwLock::new(AgentStatus::default())),
            emitter,
        }
    }

    /// Starts the agent task. The first scheduled round runs immediately.
    pub fn spawn(self) -> SyncAgentHandle {
        let (command_tx, command_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let status = self.status.clone();

        let task = tokio::spawn(self.run(command_rx, shutdown_rx));

        SyncAgentHandle {
            command_tx,
            shutdown_tx,
            status,
            task,
        }
    }

    async fn run(
        self,
        mut command_rx: mpsc::Receiver<AgentCommand>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let interval = self.engine.config().interval();
        info!(
            interval_secs = interval.as_secs(),
            "Sync agent started"
        );
        self.status.write().await.running = true;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.engine.config().is_configured() {
                        debug!("Scheduled round skipped: sync not configured");
                        continue;
                    }
                    let _ = self.run_round(RoundMode::Full).await;
                }

                Some(command) = command_rx.recv() => match command {
                    AgentCommand::Trigger { mode, reply } => {
                        let result = self.run_round(mode).await;
                        if reply.send(result).is_err() {
                            debug!("Trigger caller went away before the round finished");
                        }
                    }
                },

                _ = shutdown_rx.recv() => {
                    info!("Sync agent received shutdown");
                    break;
                }
            }
        }

        self.status.write().await.running = false;
        info!("Sync agent stopped");
    }

    async fn run_round(&self, mode: RoundMode) -> SyncResult<RoundReport> {
        self.status.write().await.round_in_progress = true;
        let result = self.engine.run_round(mode).await;

        {
            let mut status = self.status.write().await;
            status.round_in_progress = false;
            match &result {
                Ok(report) => {
                    status.rounds_completed += 1;
                    status.last_round_at = Some(report.finished_at);
                    status.last_outcome = None;
                    status.last_error = None;
                }
                Err(e) => {
                    status.last_outcome = Some(e.outcome_label().to_string());
                    status.last_error = Some(e.to_string());
                }
            }
        }

        match &result {
            Ok(report) => self.emitter.emit_round(report),
            Err(e) => self.emitter.emit_error(&e.to_string(), e.is_retryable()),
        }

        match self.engine.health().await {
            Ok(health) => {
                self.emitter.emit_health(&health);
                self.status.write().await.health = Some(health);
            }
            Err(e) => warn!(error = %e, "Failed to derive sync health"),
        }

        result
    }
}

// =============================================================================
// Agent Handle (for external control)
// =============================================================================

/// Handle for controlling a running [`SyncAgent`].
pub struct SyncAgentHandle {
    command_tx: mpsc::Sender<AgentCommand>,
    shutdown_tx: mpsc::Sender<()>,
    status: Arc<RwLock<AgentStatus>>,
    task: JoinHandle<()>,
}

impl SyncAgentHandle {
    /// Runs a round now and waits for its result.
    pub async fn trigger(&self, mode: RoundMode) -> SyncResult<RoundReport> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(AgentCommand::Trigger { mode, reply })
            .await
            .map_err(|_| SyncError::ShuttingDown)?;
        rx.await
            .map_err(|_| SyncError::ChannelError("agent dropped the round reply".into()))?
    }

    /// Gets the current agent status.
    pub async fn status(&self) -> AgentStatus {
        self.status.read().await.clone()
    }

    /// Signals the agent to stop after the current round and waits for it.
    pub async fn shutdown(self) -> SyncResult<()> {
        let _ = self.shutdown_tx.send(()).await;
        self.task
            .await
            .map_err(|e| SyncError::Internal(format!("sync agent task failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::folder::MemoryFolder;
    use crate::store::MemoryStore;
    use std::sync::Mutex;
    use wiredpart_core::Fields;

    #[derive(Default)]
    struct RecordingEmitter {
        events: Mutex<Vec<String>>,
    }

    impl SyncEventEmitter for RecordingEmitter {
        fn emit_round(&self, report: &RoundReport) {
            self.events.lock().unwrap().push(format!("round:{}", report.mode));
        }
        fn emit_health(&self, health: &SyncHealth) {
            self.events.lock().unwrap().push(format!("health:{}", health.state.label()));
        }
        fn emit_error(&self, _message: &str, retryable: bool) {
            self.events.lock().unwrap().push(format!("error:{retryable}"));
        }
    }

    fn engine(folder: &MemoryFolder, store: &MemoryStore) -> Arc<SyncEngine> {
        let mut config = SyncConfig::for_folder("/shared");
        config.sync.tables = vec!["parts".into()];
        Arc::new(SyncEngine::new(
            config,
            Arc::new(folder.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        ))
    }

    #[tokio::test]
    async fn test_trigger_runs_round_and_emits() {
        let folder = MemoryFolder::new();
        let store = MemoryStore::with_device_id("dev-a");
        store
            .upsert_local("parts", "P-1", Fields::new(), Utc::now() - chrono::Duration::seconds(1))
            .await;

        let emitter = Arc::new(RecordingEmitter::default());
        let handle = SyncAgent::with_emitter(engine(&folder, &store), emitter.clone()).spawn();

        let report = handle.trigger(RoundMode::PublishOnly).await.unwrap();
        assert_eq!(report.mode, RoundMode::PublishOnly);

        let status = handle.status().await;
        assert!(status.running);
        assert!(status.rounds_completed >= 1);
        assert!(status.health.is_some());

        handle.shutdown().await.unwrap();
        let events = emitter.events.lock().unwrap().clone();
        assert!(events.contains(&"round:publish-only".to_string()));
        assert!(events.iter().any(|e| e.starts_with("health:")));
    }

    #[tokio::test]
    async fn test_failed_round_updates_status() {
        let folder = MemoryFolder::new();
        folder.set_online(false);
        let store = MemoryStore::with_device_id("dev-a");

        let emitter = Arc::new(RecordingEmitter::default());
        let handle = SyncAgent::with_emitter(engine(&folder, &store), emitter.clone()).spawn();

        let err = handle.trigger(RoundMode::Full).await.unwrap_err();
        assert!(err.is_offline());

        let status = handle.status().await;
        assert_eq!(status.last_outcome.as_deref(), Some("offline"));
        assert_eq!(status.health.map(|h| h.state), Some(wiredpart_core::HealthState::Offline));

        handle.shutdown().await.unwrap();
        assert!(emitter.events.lock().unwrap().contains(&"error:true".to_string()));
    }

    #[tokio::test]
    async fn test_trigger_after_shutdown_fails() {
        let folder = MemoryFolder::new();
        let store = MemoryStore::with_device_id("dev-a");
        let handle = SyncAgent::new(engine(&folder, &store)).spawn();

        let _ = handle.shutdown_tx.send(()).await;
        // Wait for the task to observe shutdown.
        while handle.status().await.running || !handle.task.is_finished() {
            tokio::task::yield_now().await;
        }
        let err = handle.trigger(RoundMode::Full).await.unwrap_err();
        assert!(matches!(err, SyncError::ShuttingDown));
    }
}
