//! Single-flight FIFO dispatcher in front of the encoder pool.
//!
//! Jobs are queued in push order and run one at a time. A job marked
//! `del_ts` deletes the recorded source once it concludes; cancelling such
//! a job hands the flag to the next job for the same recording so exactly
//! one job keeps it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use pvr_types::Program;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::command::{build_process, CommandContext};
use super::pool::{EncodeProcessPool, ProcessExit, ProcessKiller};
use crate::event::{EventBus, PvrEvent};
use crate::recorder::path::unique_path;

/// Default delay before a failed job's partial output is removed.
pub const DEFAULT_ERROR_GRACE: Duration = Duration::from_millis(1000);

fn default_rate() -> f64 {
    4.0
}

/// A configured encode mode.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EncodeMode {
    pub name: String,
    /// Command template with `%INPUT%` and `%OUTPUT%` placeholders.
    pub cmd: String,
    /// Output file suffix such as `.mp4`. `None` runs the command in place.
    #[serde(default)]
    pub suffix: Option<String>,
    /// Timeout multiplier applied to the program duration.
    #[serde(default = "default_rate")]
    pub rate: f64,
}

/// Dispatcher errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Unknown encode mode: {0}")]
    UnknownMode(String),

    #[error("Encode job not found: {0}")]
    NotFound(u64),
}

/// A job as submitted by the recorder or an API caller.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub recorded_id: i64,
    pub source: PathBuf,
    pub mode: String,
    /// Output directory, relative to the encode directory.
    pub directory: Option<String>,
    pub priority: i32,
    pub del_ts: bool,
    pub program: Option<Program>,
}

#[derive(Debug, Clone)]
struct EncodeJob {
    id: u64,
    request: EncodeRequest,
    mode: EncodeMode,
}

struct Running {
    job: EncodeJob,
    stopped: bool,
    killer: Option<ProcessKiller>,
}

#[derive(Default)]
struct DispatchState {
    queue: VecDeque<EncodeJob>,
    running: Option<Running>,
}

impl DispatchState {
    /// Move a cancelled job's `del_ts` to the next job for the same recording.
    fn hand_over_del_ts(&mut self, recorded_id: i64) {
        if let Some(next) = self
            .queue
            .iter_mut()
            .find(|j| j.request.recorded_id == recorded_id)
        {
            next.request.del_ts = true;
            return;
        }
        if let Some(running) = self
            .running
            .as_mut()
            .filter(|r| !r.stopped && r.job.request.recorded_id == recorded_id)
        {
            running.job.request.del_ts = true;
        }
    }
}

/// Summary of one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodeJobInfo {
    pub id: u64,
    pub recorded_id: i64,
    pub mode: String,
    pub source: PathBuf,
    pub del_ts: bool,
}

impl From<&EncodeJob> for EncodeJobInfo {
    fn from(job: &EncodeJob) -> Self {
        Self {
            id: job.id,
            recorded_id: job.request.recorded_id,
            mode: job.mode.name.clone(),
            source: job.request.source.clone(),
            del_ts: job.request.del_ts,
        }
    }
}

/// In-flight job plus the queue, in dispatch order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodeInfo {
    pub running: Option<EncodeJobInfo>,
    pub queue: Vec<EncodeJobInfo>,
}

/// Encode dispatcher.
pub struct EncodeManager {
    pool: Arc<EncodeProcessPool>,
    modes: Vec<EncodeMode>,
    directory: Option<PathBuf>,
    error_grace: Duration,
    events: Arc<EventBus>,
    state: Mutex<DispatchState>,
    next_id: AtomicU64,
}

impl EncodeManager {
    pub fn new(
        pool: Arc<EncodeProcessPool>,
        modes: Vec<EncodeMode>,
        directory: Option<PathBuf>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Self::with_error_grace(pool, modes, directory, events, DEFAULT_ERROR_GRACE)
    }

    pub fn with_error_grace(
        pool: Arc<EncodeProcessPool>,
        modes: Vec<EncodeMode>,
        directory: Option<PathBuf>,
        events: Arc<EventBus>,
        error_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            modes,
            directory,
            error_grace,
            events,
            state: Mutex::new(DispatchState::default()),
            next_id: AtomicU64::new(1),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a job and return its id.
    pub fn push(self: &Arc<Self>, request: EncodeRequest) -> Result<u64, EncodeError> {
        let mode = self
            .modes
            .iter()
            .find(|m| m.name == request.mode)
            .cloned()
            .ok_or_else(|| EncodeError::UnknownMode(request.mode.clone()))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        info!(
            "EncodeManager: queued job {} ({} for recorded {})",
            id, mode.name, request.recorded_id
        );
        self.state().queue.push_back(EncodeJob { id, request, mode });
        self.try_dispatch();
        Ok(id)
    }

    /// Snapshot of the in-flight job and the queue.
    pub fn info(&self) -> EncodeInfo {
        let state = self.state();
        EncodeInfo {
            running: state.running.as_ref().map(|r| EncodeJobInfo::from(&r.job)),
            queue: state.queue.iter().map(EncodeJobInfo::from).collect(),
        }
    }

    /// Cancel one job, queued or in flight.
    pub fn cancel(&self, id: u64) -> Result<(), EncodeError> {
        let mut state = self.state();
        Self::cancel_locked(&mut state, id)
    }

    /// Cancel every job for a recording. Returns how many were cancelled.
    pub fn cancel_by_recorded_id(&self, recorded_id: i64) -> usize {
        let mut state = self.state();
        let mut ids: Vec<u64> = state
            .queue
            .iter()
            .filter(|j| j.request.recorded_id == recorded_id)
            .map(|j| j.id)
            .collect();
        if let Some(running) = state
            .running
            .as_ref()
            .filter(|r| !r.stopped && r.job.request.recorded_id == recorded_id)
        {
            ids.push(running.job.id);
        }

        ids.iter()
            .filter(|id| Self::cancel_locked(&mut state, **id).is_ok())
            .count()
    }

    fn cancel_locked(state: &mut DispatchState, id: u64) -> Result<(), EncodeError> {
        if let Some(running) = state.running.as_mut().filter(|r| r.job.id == id) {
            if running.stopped {
                return Ok(());
            }
            info!("EncodeManager: stopping running job {}", id);
            running.stopped = true;
            if let Some(killer) = &running.killer {
                killer.kill();
            }
            if running.job.request.del_ts {
                running.job.request.del_ts = false;
                let recorded_id = running.job.request.recorded_id;
                state.hand_over_del_ts(recorded_id);
            }
            return Ok(());
        }

        let index = state
            .queue
            .iter()
            .position(|j| j.id == id)
            .ok_or(EncodeError::NotFound(id))?;
        let removed = state.queue.remove(index).ok_or(EncodeError::NotFound(id))?;
        info!("EncodeManager: removed queued job {}", id);
        if removed.request.del_ts {
            state.hand_over_del_ts(removed.request.recorded_id);
        }
        Ok(())
    }

    fn try_dispatch(self: &Arc<Self>) {
        let job = {
            let mut state = self.state();
            if state.running.is_some() {
                return;
            }
            let Some(job) = state.queue.pop_front() else {
                return;
            };
            state.running = Some(Running {
                job: job.clone(),
                stopped: false,
                killer: None,
            });
            job
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            // A panicking job must still free the slot.
            let runner = Arc::clone(&this);
            let attempt = job.clone();
            if let Err(e) = tokio::spawn(async move { runner.run(attempt).await }).await {
                this.emit_error(&job, format!("job aborted: {}", e));
            }
            this.state().running = None;
            this.try_dispatch();
        });
    }

    async fn run(&self, job: EncodeJob) {
        let request = &job.request;
        debug!("EncodeManager: dispatching job {}", job.id);

        if !tokio::fs::try_exists(&request.source).await.unwrap_or(false) {
            warn!(
                "EncodeManager: source {:?} for job {} is missing",
                request.source, job.id
            );
            self.emit_error(&job, format!("source not found: {}", request.source.display()));
            return;
        }

        let output = match &job.mode.suffix {
            Some(suffix) => match self.output_path(request, suffix).await {
                Ok(path) => Some(path),
                Err(e) => {
                    self.emit_error(&job, format!("cannot prepare output: {}", e));
                    return;
                }
            },
            None => None,
        };

        let ctx = CommandContext {
            job_id: job.id,
            recorded_id: request.recorded_id,
            mode: &job.mode.name,
            input: &request.source,
            output: output.as_deref(),
            program: request.program.as_ref(),
        };
        let Some(spec) = build_process(&job.mode.cmd, &ctx) else {
            self.emit_error(&job, format!("empty command for mode {}", job.mode.name));
            return;
        };

        let process = match self.pool.create(request.priority, spec).await {
            Ok(process) => process,
            Err(e) => {
                error!("EncodeManager: job {} could not start: {}", job.id, e);
                self.fail(&job, output.as_deref(), e.to_string()).await;
                return;
            }
        };

        let killer = process.killer();
        {
            let mut state = self.state();
            if let Some(running) = state.running.as_mut() {
                running.killer = Some(killer.clone());
                if running.stopped {
                    killer.kill();
                }
            }
        }

        let ceiling = request
            .program
            .as_ref()
            .and_then(|p| encode_ceiling(p.duration_ms(), job.mode.rate));
        let exit = process.wait();
        tokio::pin!(exit);
        let exit = tokio::select! {
            exit = &mut exit => exit,
            _ = wait_ceiling(ceiling) => {
                warn!("EncodeManager: job {} exceeded {:?}, killing", job.id, ceiling);
                killer.kill();
                exit.await
            }
        };

        let (stopped, del_ts) = {
            let state = self.state();
            state
                .running
                .as_ref()
                .map(|r| (r.stopped, r.job.request.del_ts))
                .unwrap_or((true, false))
        };

        if exit == ProcessExit::Success && !stopped {
            info!("EncodeManager: job {} finished", job.id);
            self.events.emit(PvrEvent::EncodeFinished {
                job_id: job.id,
                recorded_id: request.recorded_id,
                source: request.source.clone(),
                output,
                del_ts,
            });
        } else {
            let reason = if stopped {
                "stopped".to_string()
            } else {
                format!("encoder ended with {:?}", exit)
            };
            self.fail(&job, output.as_deref(), reason).await;
        }
    }

    async fn output_path(&self, request: &EncodeRequest, suffix: &str) -> std::io::Result<PathBuf> {
        let base = match &self.directory {
            Some(dir) => dir.clone(),
            None => request
                .source
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        };
        let dir = match &request.directory {
            Some(sub) => base.join(sub),
            None => base,
        };
        tokio::fs::create_dir_all(&dir).await?;

        let stem = request
            .source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("recorded-{}", request.recorded_id));
        unique_path(&dir, &stem, suffix).await
    }

    /// Remove any partial output after the grace delay and report the error.
    async fn fail(&self, job: &EncodeJob, output: Option<&Path>, reason: String) {
        if let Some(output) = output {
            tokio::time::sleep(self.error_grace).await;
            match tokio::fs::remove_file(output).await {
                Ok(()) => debug!("EncodeManager: removed partial output {:?}", output),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("EncodeManager: cannot remove {:?}: {}", output, e),
            }
        }
        self.emit_error(job, reason);
    }

    fn emit_error(&self, job: &EncodeJob, reason: String) {
        warn!("EncodeManager: job {} failed: {}", job.id, reason);
        self.events.emit(PvrEvent::EncodeError {
            job_id: job.id,
            recorded_id: job.request.recorded_id,
            reason,
        });
    }
}

/// `duration × rate`, or `None` when the product is not a valid duration.
fn encode_ceiling(duration_ms: i64, rate: f64) -> Option<Duration> {
    let secs = Duration::from_millis(duration_ms.max(0) as u64).as_secs_f64() * rate;
    Duration::try_from_secs_f64(secs).ok()
}

async fn wait_ceiling(ceiling: Option<Duration>) {
    match ceiling {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvr_types::ChannelType;

    fn mode(name: &str, cmd: &str, suffix: Option<&str>) -> EncodeMode {
        EncodeMode {
            name: name.to_string(),
            cmd: cmd.to_string(),
            suffix: suffix.map(str::to_string),
            rate: 4.0,
        }
    }

    fn request(recorded_id: i64, source: &Path, mode: &str, del_ts: bool) -> EncodeRequest {
        EncodeRequest {
            recorded_id,
            source: source.to_path_buf(),
            mode: mode.to_string(),
            directory: None,
            priority: 0,
            del_ts,
            program: None,
        }
    }

    /// Single-slot manager; the "sleep" mode holds the slot.
    fn blocked_manager() -> (Arc<EncodeManager>, Arc<EventBus>) {
        let events = EventBus::new();
        let manager = EncodeManager::with_error_grace(
            Arc::new(EncodeProcessPool::new(1)),
            vec![
                mode("sleep", "sleep 30", None),
                mode("copy", "cp %INPUT% %OUTPUT%", Some(".copy")),
            ],
            None,
            Arc::clone(&events),
            Duration::from_millis(10),
        );
        (manager, events)
    }

    #[tokio::test]
    async fn test_unknown_mode() {
        let (manager, _) = blocked_manager();
        assert_eq!(
            manager.push(request(1, Path::new("/x"), "nope", false)),
            Err(EncodeError::UnknownMode("nope".to_string()))
        );
    }

    #[tokio::test]
    async fn test_queued_cancel_moves_del_ts() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.m2ts");
        std::fs::write(&source, b"ts").unwrap();
        let (manager, _) = blocked_manager();

        let blocker = manager.push(request(9, &source, "sleep", false)).unwrap();
        let first = manager.push(request(1, &source, "copy", false)).unwrap();
        let last = manager.push(request(1, &source, "copy", true)).unwrap();
        let info = manager.info();
        assert_eq!(info.running.as_ref().map(|j| j.id), Some(blocker));
        assert_eq!(info.queue.len(), 2);

        manager.cancel(last).unwrap();
        let info = manager.info();
        assert_eq!(info.queue.len(), 1);
        assert_eq!(info.queue[0].id, first);
        assert!(info.queue[0].del_ts);

        assert_eq!(manager.cancel(last), Err(EncodeError::NotFound(last)));
        assert_eq!(manager.cancel_by_recorded_id(9), 1);
        assert_eq!(manager.cancel_by_recorded_id(1), 1);
    }

    #[tokio::test]
    async fn test_running_cancel_moves_del_ts_to_queue() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.m2ts");
        std::fs::write(&source, b"ts").unwrap();
        let (manager, events) = blocked_manager();
        let mut rx = events.receiver();

        let running = manager.push(request(2, &source, "sleep", true)).unwrap();
        let queued = manager.push(request(2, &source, "sleep", false)).unwrap();
        // Let the first job reach the pool.
        tokio::time::sleep(Duration::from_millis(200)).await;

        manager.cancel(running).unwrap();
        let info = manager.info();
        assert!(info.queue.iter().any(|j| j.id == queued && j.del_ts));

        match rx.recv().await.unwrap() {
            PvrEvent::EncodeError { job_id, reason, .. } => {
                assert_eq!(job_id, running);
                assert_eq!(reason, "stopped");
            }
            other => panic!("unexpected event {:?}", other),
        }
        manager.cancel(queued).unwrap();
    }

    #[tokio::test]
    async fn test_missing_source_emits_error_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.m2ts");
        std::fs::write(&source, b"ts").unwrap();
        let (manager, events) = blocked_manager();
        let mut rx = events.receiver();

        let missing = manager
            .push(request(1, &dir.path().join("gone.m2ts"), "copy", true))
            .unwrap();
        let present = manager.push(request(2, &source, "copy", true)).unwrap();

        match rx.recv().await.unwrap() {
            PvrEvent::EncodeError { job_id, .. } => assert_eq!(job_id, missing),
            other => panic!("unexpected event {:?}", other),
        }
        match rx.recv().await.unwrap() {
            PvrEvent::EncodeFinished {
                job_id,
                output,
                del_ts,
                ..
            } => {
                assert_eq!(job_id, present);
                assert!(del_ts);
                let output = output.unwrap();
                assert_eq!(output, dir.path().join("a.copy"));
                assert_eq!(std::fs::read(output).unwrap(), b"ts");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_job_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("b.m2ts");
        std::fs::write(&source, b"ts").unwrap();
        let events = EventBus::new();
        let mut rx = events.receiver();
        let manager = EncodeManager::with_error_grace(
            Arc::new(EncodeProcessPool::new(1)),
            vec![mode("fail", "sh -c \"echo x > '%OUTPUT%'; exit 3\"", Some(".out"))],
            None,
            Arc::clone(&events),
            Duration::from_millis(10),
        );

        manager.push(request(5, &source, "fail", false)).unwrap();
        match rx.recv().await.unwrap() {
            PvrEvent::EncodeError { recorded_id, .. } => assert_eq!(recorded_id, 5),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!dir.path().join("b.out").exists());
    }

    #[test]
    fn test_encode_ceiling() {
        assert_eq!(encode_ceiling(60_000, 2.0), Some(Duration::from_secs(120)));
        assert_eq!(encode_ceiling(60_000, f64::INFINITY), None);
        assert_eq!(encode_ceiling(60_000, f64::NAN), None);
        assert_eq!(encode_ceiling(60_000, 1e300), None);
        assert_eq!(encode_ceiling(60_000, -1.0), None);
    }

    #[tokio::test]
    async fn test_oversized_rate_does_not_wedge_queue() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("c.m2ts");
        std::fs::write(&source, b"ts").unwrap();
        let events = EventBus::new();
        let mut rx = events.receiver();
        let mut huge = mode("copy", "cp %INPUT% %OUTPUT%", Some(".copy"));
        huge.rate = f64::INFINITY;
        let manager = EncodeManager::with_error_grace(
            Arc::new(EncodeProcessPool::new(1)),
            vec![huge],
            None,
            Arc::clone(&events),
            Duration::from_millis(10),
        );

        let mut first = request(1, &source, "copy", false);
        first.program = Some(Program::new(1, 1, ChannelType::GR, "27", 0, 60_000, "program"));
        let first = manager.push(first).unwrap();
        let second = manager.push(request(2, &source, "copy", false)).unwrap();

        for expected in [first, second] {
            match rx.recv().await.unwrap() {
                PvrEvent::EncodeFinished { job_id, .. } => assert_eq!(job_id, expected),
                other => panic!("unexpected event {:?}", other),
            }
        }
        while manager.info().running.is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.info().queue.is_empty());
    }
}
