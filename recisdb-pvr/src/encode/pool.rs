//! Bounded pool of external encoder processes with priority preemption.
//!
//! # How It Works
//!
//! 1. A free slot is used immediately
//! 2. With every slot busy, the lowest-priority slot strictly below the
//!    requested priority is terminated and its exit awaited (bounded)
//! 3. Otherwise the request fails; the pool never queues
//!
//! Each spawned process gets its own [`EncodeProcess`] handle whose exit
//! future resolves exactly once.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};

/// Default bound on waiting for a preempted slot to exit.
pub const DEFAULT_PREEMPT_TIMEOUT: Duration = Duration::from_secs(3);

/// Time a terminated process gets before it is killed outright.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Pool errors returned to the caller of [`EncodeProcessPool::create`].
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("No free encoder slot and no lower-priority slot to preempt")]
    Capacity,

    #[error("Preempted encoder did not exit within {0:?}")]
    PreemptTimeout(Duration),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// A command to run in a slot.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// How a pooled process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited on its own with status 0.
    Success,
    /// Exited on its own with a non-zero status (`None` when killed by a
    /// foreign signal).
    Failed(Option<i32>),
    /// Terminated through the pool.
    Killed,
    /// Waiting on the process failed.
    Error(String),
}

impl ProcessExit {
    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            ProcessExit::Success
        } else {
            ProcessExit::Failed(status.code())
        }
    }
}

/// Identity of a slot. Never reused within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u64);

/// Cloneable handle to terminate a pooled process.
#[derive(Debug, Clone)]
pub struct ProcessKiller(mpsc::Sender<()>);

impl ProcessKiller {
    /// Request termination. Repeated calls are harmless.
    pub fn kill(&self) {
        let _ = self.0.try_send(());
    }
}

/// Handle to a running pooled process.
#[derive(Debug)]
pub struct EncodeProcess {
    slot: SlotId,
    pid: Option<u32>,
    killer: ProcessKiller,
    exit: oneshot::Receiver<ProcessExit>,
}

impl EncodeProcess {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn killer(&self) -> ProcessKiller {
        self.killer.clone()
    }

    /// Wait for the process to end.
    pub async fn wait(self) -> ProcessExit {
        self.exit
            .await
            .unwrap_or_else(|_| ProcessExit::Error("supervisor dropped".to_string()))
    }
}

/// Snapshot of one occupied slot.
#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub slot: SlotId,
    pub priority: i32,
    pub pid: Option<u32>,
    pub running_for: Duration,
}

struct Slot {
    id: SlotId,
    priority: i32,
    created_at: Instant,
    pid: Option<u32>,
    killer: ProcessKiller,
    exited: watch::Receiver<bool>,
}

/// Encoder process pool.
pub struct EncodeProcessPool {
    max_slots: usize,
    preempt_timeout: Duration,
    slots: Arc<Mutex<Vec<Slot>>>,
    next_slot: AtomicU64,
}

impl EncodeProcessPool {
    pub fn new(max_slots: usize) -> Self {
        Self {
            max_slots: max_slots.max(1),
            preempt_timeout: DEFAULT_PREEMPT_TIMEOUT,
            slots: Arc::new(Mutex::new(Vec::new())),
            next_slot: AtomicU64::new(1),
        }
    }

    pub fn with_preempt_timeout(mut self, timeout: Duration) -> Self {
        self.preempt_timeout = timeout;
        self
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    pub fn active(&self) -> usize {
        self.lock_slots().len()
    }

    pub fn slots(&self) -> Vec<SlotInfo> {
        self.lock_slots()
            .iter()
            .map(|s| SlotInfo {
                slot: s.id,
                priority: s.priority,
                pid: s.pid,
                running_for: s.created_at.elapsed(),
            })
            .collect()
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start `spec` at `priority`, preempting a lower-priority slot if the
    /// pool is full.
    pub async fn create(&self, priority: i32, spec: ProcessSpec) -> Result<EncodeProcess, PoolError> {
        let victim = {
            let mut slots = self.lock_slots();
            if slots.len() < self.max_slots {
                return self.spawn_into(&mut slots, priority, spec);
            }
            slots
                .iter()
                .filter(|s| s.priority < priority)
                .min_by_key(|s| (s.priority, s.created_at))
                .map(|s| (s.id, s.killer.clone(), s.exited.clone()))
        };

        let (victim_id, killer, mut exited) = victim.ok_or(PoolError::Capacity)?;
        info!(
            "EncodeProcessPool: preempting {:?} for priority {} job",
            victim_id, priority
        );
        killer.kill();

        // A closed channel also means the slot is gone.
        let wait = exited.wait_for(|done| *done);
        if tokio::time::timeout(self.preempt_timeout, wait).await.is_err() {
            warn!(
                "EncodeProcessPool: {:?} did not exit within {:?}",
                victim_id, self.preempt_timeout
            );
            return Err(PoolError::PreemptTimeout(self.preempt_timeout));
        }

        let mut slots = self.lock_slots();
        if slots.len() >= self.max_slots {
            // Another request claimed the freed slot first.
            return Err(PoolError::Capacity);
        }
        self.spawn_into(&mut slots, priority, spec)
    }

    fn spawn_into(
        &self,
        slots: &mut Vec<Slot>,
        priority: i32,
        spec: ProcessSpec,
    ) -> Result<EncodeProcess, PoolError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| PoolError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let id = SlotId(self.next_slot.fetch_add(1, Ordering::SeqCst));
        let pid = child.id();
        let (kill_tx, kill_rx) = mpsc::channel(1);
        let (exited_tx, exited_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = oneshot::channel();
        let killer = ProcessKiller(kill_tx);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain(stdout, id, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain(stderr, id, "stderr"));
        }

        slots.push(Slot {
            id,
            priority,
            created_at: Instant::now(),
            pid,
            killer: killer.clone(),
            exited: exited_rx,
        });
        debug!(
            "EncodeProcessPool: spawned {} as {:?} (pid {:?}, priority {})",
            spec.program, id, pid, priority
        );

        let all_slots = Arc::clone(&self.slots);
        tokio::spawn(async move {
            let outcome = supervise(&mut child, kill_rx).await;
            all_slots
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|s| s.id != id);
            debug!("EncodeProcessPool: {:?} ended: {:?}", id, outcome);
            let _ = exited_tx.send(true);
            let _ = exit_tx.send(outcome);
        });

        Ok(EncodeProcess {
            slot: id,
            pid,
            killer,
            exit: exit_rx,
        })
    }
}

async fn supervise(child: &mut Child, mut kill_rx: mpsc::Receiver<()>) -> ProcessExit {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => ProcessExit::from_status(status),
            Err(e) => ProcessExit::Error(e.to_string()),
        },
        Some(()) = kill_rx.recv() => {
            terminate(child).await;
            ProcessExit::Killed
        }
    }
}

/// SIGTERM, then SIGKILL once the grace window has passed.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            debug!("EncodeProcessPool: SIGTERM to pid {}", pid);
            if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
                && tokio::time::timeout(TERMINATE_GRACE, child.wait())
                    .await
                    .is_ok()
            {
                return;
            }
        }
    }

    if let Err(e) = child.kill().await {
        warn!("EncodeProcessPool: kill failed: {}", e);
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: R, slot: SlotId, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("EncodeProcessPool: {:?} {}: {}", slot, stream, line);
    }
}
