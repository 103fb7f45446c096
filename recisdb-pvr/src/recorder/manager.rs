//! Recording scheduler.
//!
//! Polls the reservation store and starts a [`RecordingSession`] for every
//! active reservation entering its pre-roll window. Sessions remove
//! themselves from the tracking table when they end; an hourly sweep drops
//! entries whose program ended long ago.
//!
//! A program whose session has concluded is not started again while it is
//! still airing, so a stopped or failed recording stays stopped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use pvr_types::Reservation;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::session::{RecordingSession, SessionContext, SessionPhase, SessionStatus};
use crate::database::RecordedStore;
use crate::event::{EventBus, PvrEvent};
use crate::reserve::now_ms;

/// Interval of the stale-session sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Sessions whose program ended longer ago than this are dropped.
pub const STALE_AFTER: Duration = Duration::from_secs(12 * 60 * 60);

struct TrackedSession {
    reserve: Reservation,
    status: Arc<Mutex<SessionStatus>>,
    stop_tx: mpsc::Sender<()>,
}

/// Summary of a tracked session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub program_id: i64,
    pub rule_id: Option<i64>,
    #[serde(flatten)]
    pub status: SessionStatus,
}

#[derive(Default)]
struct SchedulerState {
    sessions: HashMap<i64, TrackedSession>,
    /// Program id to end time of concluded sessions.
    concluded: HashMap<i64, i64>,
}

/// Recording scheduler.
pub struct RecordingManager {
    ctx: Arc<SessionContext>,
    state: Mutex<SchedulerState>,
}

impl RecordingManager {
    pub fn new(ctx: SessionContext) -> Arc<Self> {
        Arc::new(Self {
            ctx: Arc::new(ctx),
            state: Mutex::new(SchedulerState::default()),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start sessions for reservations entering the pre-roll window.
    /// Returns the program ids started.
    pub fn check(self: &Arc<Self>, now_ms: i64) -> Vec<i64> {
        let pre_roll = self.ctx.settings.pre_roll.as_millis() as i64;
        let reserves = self.ctx.store.reserves();
        let mut started = Vec::new();

        for reserve in reserves.iter() {
            if !reserve.is_active()
                || reserve.program.start_at - pre_roll > now_ms
                || reserve.program.end_at <= now_ms
            {
                continue;
            }
            {
                let state = self.state();
                let id = reserve.program_id();
                if state.sessions.contains_key(&id) || state.concluded.contains_key(&id) {
                    continue;
                }
            }
            self.start_session(reserve.clone());
            started.push(reserve.program_id());
        }
        started
    }

    fn start_session(self: &Arc<Self>, reserve: Reservation) {
        let program_id = reserve.program_id();
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let status = Arc::new(Mutex::new(SessionStatus {
            phase: SessionPhase::Preparing,
            path: None,
            recorded_id: None,
        }));

        let end_at = reserve.program.end_at;
        self.state().sessions.insert(
            program_id,
            TrackedSession {
                reserve: reserve.clone(),
                status: Arc::clone(&status),
                stop_tx,
            },
        );
        info!(
            "RecordingManager: preparing {} ({})",
            program_id, reserve.program.name
        );

        let session = RecordingSession::new(reserve, Arc::clone(&self.ctx), status, stop_rx);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = session.run().await;
            debug!("RecordingManager: session {} ended: {:?}", program_id, outcome);
            let mut state = this.state();
            state.sessions.remove(&program_id);
            state.concluded.insert(program_id, end_at);
        });
    }

    /// Whether a session exists for the program.
    pub fn is_recording(&self, program_id: i64) -> bool {
        self.state().sessions.contains_key(&program_id)
    }

    pub fn sessions_info(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .state()
            .sessions
            .values()
            .map(|s| SessionInfo {
                program_id: s.reserve.program_id(),
                rule_id: s.reserve.rule_id(),
                status: s.status.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            })
            .collect();
        infos.sort_by_key(|i| i.program_id);
        infos
    }

    /// Stop the session for a program. The recording is finalized normally.
    pub fn stop(&self, program_id: i64) -> bool {
        match self.state().sessions.get(&program_id) {
            Some(session) => {
                info!("RecordingManager: stopping {}", program_id);
                let _ = session.stop_tx.try_send(());
                true
            }
            None => false,
        }
    }

    /// Stop every session belonging to a rule. Returns how many were signalled.
    pub fn stop_by_rule(&self, rule_id: i64) -> usize {
        let state = self.state();
        let mut stopped = 0;
        for session in state
            .sessions
            .values()
            .filter(|s| s.reserve.rule_id() == Some(rule_id))
        {
            let _ = session.stop_tx.try_send(());
            stopped += 1;
        }
        if stopped > 0 {
            info!("RecordingManager: stopping {} session(s) of rule {}", stopped, rule_id);
        }
        stopped
    }

    /// Drop sessions whose program ended more than [`STALE_AFTER`] ago
    /// and forget concluded programs that are no longer airing.
    pub fn sweep_stale(&self, now_ms: i64) -> usize {
        let limit = now_ms - STALE_AFTER.as_millis() as i64;
        let mut state = self.state();
        state.concluded.retain(|_, end_at| *end_at > now_ms);
        let sessions = &mut state.sessions;
        let before = sessions.len();
        sessions.retain(|program_id, session| {
            let keep = session.reserve.program.end_at >= limit;
            if !keep {
                warn!("RecordingManager: dropping stale session {}", program_id);
                let _ = session.stop_tx.try_send(());
            }
            keep
        });
        before - sessions.len()
    }

    /// Spawn the periodic check and the stale-session sweep.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let check_interval = self.ctx.settings.check_interval;
        let this = Arc::clone(self);
        let checker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                this.check(now_ms());
            }
        });

        let this = Arc::clone(self);
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let dropped = this.sweep_stale(now_ms());
                if dropped > 0 {
                    info!("RecordingManager: swept {} stale session(s)", dropped);
                }
            }
        });

        info!(
            "RecordingManager: started (check every {:?}, pre-roll {:?})",
            check_interval, self.ctx.settings.pre_roll
        );
        vec![checker, sweeper]
    }
}

/// Apply encode results to recordings: when a concluding job carries
/// `del_ts`, the source TS is deleted and the recorded entry repointed to
/// the encoded file.
pub fn spawn_encode_listener(
    events: &EventBus,
    recorded: Arc<dyn RecordedStore>,
) -> JoinHandle<()> {
    let mut rx = events.receiver();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(PvrEvent::EncodeFinished {
                    recorded_id,
                    source,
                    output,
                    del_ts,
                    ..
                }) => {
                    if del_ts {
                        apply_del_ts(recorded.as_ref(), recorded_id, source, output).await;
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("RecordingManager: encode listener lagged by {} event(s)", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn apply_del_ts(
    recorded: &dyn RecordedStore,
    recorded_id: i64,
    source: PathBuf,
    output: Option<PathBuf>,
) {
    let Some(output) = output else {
        warn!(
            "RecordingManager: in-place encode of {:?} requested del_ts, keeping source",
            source
        );
        return;
    };

    if let Err(e) = recorded.update_file_path(recorded_id, &output).await {
        warn!(
            "RecordingManager: cannot repoint recorded {} to {:?}: {}",
            recorded_id, output, e
        );
        return;
    }
    match tokio::fs::remove_file(&source).await {
        Ok(()) => info!("RecordingManager: deleted source {:?}", source),
        Err(e) => warn!("RecordingManager: cannot delete {:?}: {}", source, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::session::tests::{harness, FakeRecorded, FakeStream};
    use crate::reserve::store::tests::FUTURE;

    #[tokio::test]
    async fn test_check_respects_pre_roll() {
        let now = now_ms();
        let h = harness(FakeStream::Silent, now + 60_000).await;
        let manager = RecordingManager::new(clone_ctx(&h));

        assert!(manager.check(now).is_empty());
        assert!(!manager.is_recording(1));

        // 10s before start is inside the 15s pre-roll.
        let started = manager.check(now + 50_000);
        assert_eq!(started, vec![1]);
        assert!(manager.is_recording(1));
        assert!(manager.check(now + 50_000).is_empty());
        assert_eq!(manager.sessions_info()[0].status.phase, SessionPhase::Preparing);
    }

    #[tokio::test]
    async fn test_failed_session_is_untracked() {
        let now = now_ms();
        let h = harness(FakeStream::Silent, now).await;
        let manager = RecordingManager::new(clone_ctx(&h));

        manager.check(now);
        assert!(manager.is_recording(1));
        // First-byte timeout in the harness is 200ms.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!manager.is_recording(1));
        assert!(h.recorded.rows.lock().unwrap().is_empty());

        // Not retried while the program is still airing.
        assert!(manager.check(now + 1_000).is_empty());
        manager.sweep_stale(FUTURE + 1);
        assert_eq!(manager.check(now + 1_000), vec![1]);
    }

    #[tokio::test]
    async fn test_cancelled_reservation_is_ignored() {
        let now = now_ms();
        let h = harness(FakeStream::Silent, now).await;
        let manager = RecordingManager::new(clone_ctx(&h));

        h.ctx.store.cancel(1).await.unwrap();
        assert!(manager.check(now).is_empty());
    }

    #[tokio::test]
    async fn test_stop_and_sweep() {
        let now = now_ms();
        let h = harness(FakeStream::Silent, now).await;
        let manager = RecordingManager::new(clone_ctx(&h));
        manager.check(now);

        assert!(manager.stop(1));
        assert!(!manager.stop(2));
        assert_eq!(manager.stop_by_rule(4), 0);

        // Program ends at FUTURE, so nothing is stale yet.
        assert_eq!(manager.sweep_stale(now), 0);
        let stale_now = FUTURE + STALE_AFTER.as_millis() as i64 + 1;
        assert_eq!(manager.sweep_stale(stale_now), 1);
        assert!(!manager.is_recording(1));
    }

    #[tokio::test]
    async fn test_del_ts_repoints_and_deletes_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.m2ts");
        let output = dir.path().join("a.mp4");
        std::fs::write(&source, b"ts").unwrap();
        std::fs::write(&output, b"mp4").unwrap();

        let recorded = Arc::new(FakeRecorded::default());
        let id = recorded
            .insert_recording(&crate::database::NewRecording {
                program: crate::reserve::store::tests::program(1, 0, 10),
                rule_id: None,
                file_path: source.clone(),
            })
            .await
            .unwrap();

        apply_del_ts(recorded.as_ref(), id, source.clone(), Some(output.clone())).await;
        assert!(!source.exists());
        assert_eq!(recorded.rows.lock().unwrap()[&id].path, output);

        // In-place modes keep the source.
        std::fs::write(&source, b"ts").unwrap();
        apply_del_ts(recorded.as_ref(), id, source.clone(), None).await;
        assert!(source.exists());
    }

    fn clone_ctx(h: &crate::recorder::session::tests::Harness) -> SessionContext {
        SessionContext {
            store: Arc::clone(&h.ctx.store),
            source: Arc::clone(&h.ctx.source),
            recorded: Arc::clone(&h.ctx.recorded),
            programs: Arc::clone(&h.ctx.programs),
            events: Arc::clone(&h.ctx.events),
            encoder: h.ctx.encoder.clone(),
            settings: h.ctx.settings.clone(),
        }
    }
}
