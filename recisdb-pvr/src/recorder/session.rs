//! One recording: prepare the stream, write it to disk, finalize.
//!
//! ```text
//! Idle -> Preparing -> Recording -> Finished
//!             |            |
//!             +------------+-----> Abandoned
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use log::{debug, error, info, warn};
use pvr_types::{Program, Reservation};
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;

use super::path::{format_file_name, prepare_destination};
use crate::database::{NewRecording, ProgramSource, RecordedStore};
use crate::encode::{EncodeManager, EncodeRequest};
use crate::event::{EventBus, PvrEvent};
use crate::reserve::store::RESYNC_RETRY;
use crate::reserve::ReservationStore;
use crate::tuner::{TunerSource, TunerStream};

/// Recorder timing and priority settings.
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub directory: PathBuf,
    /// Extension of recorded files, with the leading dot.
    pub file_extension: String,
    /// Source priority for ordinary reservations.
    pub normal_priority: i32,
    /// Source priority for reservations flagged as conflicting.
    pub conflict_priority: i32,
    pub check_interval: Duration,
    pub pre_roll: Duration,
    /// Total stream acquisition attempts.
    pub prep_retry_count: u32,
    pub prep_retry_delay: Duration,
    pub first_byte_timeout: Duration,
    /// Pool priority of encode jobs pushed after a recording.
    pub encode_priority: i32,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("recorded"),
            file_extension: ".m2ts".to_string(),
            normal_priority: 2,
            conflict_priority: 1,
            check_interval: Duration::from_secs(3),
            pre_roll: Duration::from_secs(15),
            prep_retry_count: 3,
            prep_retry_delay: Duration::from_secs(5),
            first_byte_timeout: Duration::from_secs(5),
            encode_priority: 0,
        }
    }
}

/// Collaborators shared by every session.
pub struct SessionContext {
    pub store: Arc<ReservationStore>,
    pub source: Arc<dyn TunerSource>,
    pub recorded: Arc<dyn RecordedStore>,
    pub programs: Arc<dyn ProgramSource>,
    pub events: Arc<EventBus>,
    pub encoder: Option<Arc<EncodeManager>>,
    pub settings: RecorderSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Preparing,
    Recording,
    Finalizing,
}

/// Externally visible state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub path: Option<PathBuf>,
    pub recorded_id: Option<i64>,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Finished { recorded_id: i64 },
    Abandoned(String),
}

pub struct RecordingSession {
    reserve: Reservation,
    ctx: Arc<SessionContext>,
    status: Arc<Mutex<SessionStatus>>,
    stop_rx: mpsc::Receiver<()>,
}

impl RecordingSession {
    pub fn new(
        reserve: Reservation,
        ctx: Arc<SessionContext>,
        status: Arc<Mutex<SessionStatus>>,
        stop_rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            reserve,
            ctx,
            status,
            stop_rx,
        }
    }

    fn update_status<F: FnOnce(&mut SessionStatus)>(&self, update: F) {
        update(&mut self.status.lock().unwrap_or_else(|e| e.into_inner()));
    }

    pub async fn run(mut self) -> SessionOutcome {
        let program_id = self.reserve.program_id();
        self.ctx.events.emit(PvrEvent::RecordingPreparing {
            reserve: self.reserve.clone(),
        });

        let stream = match self.prepare().await {
            Ok(Some(stream)) => stream,
            Ok(None) => return SessionOutcome::Abandoned("stopped during preparation".to_string()),
            Err(reason) => {
                error!("RecordingSession[{}]: preparation failed: {}", program_id, reason);
                if let Err(e) = self.ctx.store.cancel(program_id).await {
                    warn!("RecordingSession[{}]: cancel failed: {}", program_id, e);
                }
                self.ctx.events.emit(PvrEvent::RecordingPrepFailed {
                    reserve: self.reserve.clone(),
                    reason: reason.clone(),
                });
                return SessionOutcome::Abandoned(reason);
            }
        };

        // The reservation may have been cancelled while negotiating.
        if self.ctx.store.reserve(program_id).is_none() {
            info!(
                "RecordingSession[{}]: reservation gone after preparation, discarding stream",
                program_id
            );
            return SessionOutcome::Abandoned("reservation removed".to_string());
        }

        self.record(stream).await
    }

    /// Acquire the stream, retrying on failure. `Ok(None)` means stopped.
    async fn prepare(&mut self) -> Result<Option<TunerStream>, String> {
        let settings = &self.ctx.settings;
        let priority = if self.reserve.is_conflict {
            settings.conflict_priority
        } else {
            settings.normal_priority
        };
        let attempts = settings.prep_retry_count.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let open = self.ctx.source.open_program(&self.reserve.program, priority);
            tokio::select! {
                result = open => match result {
                    Ok(stream) => return Ok(Some(stream)),
                    Err(e) => {
                        warn!(
                            "RecordingSession[{}]: stream attempt {}/{} failed: {}",
                            self.reserve.program_id(), attempt, attempts, e
                        );
                        last_error = e.to_string();
                    }
                },
                Some(()) = self.stop_rx.recv() => return Ok(None),
            }

            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(settings.prep_retry_delay) => {}
                    Some(()) = self.stop_rx.recv() => return Ok(None),
                }
            }
        }
        Err(last_error)
    }

    async fn record(mut self, mut stream: TunerStream) -> SessionOutcome {
        let program_id = self.reserve.program_id();
        let path = match self.destination().await {
            Ok(path) => path,
            Err(e) => return self.abandon(format!("cannot prepare destination: {}", e)),
        };
        self.update_status(|s| {
            s.phase = SessionPhase::Recording;
            s.path = Some(path.clone());
        });

        let file = match tokio::fs::File::create(&path).await {
            Ok(file) => file,
            Err(e) => return self.abandon(format!("cannot create {:?}: {}", path, e)),
        };
        let mut writer = BufWriter::new(file);

        let first_byte_timeout = self.ctx.settings.first_byte_timeout;
        let first = tokio::select! {
            first = tokio::time::timeout(first_byte_timeout, stream.next()) => Some(first),
            Some(()) = self.stop_rx.recv() => None,
        };
        let Some(first) = first else {
            drop(stream);
            drop(writer);
            remove_partial(&path).await;
            return SessionOutcome::Abandoned("stopped before first byte".to_string());
        };
        let first = match first {
            Ok(Some(Ok(chunk))) => chunk,
            other => {
                let reason = match other {
                    Err(_) => "no data within first-byte timeout".to_string(),
                    Ok(Some(Err(e))) => format!("stream error before first byte: {}", e),
                    _ => "stream ended before first byte".to_string(),
                };
                drop(stream);
                drop(writer);
                remove_partial(&path).await;
                return self.abandon(reason);
            }
        };

        let recording = NewRecording {
            program: self.reserve.program.clone(),
            rule_id: self.reserve.rule_id(),
            file_path: path.clone(),
        };
        let recorded_id = match self.ctx.recorded.insert_recording(&recording).await {
            Ok(id) => id,
            Err(e) => {
                drop(stream);
                drop(writer);
                remove_partial(&path).await;
                return self.abandon(format!("cannot insert recorded entry: {}", e));
            }
        };
        self.update_status(|s| s.recorded_id = Some(recorded_id));
        info!(
            "RecordingSession[{}]: recording {:?} as recorded {}",
            program_id, path, recorded_id
        );
        self.ctx.events.emit(PvrEvent::RecordingStarted {
            recorded_id,
            reserve: self.reserve.clone(),
            path: path.clone(),
        });

        let mut written = first.len() as u64;
        let mut write_result = writer.write_all(&first).await;
        while write_result.is_ok() {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(Ok(chunk)) => {
                        written += chunk.len() as u64;
                        write_result = writer.write_all(&chunk).await;
                    }
                    Some(Err(e)) => {
                        warn!("RecordingSession[{}]: stream error: {}", program_id, e);
                        break;
                    }
                    None => break,
                },
                Some(()) = self.stop_rx.recv() => {
                    info!("RecordingSession[{}]: stop requested", program_id);
                    break;
                }
            }
        }
        drop(stream);
        if let Err(e) = write_result {
            error!("RecordingSession[{}]: write to {:?} failed: {}", program_id, path, e);
        }
        if let Err(e) = writer.flush().await {
            error!("RecordingSession[{}]: flush failed: {}", program_id, e);
        }
        debug!("RecordingSession[{}]: {} bytes received", program_id, written);

        self.finalize(recorded_id, &path).await
    }

    async fn destination(&self) -> std::io::Result<PathBuf> {
        let option = self.reserve.option.as_ref();
        let dir = match option.and_then(|o| o.directory.as_deref()) {
            Some(sub) => self.ctx.settings.directory.join(sub),
            None => self.ctx.settings.directory.clone(),
        };
        let stem = format_file_name(
            &self.reserve.program,
            option.and_then(|o| o.recorded_format.as_deref()),
        );
        prepare_destination(&dir, &stem, &self.ctx.settings.file_extension).await
    }

    async fn finalize(self, recorded_id: i64, path: &Path) -> SessionOutcome {
        let program_id = self.reserve.program_id();
        self.update_status(|s| s.phase = SessionPhase::Finalizing);
        let ctx = &self.ctx;

        if let Err(e) = ctx.recorded.mark_not_recording(recorded_id).await {
            error!("RecordingSession[{}]: mark_not_recording failed: {}", program_id, e);
        }

        let program = match ctx.programs.find_program(program_id).await {
            Ok(Some(latest)) => {
                if let Err(e) = ctx.recorded.update_metadata(recorded_id, &latest).await {
                    warn!("RecordingSession[{}]: metadata update failed: {}", program_id, e);
                }
                latest
            }
            Ok(None) => self.reserve.program.clone(),
            Err(e) => {
                warn!("RecordingSession[{}]: program lookup failed: {}", program_id, e);
                self.reserve.program.clone()
            }
        };

        match tokio::fs::metadata(path).await {
            Ok(meta) => {
                if let Err(e) = ctx.recorded.update_file_size(recorded_id, meta.len()).await {
                    warn!("RecordingSession[{}]: file size update failed: {}", program_id, e);
                }
            }
            Err(e) => warn!("RecordingSession[{}]: cannot stat {:?}: {}", program_id, path, e),
        }

        let exists = ctx.recorded.exists(recorded_id).await.unwrap_or_else(|e| {
            warn!("RecordingSession[{}]: exists check failed: {}", program_id, e);
            true
        });
        if !exists {
            warn!(
                "RecordingSession[{}]: recorded {} was deleted during recording",
                program_id, recorded_id
            );
            ctx.events.emit(PvrEvent::RecordingFinished {
                recorded_id,
                program: None,
                path: path.to_path_buf(),
                encode: None,
            });
            return SessionOutcome::Finished { recorded_id };
        }

        info!("RecordingSession[{}]: finished {:?}", program_id, path);
        ctx.events.emit(PvrEvent::RecordingFinished {
            recorded_id,
            program: Some(program.clone()),
            path: path.to_path_buf(),
            encode: self.reserve.encode.clone(),
        });

        if let Err(e) = ctx
            .recorded
            .append_history(&program.name, program.channel_id, program.end_at)
            .await
        {
            warn!("RecordingSession[{}]: history append failed: {}", program_id, e);
        }

        if let Some(rule_id) = self.reserve.rule_id() {
            if let Err(e) = ctx.store.update_rule(rule_id).await {
                warn!(
                    "RecordingSession[{}]: rule {} resync failed, retrying: {}",
                    program_id, rule_id, e
                );
                let store = Arc::clone(&ctx.store);
                tokio::spawn(async move {
                    tokio::time::sleep(RESYNC_RETRY).await;
                    store.update_rule_until_done(rule_id).await;
                });
            }
        }

        self.push_encodes(recorded_id, path, program);
        SessionOutcome::Finished { recorded_id }
    }

    /// One job per requested mode; only the last carries `del_ts`.
    fn push_encodes(&self, recorded_id: i64, path: &Path, program: Program) {
        let (Some(encoder), Some(option)) = (&self.ctx.encoder, &self.reserve.encode) else {
            return;
        };
        let last = option.modes.len().saturating_sub(1);
        for (index, mode) in option.modes.iter().enumerate() {
            let request = EncodeRequest {
                recorded_id,
                source: path.to_path_buf(),
                mode: mode.mode.clone(),
                directory: mode.directory.clone(),
                priority: self.ctx.settings.encode_priority,
                del_ts: option.del_ts && index == last,
                program: Some(program.clone()),
            };
            if let Err(e) = encoder.push(request) {
                warn!("RecordingSession[{}]: encode not queued: {}", program.id, e);
            }
        }
    }

    fn abandon(&self, reason: String) -> SessionOutcome {
        error!(
            "RecordingSession[{}]: recording failed: {}",
            self.reserve.program_id(),
            reason
        );
        self.ctx.events.emit(PvrEvent::RecordingError {
            reserve: self.reserve.clone(),
            reason: reason.clone(),
        });
        SessionOutcome::Abandoned(reason)
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("RecordingSession: cannot remove {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::database::{self, RecordedStore};
    use crate::reserve::store::tests::{program, rule, FakePrograms, FUTURE};
    use crate::reserve::ReserveFile;
    use crate::tuner::{SourceError, TunerDevice};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use pvr_types::{ChannelType, ManualReserveRequest, ReserveKind};
    use std::collections::HashMap;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// What the fake source hands out.
    pub(crate) enum FakeStream {
        Chunks(Vec<&'static [u8]>),
        /// Never yields.
        Silent,
        /// Yields chunks pushed through the sender.
        Channel(Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>),
        Fail,
    }

    pub(crate) struct FakeSource {
        pub stream: FakeStream,
        pub opened: AtomicUsize,
        pub priorities: Mutex<Vec<i32>>,
    }

    impl FakeSource {
        pub fn new(stream: FakeStream) -> Arc<Self> {
            Arc::new(Self {
                stream,
                opened: AtomicUsize::new(0),
                priorities: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TunerSource for FakeSource {
        async fn open_program(
            &self,
            _program: &Program,
            priority: i32,
        ) -> Result<TunerStream, SourceError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.priorities.lock().unwrap().push(priority);
            match &self.stream {
                FakeStream::Chunks(chunks) => {
                    let items: Vec<io::Result<Bytes>> = chunks
                        .iter()
                        .map(|c| Ok(Bytes::from_static(c)))
                        .collect();
                    Ok(Box::pin(stream::iter(items)))
                }
                FakeStream::Silent => Ok(Box::pin(stream::pending::<io::Result<Bytes>>())),
                FakeStream::Channel(rx) => {
                    let rx = rx
                        .lock()
                        .unwrap()
                        .take()
                        .ok_or_else(|| SourceError::Unavailable("busy".to_string()))?;
                    Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
                        rx.recv().await.map(|b| (Ok::<_, io::Error>(b), rx))
                    })))
                }
                FakeStream::Fail => Err(SourceError::Unavailable("no tuner".to_string())),
            }
        }

        async fn open_channel(
            &self,
            _channel_type: ChannelType,
            _channel: &str,
            _priority: i32,
        ) -> Result<TunerStream, SourceError> {
            Err(SourceError::Unavailable("not used".to_string()))
        }
    }

    #[derive(Debug, Clone, Default)]
    pub(crate) struct FakeRow {
        pub recording: bool,
        pub size: Option<u64>,
        pub name: String,
        pub path: PathBuf,
    }

    #[derive(Default)]
    pub(crate) struct FakeRecorded {
        pub rows: Mutex<HashMap<i64, FakeRow>>,
        pub history: Mutex<Vec<String>>,
        next: AtomicUsize,
    }

    #[async_trait]
    impl RecordedStore for FakeRecorded {
        async fn insert_recording(&self, recording: &NewRecording) -> database::Result<i64> {
            let id = self.next.fetch_add(1, Ordering::SeqCst) as i64 + 1;
            self.rows.lock().unwrap().insert(
                id,
                FakeRow {
                    recording: true,
                    size: None,
                    name: recording.program.name.clone(),
                    path: recording.file_path.clone(),
                },
            );
            Ok(id)
        }

        async fn mark_not_recording(&self, id: i64) -> database::Result<()> {
            self.with_row(id, |row| row.recording = false)
        }

        async fn update_metadata(&self, id: i64, program: &Program) -> database::Result<()> {
            self.with_row(id, |row| row.name = program.name.clone())
        }

        async fn update_file_size(&self, id: i64, size: u64) -> database::Result<()> {
            self.with_row(id, |row| row.size = Some(size))
        }

        async fn update_file_path(&self, id: i64, path: &Path) -> database::Result<()> {
            self.with_row(id, |row| row.path = path.to_path_buf())
        }

        async fn exists(&self, id: i64) -> database::Result<bool> {
            Ok(self.rows.lock().unwrap().contains_key(&id))
        }

        async fn delete(&self, id: i64) -> database::Result<()> {
            self.rows.lock().unwrap().remove(&id);
            Ok(())
        }

        async fn append_history(&self, name: &str, _channel_id: i64, _end_at: i64) -> database::Result<()> {
            self.history.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    impl FakeRecorded {
        fn with_row<F: FnOnce(&mut FakeRow)>(&self, id: i64, update: F) -> database::Result<()> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows
                .get_mut(&id)
                .ok_or(database::DatabaseError::RecordedNotFound(id))?;
            update(row);
            Ok(())
        }
    }

    pub(crate) struct Harness {
        pub dir: tempfile::TempDir,
        pub programs: Arc<FakePrograms>,
        pub ctx: Arc<SessionContext>,
        pub recorded: Arc<FakeRecorded>,
        pub source: Arc<FakeSource>,
        pub events: Arc<EventBus>,
    }

    /// Store holding one manual reservation for program 1 starting `start`.
    pub(crate) async fn harness(stream: FakeStream, start: i64) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let programs = FakePrograms::with_programs(vec![program(1, start, FUTURE)]);
        let events = EventBus::new();
        let store = Arc::new(ReservationStore::new(
            ReserveFile::new(dir.path().join("reserves.json")),
            Vec::new(),
            vec![TunerDevice::universal("t0")],
            programs.clone(),
            Arc::clone(&events),
        ));
        store
            .add_reserve(ManualReserveRequest {
                program_id: 1,
                option: None,
                encode: None,
            })
            .await
            .unwrap();

        let source = FakeSource::new(stream);
        let recorded = Arc::new(FakeRecorded::default());
        let settings = RecorderSettings {
            directory: dir.path().join("rec"),
            prep_retry_delay: Duration::from_millis(10),
            first_byte_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let ctx = Arc::new(SessionContext {
            store,
            source: source.clone(),
            recorded: recorded.clone(),
            programs: programs.clone(),
            events: Arc::clone(&events),
            encoder: None,
            settings,
        });
        Harness {
            dir,
            programs,
            ctx,
            recorded,
            source,
            events,
        }
    }

    fn session(h: &Harness) -> (RecordingSession, mpsc::Sender<()>) {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let reserve = h.ctx.store.reserve(1).unwrap();
        let status = Arc::new(Mutex::new(SessionStatus {
            phase: SessionPhase::Preparing,
            path: None,
            recorded_id: None,
        }));
        (
            RecordingSession::new(reserve, Arc::clone(&h.ctx), status, stop_rx),
            stop_tx,
        )
    }

    fn event_names(rx: &mut tokio::sync::broadcast::Receiver<PvrEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    #[tokio::test]
    async fn test_records_stream_to_file() {
        let h = harness(FakeStream::Chunks(vec![b"abc", b"def"]), FUTURE - 1000).await;
        let mut rx = h.events.receiver();
        let (session, _stop) = session(&h);

        let outcome = session.run().await;
        assert_eq!(outcome, SessionOutcome::Finished { recorded_id: 1 });

        let row = h.recorded.rows.lock().unwrap().get(&1).cloned().unwrap();
        assert!(!row.recording);
        assert_eq!(row.size, Some(6));
        assert_eq!(std::fs::read(&row.path).unwrap(), b"abcdef");
        assert!(row.path.starts_with(h.dir.path().join("rec")));
        assert_eq!(h.recorded.history.lock().unwrap().len(), 1);
        assert_eq!(
            event_names(&mut rx),
            vec!["recording_preparing", "recording_started", "recording_finished"]
        );
    }

    #[tokio::test]
    async fn test_first_byte_timeout_leaves_nothing() {
        let h = harness(FakeStream::Silent, FUTURE - 1000).await;
        let mut rx = h.events.receiver();
        let (session, _stop) = session(&h);

        let outcome = session.run().await;
        assert!(matches!(outcome, SessionOutcome::Abandoned(_)));
        assert!(h.recorded.rows.lock().unwrap().is_empty());
        let leftover = std::fs::read_dir(h.dir.path().join("rec")).unwrap().count();
        assert_eq!(leftover, 0);
        assert_eq!(event_names(&mut rx), vec!["recording_preparing", "recording_error"]);
        // Reservation itself is untouched.
        assert!(h.ctx.store.reserve(1).is_some());
    }

    #[tokio::test]
    async fn test_prep_failure_cancels_reservation() {
        let h = harness(FakeStream::Fail, FUTURE - 1000).await;
        let mut rx = h.events.receiver();
        let (session, _stop) = session(&h);

        let outcome = session.run().await;
        assert!(matches!(outcome, SessionOutcome::Abandoned(_)));
        assert_eq!(h.source.opened.load(Ordering::SeqCst), 3);
        assert!(h.ctx.store.reserve(1).is_none());
        assert_eq!(
            event_names(&mut rx),
            vec!["recording_preparing", "recording_prep_failed"]
        );
    }

    #[tokio::test]
    async fn test_reservation_cancelled_during_prep() {
        let h = harness(FakeStream::Chunks(vec![b"abc"]), FUTURE - 1000).await;
        let (session, _stop) = session(&h);
        h.ctx.store.cancel(1).await.unwrap();

        let outcome = session.run().await;
        assert_eq!(
            outcome,
            SessionOutcome::Abandoned("reservation removed".to_string())
        );
        assert!(h.recorded.rows.lock().unwrap().is_empty());
        assert!(!h.dir.path().join("rec").exists());
    }

    #[tokio::test]
    async fn test_stop_finalizes_gracefully() {
        let (tx, rx) = mpsc::unbounded_channel();
        let h = harness(FakeStream::Channel(Mutex::new(Some(rx))), FUTURE - 1000).await;
        let (session, stop) = session(&h);
        let task = tokio::spawn(session.run());

        tx.send(Bytes::from_static(b"xyz")).unwrap();
        while h.recorded.rows.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop.send(()).await.unwrap();

        assert_eq!(task.await.unwrap(), SessionOutcome::Finished { recorded_id: 1 });
        let row = h.recorded.rows.lock().unwrap().get(&1).cloned().unwrap();
        assert!(!row.recording);
        assert_eq!(row.size, Some(3));
    }

    #[tokio::test]
    async fn test_row_deleted_mid_recording_reports_null_program() {
        let (tx, rx) = mpsc::unbounded_channel();
        let h = harness(FakeStream::Channel(Mutex::new(Some(rx))), FUTURE - 1000).await;
        let mut events = h.events.receiver();
        let (session, _stop) = session(&h);
        let task = tokio::spawn(session.run());

        tx.send(Bytes::from_static(b"xyz")).unwrap();
        while h.recorded.rows.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.recorded.rows.lock().unwrap().clear();
        drop(tx);

        task.await.unwrap();
        let mut finished = None;
        while let Ok(event) = events.try_recv() {
            if let PvrEvent::RecordingFinished { program, .. } = event {
                finished = Some(program);
            }
        }
        assert_eq!(finished, Some(None));
        assert!(h.recorded.history.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conflict_priority_is_used() {
        let h = harness(FakeStream::Chunks(vec![b"a"]), FUTURE - 1000).await;
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let mut reserve = h.ctx.store.reserve(1).unwrap();
        reserve.is_conflict = true;
        let status = Arc::new(Mutex::new(SessionStatus {
            phase: SessionPhase::Preparing,
            path: None,
            recorded_id: None,
        }));
        RecordingSession::new(reserve, Arc::clone(&h.ctx), status, stop_rx)
            .run()
            .await;
        drop(stop_tx);
        assert_eq!(*h.source.priorities.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_rule_resync_after_recording_is_retried() {
        let h = harness(FakeStream::Chunks(vec![b"abc"]), FUTURE - 1000).await;
        h.programs.set_rule(rule(6), Vec::new());
        h.programs.fail_next(1);

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let mut reserve = h.ctx.store.reserve(1).unwrap();
        reserve.kind = ReserveKind::Rule {
            rule_id: 6,
            is_overlap: false,
            disable_overlap: false,
        };
        let status = Arc::new(Mutex::new(SessionStatus {
            phase: SessionPhase::Preparing,
            path: None,
            recorded_id: None,
        }));
        let outcome = RecordingSession::new(reserve, Arc::clone(&h.ctx), status, stop_rx)
            .run()
            .await;
        drop(stop_tx);
        assert_eq!(outcome, SessionOutcome::Finished { recorded_id: 1 });
        assert_eq!(h.programs.find_rule_calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(RESYNC_RETRY + Duration::from_millis(500)).await;
        assert_eq!(h.programs.find_rule_calls.load(Ordering::SeqCst), 2);
    }
}
