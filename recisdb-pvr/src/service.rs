//! Operations exposed to an API or UI layer.

use std::sync::Arc;

use log::info;
use pvr_types::{
    EncodeOption, ManualReserveRequest, Reservation, ReserveError, ReserveFilter, ReserveOption,
    ReservePage,
};

use crate::encode::{EncodeError, EncodeInfo, EncodeManager, EncodeRequest};
use crate::recorder::{RecordingManager, SessionInfo};
use crate::reserve::ReservationStore;

/// Facade over the reservation store, recorder and encoder.
#[derive(Clone)]
pub struct PvrService {
    store: Arc<ReservationStore>,
    recorder: Arc<RecordingManager>,
    encoder: Arc<EncodeManager>,
}

impl PvrService {
    pub fn new(
        store: Arc<ReservationStore>,
        recorder: Arc<RecordingManager>,
        encoder: Arc<EncodeManager>,
    ) -> Self {
        Self {
            store,
            recorder,
            encoder,
        }
    }

    // ---- Reservations -------------------------------------------------

    pub fn reserves(&self, filter: ReserveFilter, offset: usize, limit: Option<usize>) -> ReservePage {
        self.store.query(filter, offset, limit)
    }

    pub fn reserve(&self, program_id: i64) -> Option<Reservation> {
        self.store.reserve(program_id)
    }

    pub async fn add_reserve(&self, request: ManualReserveRequest) -> Result<Reservation, ReserveError> {
        self.store.add_reserve(request).await
    }

    /// Edit a manual reservation that is not being recorded.
    pub async fn edit_reserve(
        &self,
        program_id: i64,
        option: Option<ReserveOption>,
        encode: Option<EncodeOption>,
    ) -> Result<Reservation, ReserveError> {
        let recorder = &self.recorder;
        self.store
            .edit_reserve(program_id, option, encode, |id| recorder.is_recording(id))
            .await
    }

    /// Cancel a reservation and stop its recording if one is running.
    pub async fn cancel_reserve(&self, program_id: i64) -> Result<(), ReserveError> {
        self.store.cancel(program_id).await?;
        if self.recorder.stop(program_id) {
            info!("PvrService: cancelled reservation {} while recording", program_id);
        }
        Ok(())
    }

    pub async fn remove_skip(&self, program_id: i64) -> Result<Reservation, ReserveError> {
        self.store.remove_skip(program_id).await
    }

    pub async fn disable_overlap(&self, program_id: i64) -> Result<Reservation, ReserveError> {
        self.store.disable_overlap(program_id).await
    }

    pub async fn update_all(&self) -> Result<(), ReserveError> {
        self.store.update_all().await
    }

    pub async fn update_rule(&self, rule_id: i64) -> Result<(), ReserveError> {
        self.store.update_rule(rule_id).await
    }

    // ---- Encoding -----------------------------------------------------

    pub fn encode_info(&self) -> EncodeInfo {
        self.encoder.info()
    }

    /// Queue an encode job for an existing recording.
    pub fn add_encode(&self, request: EncodeRequest) -> Result<u64, EncodeError> {
        self.encoder.push(request)
    }

    pub fn cancel_encode(&self, id: u64) -> Result<(), EncodeError> {
        self.encoder.cancel(id)
    }

    pub fn cancel_encode_by_recorded_id(&self, recorded_id: i64) -> usize {
        self.encoder.cancel_by_recorded_id(recorded_id)
    }

    // ---- Recording ----------------------------------------------------

    pub fn recordings(&self) -> Vec<SessionInfo> {
        self.recorder.sessions_info()
    }

    pub fn stop_recording(&self, program_id: i64) -> bool {
        self.recorder.stop(program_id)
    }

    pub fn stop_recording_by_rule(&self, rule_id: i64) -> usize {
        self.recorder.stop_by_rule(rule_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::EncodeProcessPool;
    use crate::event::EventBus;
    use crate::recorder::session::tests::{harness, FakeStream, Harness};
    use crate::recorder::SessionContext;
    use crate::reserve::now_ms;
    use std::time::Duration;

    fn service(h: &Harness) -> PvrService {
        let recorder = RecordingManager::new(SessionContext {
            store: Arc::clone(&h.ctx.store),
            source: Arc::clone(&h.ctx.source),
            recorded: Arc::clone(&h.ctx.recorded),
            programs: Arc::clone(&h.ctx.programs),
            events: Arc::clone(&h.ctx.events),
            encoder: None,
            settings: h.ctx.settings.clone(),
        });
        let encoder = EncodeManager::new(
            Arc::new(EncodeProcessPool::new(1)),
            Vec::new(),
            None,
            EventBus::new(),
        );
        PvrService::new(Arc::clone(&h.ctx.store), recorder, encoder)
    }

    #[tokio::test]
    async fn test_edit_rejected_while_recording() {
        let now = now_ms();
        let h = harness(FakeStream::Silent, now).await;
        let service = service(&h);

        let option = Some(ReserveOption {
            directory: Some("anime".into()),
            recorded_format: None,
        });
        let edited = service.edit_reserve(1, option.clone(), None).await.unwrap();
        assert_eq!(edited.option, option);

        service.recorder.check(now);
        assert_eq!(
            service.edit_reserve(1, None, None).await,
            Err(ReserveError::Recording(1))
        );
        assert_eq!(
            service.edit_reserve(2, None, None).await,
            Err(ReserveError::ReserveNotFound(2))
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_recording() {
        let now = now_ms();
        let h = harness(FakeStream::Silent, now).await;
        let service = service(&h);
        service.recorder.check(now);
        assert_eq!(service.recordings().len(), 1);

        service.cancel_reserve(1).await.unwrap();
        assert!(service.reserve(1).is_none());
        assert_eq!(service.reserves(ReserveFilter::All, 0, None).total, 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(service.recordings().is_empty());
        assert!(!service.stop_recording(1));
    }

    #[tokio::test]
    async fn test_encode_operations() {
        let h = harness(FakeStream::Silent, now_ms() + 3_600_000).await;
        let service = service(&h);

        let request = EncodeRequest {
            recorded_id: 1,
            source: h.dir.path().join("a.m2ts"),
            mode: "H.264".into(),
            directory: None,
            priority: 0,
            del_ts: false,
            program: None,
        };
        assert_eq!(
            service.add_encode(request),
            Err(EncodeError::UnknownMode("H.264".into()))
        );
        assert_eq!(service.cancel_encode(42), Err(EncodeError::NotFound(42)));
        assert_eq!(service.cancel_encode_by_recorded_id(1), 0);
        assert!(service.encode_info().queue.is_empty());
        assert_eq!(service.stop_recording_by_rule(1), 0);
    }
}
