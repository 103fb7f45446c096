//! Fire-and-forget event notifications.
//!
//! Components emit [`PvrEvent`]s through a shared [`EventBus`]. Listener
//! failures (returned errors or panics) are logged at the emission site
//! and never reach the emitter.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use log::{debug, error, warn};
use pvr_types::{EncodeOption, Program, Reservation};
use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of the broadcast channel for async subscribers.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the scheduler, recorder and encoder.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PvrEvent {
    ReserveAdded {
        reserve: Reservation,
    },
    RecordingPreparing {
        reserve: Reservation,
    },
    /// Stream acquisition failed on every attempt; the reservation was cancelled.
    RecordingPrepFailed {
        reserve: Reservation,
        reason: String,
    },
    RecordingStarted {
        recorded_id: i64,
        reserve: Reservation,
        path: PathBuf,
    },
    /// `program` is `None` when the recorded row vanished mid-recording.
    RecordingFinished {
        recorded_id: i64,
        program: Option<Program>,
        path: PathBuf,
        encode: Option<EncodeOption>,
    },
    RecordingError {
        reserve: Reservation,
        reason: String,
    },
    EncodeFinished {
        job_id: u64,
        recorded_id: i64,
        source: PathBuf,
        /// `None` for in-place modes.
        output: Option<PathBuf>,
        del_ts: bool,
    },
    EncodeError {
        job_id: u64,
        recorded_id: i64,
        reason: String,
    },
}

impl PvrEvent {
    /// Short name used in logs and webhook titles.
    pub fn name(&self) -> &'static str {
        match self {
            PvrEvent::ReserveAdded { .. } => "reserve_added",
            PvrEvent::RecordingPreparing { .. } => "recording_preparing",
            PvrEvent::RecordingPrepFailed { .. } => "recording_prep_failed",
            PvrEvent::RecordingStarted { .. } => "recording_started",
            PvrEvent::RecordingFinished { .. } => "recording_finished",
            PvrEvent::RecordingError { .. } => "recording_error",
            PvrEvent::EncodeFinished { .. } => "encode_finished",
            PvrEvent::EncodeError { .. } => "encode_error",
        }
    }
}

/// Error type returned by listeners.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

type Listener = Arc<dyn Fn(&PvrEvent) -> Result<(), ListenerError> + Send + Sync>;

/// Synchronous listener registry plus a broadcast channel for async consumers.
pub struct EventBus {
    listeners: RwLock<Vec<Listener>>,
    tx: broadcast::Sender<PvrEvent>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            listeners: RwLock::new(Vec::new()),
            tx,
        })
    }

    /// Register a synchronous listener.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&PvrEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(listener));
    }

    /// Receive events on a broadcast channel.
    pub fn receiver(&self) -> broadcast::Receiver<PvrEvent> {
        self.tx.subscribe()
    }

    /// Deliver an event to every listener.
    pub fn emit(&self, event: PvrEvent) {
        debug!("EventBus: {}", event.name());

        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("EventBus: listener failed on {}: {}", event.name(), e),
                Err(_) => error!("EventBus: listener panicked on {}", event.name()),
            }
        }

        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event() -> PvrEvent {
        PvrEvent::EncodeError {
            job_id: 1,
            recorded_id: 2,
            reason: "x".into(),
        }
    }

    #[test]
    fn test_failing_listeners_do_not_stop_delivery() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        bus.subscribe(|_| Err("boom".into()));
        bus.subscribe(|_| panic!("listener bug"));
        let counter = Arc::clone(&delivered);
        bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(event());
        bus.emit(event());
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_broadcast_receiver_gets_events() {
        let bus = EventBus::new();
        let mut rx = bus.receiver();
        bus.emit(event());
        let received = rx.recv().await.unwrap();
        assert_eq!(received.name(), "encode_error");
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(event()).unwrap();
        assert_eq!(json["event"], "encode_error");
        assert_eq!(json["recorded_id"], 2);
    }
}
