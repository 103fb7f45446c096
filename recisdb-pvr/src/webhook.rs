//! Webhook notifications for scheduler and recorder events.

use std::sync::Arc;

use log::{debug, warn};
use reqwest::Client;

use crate::config::WebhookSection;
use crate::event::{EventBus, ListenerError, PvrEvent};

const COLOR_INFO: u32 = 3447003;
const COLOR_SUCCESS: u32 = 3066993;
const COLOR_ERROR: u32 = 15158332;

/// Payload layout expected by the receiving service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookFormat {
    Generic,
    Discord,
    Slack,
    Line,
}

impl WebhookFormat {
    /// Unknown names fall back to the generic layout.
    pub fn from_name(name: &str) -> Self {
        match name {
            "discord" => WebhookFormat::Discord,
            "slack" => WebhookFormat::Slack,
            "line" => WebhookFormat::Line,
            _ => WebhookFormat::Generic,
        }
    }
}

/// Human readable summary of an event.
#[derive(Debug, Clone, PartialEq)]
struct Notice {
    title: String,
    message: String,
    color: u32,
}

fn notice(event: &PvrEvent) -> Notice {
    let (title, message, color) = match event {
        PvrEvent::ReserveAdded { reserve } => (
            "Reservation added",
            format!(
                "{}{}",
                reserve.program.name,
                if reserve.is_conflict { " (conflict)" } else { "" }
            ),
            COLOR_INFO,
        ),
        PvrEvent::RecordingPreparing { reserve } => {
            ("Preparing recording", reserve.program.name.clone(), COLOR_INFO)
        }
        PvrEvent::RecordingPrepFailed { reserve, reason } => (
            "Recording preparation failed",
            format!("{}: {}", reserve.program.name, reason),
            COLOR_ERROR,
        ),
        PvrEvent::RecordingStarted { reserve, path, .. } => (
            "Recording started",
            format!("{} -> {}", reserve.program.name, path.display()),
            COLOR_INFO,
        ),
        PvrEvent::RecordingFinished { program, path, .. } => (
            "Recording finished",
            match program {
                Some(program) => format!("{} ({})", program.name, path.display()),
                None => format!("{} (entry removed)", path.display()),
            },
            COLOR_SUCCESS,
        ),
        PvrEvent::RecordingError { reserve, reason } => (
            "Recording failed",
            format!("{}: {}", reserve.program.name, reason),
            COLOR_ERROR,
        ),
        PvrEvent::EncodeFinished {
            job_id,
            recorded_id,
            output,
            ..
        } => (
            "Encode finished",
            match output {
                Some(output) => format!(
                    "job {} for recorded {} -> {}",
                    job_id,
                    recorded_id,
                    output.display()
                ),
                None => format!("job {} for recorded {}", job_id, recorded_id),
            },
            COLOR_SUCCESS,
        ),
        PvrEvent::EncodeError {
            job_id,
            recorded_id,
            reason,
        } => (
            "Encode failed",
            format!("job {} for recorded {}: {}", job_id, recorded_id, reason),
            COLOR_ERROR,
        ),
    };
    Notice {
        title: title.to_string(),
        message,
        color,
    }
}

/// Posts a JSON payload per event.
pub struct WebhookNotifier {
    client: Client,
    url: String,
    format: WebhookFormat,
}

impl WebhookNotifier {
    pub fn new(section: &WebhookSection) -> Arc<Self> {
        Arc::new(Self {
            client: Client::new(),
            url: section.url.clone(),
            format: WebhookFormat::from_name(&section.format),
        })
    }

    /// Subscribe to `events`. Each post runs in its own task so a slow
    /// endpoint never delays the emitter.
    pub fn register(self: &Arc<Self>, events: &EventBus) {
        let this = Arc::clone(self);
        events.subscribe(move |event| -> Result<(), ListenerError> {
            let handle = tokio::runtime::Handle::try_current()?;
            let payload = this.payload(event);
            let name = event.name();
            let this = Arc::clone(&this);
            handle.spawn(async move {
                match this.send(&payload).await {
                    Ok(()) => debug!("Webhook: sent {}", name),
                    Err(e) => warn!("Webhook send failed for {}: {}", name, e),
                }
            });
            Ok(())
        });
    }

    async fn send(&self, payload: &serde_json::Value) -> Result<(), reqwest::Error> {
        self.client
            .post(&self.url)
            .json(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn payload(&self, event: &PvrEvent) -> serde_json::Value {
        let notice = notice(event);
        match self.format {
            WebhookFormat::Discord => format_discord_payload(&notice),
            WebhookFormat::Slack => format_slack_payload(&notice),
            WebhookFormat::Line => format_line_payload(&notice),
            WebhookFormat::Generic => format_generic_payload(event, &notice),
        }
    }
}

fn format_discord_payload(notice: &Notice) -> serde_json::Value {
    serde_json::json!({
        "embeds": [{
            "title": notice.title,
            "description": notice.message,
            "color": notice.color,
        }]
    })
}

fn format_slack_payload(notice: &Notice) -> serde_json::Value {
    serde_json::json!({
        "blocks": [
            {
                "type": "section",
                "text": {"type": "mrkdwn", "text": format!("*{}*", notice.title)}
            },
            {
                "type": "section",
                "text": {"type": "mrkdwn", "text": notice.message}
            }
        ]
    })
}

fn format_line_payload(notice: &Notice) -> serde_json::Value {
    serde_json::json!({
        "message": format!("[recisdb-pvr] {}\n{}", notice.title, notice.message)
    })
}

fn format_generic_payload(event: &PvrEvent, notice: &Notice) -> serde_json::Value {
    serde_json::json!({
        "title": notice.title,
        "message": notice.message,
        "event": event,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvr_types::{ChannelType, Program, Reservation};

    fn reserve() -> Reservation {
        Reservation::manual(
            Program::new(7, 1, ChannelType::GR, "27", 0, 60_000, "News"),
            1,
        )
    }

    fn notifier(format: &str) -> Arc<WebhookNotifier> {
        WebhookNotifier::new(&WebhookSection {
            url: "http://127.0.0.1:9/hook".into(),
            format: format.into(),
        })
    }

    #[test]
    fn test_payload_formats() {
        let event = PvrEvent::RecordingPrepFailed {
            reserve: reserve(),
            reason: "no tuner".into(),
        };

        let discord = notifier("discord").payload(&event);
        assert_eq!(discord["embeds"][0]["title"], "Recording preparation failed");
        assert_eq!(discord["embeds"][0]["description"], "News: no tuner");
        assert_eq!(discord["embeds"][0]["color"], COLOR_ERROR);

        let slack = notifier("slack").payload(&event);
        assert_eq!(slack["blocks"][1]["text"]["text"], "News: no tuner");

        let line = notifier("line").payload(&event);
        assert!(line["message"].as_str().unwrap().contains("News: no tuner"));

        let generic = notifier("anything").payload(&event);
        assert_eq!(generic["event"]["event"], "recording_prep_failed");
        assert_eq!(generic["event"]["reserve"]["program"]["id"], 7);
    }

    #[test]
    fn test_finished_without_program() {
        let n = notice(&PvrEvent::RecordingFinished {
            recorded_id: 1,
            program: None,
            path: "/rec/a.m2ts".into(),
            encode: None,
        });
        assert_eq!(n.message, "/rec/a.m2ts (entry removed)");
        assert_eq!(n.color, COLOR_SUCCESS);
    }

    #[test]
    fn test_emit_outside_runtime_is_contained() {
        let bus = EventBus::new();
        notifier("generic").register(&bus);
        // No runtime: the listener error is logged by the bus.
        bus.emit(PvrEvent::ReserveAdded { reserve: reserve() });
    }
}
