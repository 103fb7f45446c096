//! Byte-stream providers for recording sessions.
//!
//! A [`TunerSource`] hands out MPEG-TS streams for a program or a physical
//! channel. Dropping the returned [`TunerStream`] tears the connection down,
//! which is how recording sessions are stopped.

use std::io;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use log::{debug, info};
use pvr_types::{ChannelType, Program};
use reqwest::Client;
use thiserror::Error;

/// Header carrying the tuner priority for the request.
const PRIORITY_HEADER: &str = "X-Mirakurun-Priority";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A cancellable TS byte stream.
pub type TunerStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Stream acquisition errors.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Tuner source returned status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Tuner source unavailable: {0}")]
    Unavailable(String),
}

/// Provider of recording streams.
#[async_trait]
pub trait TunerSource: Send + Sync {
    /// Stream a single program. The provider ends the stream when the
    /// program ends.
    async fn open_program(&self, program: &Program, priority: i32)
        -> Result<TunerStream, SourceError>;

    /// Stream a whole physical channel until dropped.
    async fn open_channel(
        &self,
        channel_type: ChannelType,
        channel: &str,
        priority: i32,
    ) -> Result<TunerStream, SourceError>;
}

/// Mirakurun-compatible HTTP tuner source.
pub struct MirakurunSource {
    base_url: String,
    client: Client,
}

impl MirakurunSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SourceError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn program_url(&self, program_id: i64) -> String {
        format!("{}/api/programs/{}/stream", self.base_url, program_id)
    }

    pub fn channel_url(&self, channel_type: ChannelType, channel: &str) -> String {
        format!(
            "{}/api/channels/{}/{}/stream",
            self.base_url,
            channel_type.as_str(),
            channel
        )
    }

    async fn open(&self, url: String, priority: i32) -> Result<TunerStream, SourceError> {
        debug!("MirakurunSource: GET {} (priority {})", url, priority);
        let response = self
            .client
            .get(&url)
            .header(PRIORITY_HEADER, priority.to_string())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                url,
            });
        }

        info!("MirakurunSource: stream opened {}", url);
        let stream = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl TunerSource for MirakurunSource {
    async fn open_program(
        &self,
        program: &Program,
        priority: i32,
    ) -> Result<TunerStream, SourceError> {
        self.open(self.program_url(program.id), priority).await
    }

    async fn open_channel(
        &self,
        channel_type: ChannelType,
        channel: &str,
        priority: i32,
    ) -> Result<TunerStream, SourceError> {
        self.open(self.channel_url(channel_type, channel), priority)
            .await
    }
}
