//! Local capture seam.
//!
//! The call machine never talks to capture hardware; it asks a
//! [`MediaSource`] for a [`LocalMedia`] bundle before any session exists.
//! Embedders plug in real device capture; the shipped source produces
//! sample-fed tracks suitable for headless use.

use crate::types::MediaKind;
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// The user or platform refused access to the device.
    #[error("capture denied: {0}")]
    Denied(String),
    #[error("capture unavailable: {0}")]
    Unavailable(String),
}

/// The local tracks for one call attempt. Stopping releases the tracks;
/// a second stop is a no-op.
#[derive(Default)]
pub struct LocalMedia {
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<dyn TrackLocal + Send + Sync>] {
        &self.tracks
    }

    pub fn stop(&mut self) {
        self.tracks.clear();
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

/// Produces local tracks for a call of the given kind. Called before the
/// session is created, so a refusal aborts the attempt with no footprint.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn capture(&self, kind: MediaKind) -> Result<LocalMedia, MediaError>;
}

/// Sample-fed tracks: Opus audio, VP8 video. The embedder pushes frames
/// into the tracks it obtains from the engine; nothing here opens a
/// device.
#[derive(Default)]
pub struct SampleMediaSource;

impl SampleMediaSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaSource for SampleMediaSource {
    async fn capture(&self, kind: MediaKind) -> Result<LocalMedia, MediaError> {
        let mut tracks: Vec<Arc<dyn TrackLocal + Send + Sync>> = Vec::new();

        tracks.push(Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                ..Default::default()
            },
            "audio".to_string(),
            "relaycall-local".to_string(),
        )));

        if kind.has_video() {
            tracks.push(Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    ..Default::default()
                },
                "video".to_string(),
                "relaycall-local".to_string(),
            )));
        }

        Ok(LocalMedia::new(tracks))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn audio_call_captures_one_track() {
        let media = SampleMediaSource::new()
            .capture(MediaKind::Audio)
            .await
            .unwrap();
        assert_eq!(media.tracks().len(), 1);
    }

    #[tokio::test]
    async fn video_call_adds_a_video_track() {
        let mut media = SampleMediaSource::new()
            .capture(MediaKind::Video)
            .await
            .unwrap();
        assert_eq!(media.tracks().len(), 2);

        media.stop();
        assert!(media.tracks().is_empty());
        // Stop twice; the second call must be harmless.
        media.stop();
    }
}
