//! Narrow contracts to external collaborators.
//!
//! The pipeline only ever talks to the fetcher, audio extractor,
//! transcriber, subtitle writer and video editor through these traits.
//! Production implementations wrap external tools; tests wire in-process
//! fakes.

pub mod audio;
pub mod editor;
pub mod fetcher;
pub mod process;
pub mod subtitle;
pub mod transcribe;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clip_types::{
    AudioArtifact, EditSegment, EditedVideo, SubtitleArtifact, SubtitleFormat,
    TranscriptionResult, TranslatedSegment, VideoArtifact,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorKind;

pub use audio::FfmpegAudioExtractor;
pub use editor::FfmpegVideoEditor;
pub use fetcher::YtDlpFetcher;
pub use subtitle::{BuiltinSubtitleWriter, SubtitleStyle};
pub use transcribe::CommandTranscriber;

/// Errors from the fetcher collaborator.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid video URL `{0}`")]
    InvalidUrl(String),

    #[error("video not found")]
    NotFound,

    #[error("video is blocked in this region")]
    GeoBlocked,

    #[error("video is age restricted")]
    AgeRestricted,

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("not enough disk space for download")]
    DiskSpace,

    #[error("download cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            FetchError::InvalidUrl(_)
            | FetchError::NotFound
            | FetchError::GeoBlocked
            | FetchError::AgeRestricted => ErrorKind::InvalidInput,
            FetchError::DownloadFailed(_) => ErrorKind::TransientNetwork,
            FetchError::DiskSpace => ErrorKind::ResourceExhausted,
            FetchError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Fetches the source video for a URL.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        output_dir: &Path,
        quality: &str,
        cancel: &CancellationToken,
    ) -> Result<VideoArtifact, FetchError>;
}

/// Errors from the audio extraction collaborator.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("video has no audio track")]
    NoAudioTrack,

    #[error("unsupported audio format")]
    FormatUnsupported,

    #[error("audio extraction cancelled")]
    Cancelled,
}

impl AudioError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            AudioError::ExtractionFailed(_) => ErrorKind::Internal,
            AudioError::NoAudioTrack | AudioError::FormatUnsupported => ErrorKind::InvalidInput,
            AudioError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Extracts a transcription-ready WAV track (16 kHz mono PCM).
#[async_trait]
pub trait AudioExtractor: Send + Sync {
    async fn extract(
        &self,
        video: &Path,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<AudioArtifact, AudioError>;
}

/// Errors from the transcription collaborator.
#[derive(Debug, Error)]
pub enum TranscribeError {
    #[error("failed to load speech model: {0}")]
    ModelLoad(String),

    #[error("out of memory during transcription")]
    OutOfMemory,

    #[error("audio track carries no speech data")]
    EmptyAudio,

    #[error("language detection failed: {0}")]
    LanguageDetect(String),

    #[error("compute device error: {0}")]
    DeviceError(String),

    #[error("transcription cancelled")]
    Cancelled,
}

impl TranscribeError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            TranscribeError::ModelLoad(_) | TranscribeError::DeviceError(_) => {
                ErrorKind::ProviderUnavailable
            }
            TranscribeError::OutOfMemory => ErrorKind::ResourceExhausted,
            TranscribeError::EmptyAudio | TranscribeError::LanguageDetect(_) => {
                ErrorKind::InvalidInput
            }
            TranscribeError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Produces the transcript for an audio file.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        audio: &Path,
        language: Option<&str>,
        diarize: bool,
        cancel: &CancellationToken,
    ) -> Result<TranscriptionResult, TranscribeError>;
}

/// Errors from the subtitle writer collaborator.
#[derive(Debug, Error)]
pub enum SubtitleError {
    #[error("font `{0}` not found")]
    FontNotFound(String),

    #[error("failed to write subtitle file: {0}")]
    WriteFailed(String),
}

impl SubtitleError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            SubtitleError::FontNotFound(_) => ErrorKind::InvalidInput,
            SubtitleError::WriteFailed(_) => ErrorKind::Internal,
        }
    }
}

/// Serializes translated segments into a subtitle file.
#[async_trait]
pub trait SubtitleWriter: Send + Sync {
    async fn write(
        &self,
        segments: &[TranslatedSegment],
        style: &SubtitleStyle,
        format: SubtitleFormat,
        output: &Path,
    ) -> Result<SubtitleArtifact, SubtitleError>;
}

/// Errors from the video editor collaborator.
#[derive(Debug, Error)]
pub enum EditError {
    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("invalid edit segment: {0}")]
    InvalidSegment(String),

    #[error("hardware acceleration unavailable")]
    HwAccelFailed,

    #[error("not enough disk space for encode")]
    DiskSpace,

    #[error("encode cancelled")]
    Cancelled,
}

impl EditError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            EditError::EncodingFailed(_) => ErrorKind::Internal,
            EditError::InvalidSegment(_) => ErrorKind::InvalidInput,
            EditError::HwAccelFailed => ErrorKind::ResourceExhausted,
            EditError::DiskSpace => ErrorKind::ResourceExhausted,
            EditError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Output parameters for an edit/encode job.
#[derive(Debug, Clone, PartialEq)]
pub struct EditOutput {
    pub target: PathBuf,
    /// Burn this subtitle file into the output when present.
    pub subtitle: Option<PathBuf>,
}

/// Cuts, retimes and encodes the curated segments into an output video.
#[async_trait]
pub trait VideoEditor: Send + Sync {
    async fn edit(
        &self,
        video: &Path,
        segments: &[EditSegment],
        output: &EditOutput,
        cancel: &CancellationToken,
    ) -> Result<EditedVideo, EditError>;
}

/// The bundle of collaborators a pipeline run is wired with.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn Fetcher>,
    pub audio: Arc<dyn AudioExtractor>,
    pub transcriber: Arc<dyn Transcriber>,
    pub subtitles: Arc<dyn SubtitleWriter>,
    pub editor: Arc<dyn VideoEditor>,
}
