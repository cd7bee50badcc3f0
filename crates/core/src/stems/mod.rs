use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{audio, AudioBuffer, Result, StemEditError};

/// Which stem (or combination) a segment is cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Vocal,
    Instrumental,
    /// Vocal and instrumental summed back together.
    Full,
}

/// The vocal and instrumental stems of one job.
///
/// Both stems share sample rate, channel count and length. The pair is built
/// once and then only read, so render workers can hold it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct StemPair {
    vocal: AudioBuffer,
    instrumental: AudioBuffer,
    full: AudioBuffer,
}

impl StemPair {
    /// Pairs two stems. A few frames of length difference (decoder padding)
    /// are absorbed by padding the shorter stem with silence.
    pub fn new(vocal: AudioBuffer, instrumental: AudioBuffer) -> Result<Self> {
        if !vocal.same_format(&instrumental) {
            return Err(StemEditError::FormatMismatch(format!(
                "vocal stem is {} Hz/{} ch but instrumental stem is {} Hz/{} ch",
                vocal.sample_rate(),
                vocal.channels(),
                instrumental.sample_rate(),
                instrumental.channels()
            )));
        }

        let frames = vocal.frames().max(instrumental.frames());
        if vocal.frames() != instrumental.frames() {
            debug!(
                vocal = vocal.frames(),
                instrumental = instrumental.frames(),
                "padding stems to a common length"
            );
        }
        let vocal = vocal.padded_to(frames);
        let instrumental = instrumental.padded_to(frames);
        let full = AudioBuffer::mix(&vocal, &instrumental, 1.0, 1.0)?;

        Ok(Self {
            vocal,
            instrumental,
            full,
        })
    }

    pub fn vocal(&self) -> &AudioBuffer {
        &self.vocal
    }

    pub fn instrumental(&self) -> &AudioBuffer {
        &self.instrumental
    }

    /// The recombined mix of both stems.
    pub fn full_mix(&self) -> &AudioBuffer {
        &self.full
    }

    pub fn source(&self, source: Source) -> &AudioBuffer {
        match source {
            Source::Vocal => &self.vocal,
            Source::Instrumental => &self.instrumental,
            Source::Full => &self.full,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.vocal.sample_rate()
    }

    pub fn channels(&self) -> u16 {
        self.vocal.channels()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.vocal.duration_seconds()
    }
}

/// Source separation collaborator. Implementations are treated as atomic and
/// are never retried by the engine.
pub trait Separator: Send + Sync {
    fn separate(&self, source: Option<&AudioBuffer>) -> Result<StemPair>;

    /// Name used in logs.
    fn name(&self) -> &'static str;
}

/// Separator backed by stems that were already written to disk by an
/// external separation model.
#[derive(Debug, Clone)]
pub struct StemFiles {
    pub vocal: PathBuf,
    pub instrumental: PathBuf,
}

impl StemFiles {
    pub fn new(vocal: impl Into<PathBuf>, instrumental: impl Into<PathBuf>) -> Self {
        Self {
            vocal: vocal.into(),
            instrumental: instrumental.into(),
        }
    }

    fn load(path: &Path) -> Result<AudioBuffer> {
        audio::decode_file(path).map_err(|err| {
            StemEditError::Separation(format!("failed to load stem {}: {err}", path.display()))
        })
    }
}

impl Separator for StemFiles {
    fn separate(&self, _source: Option<&AudioBuffer>) -> Result<StemPair> {
        info!(vocal = ?self.vocal, instrumental = ?self.instrumental, "loading separated stems");
        let vocal = Self::load(&self.vocal)?;
        let instrumental = Self::load(&self.instrumental)?;

        // Separation models emit both stems at the source rate; resample the
        // instrumental onto the vocal's grid if they ever disagree.
        let instrumental = if instrumental.sample_rate() != vocal.sample_rate() {
            instrumental.resample(vocal.sample_rate())?
        } else {
            instrumental
        };
        let instrumental = instrumental.with_channels(vocal.channels())?;

        StemPair::new(vocal, instrumental)
            .map_err(|err| StemEditError::Separation(err.to_string()))
    }

    fn name(&self) -> &'static str {
        "stem-files"
    }
}
