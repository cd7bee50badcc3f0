use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use lofty::picture::{Picture, PictureType};
use tracing::{info, warn};

use crate::{AssetConfig, CueSample, Result, StemPair};

/// Front cover embedded into every exported file.
#[derive(Debug, Clone)]
pub struct CoverArt {
    path: PathBuf,
    picture: Picture,
}

impl CoverArt {
    /// Reads an image and checks that it is a format the tagger can embed.
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut picture = Picture::from_reader(&mut reader)?;
        picture.set_pic_type(PictureType::CoverFront);
        Ok(Self {
            path: path.to_path_buf(),
            picture,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn picture(&self) -> &Picture {
        &self.picture
    }
}

/// Files shared by all edits of all jobs: the cue sample and the cover.
#[derive(Debug, Clone, Default)]
pub struct AssetStore {
    cue: Option<CueSample>,
    cover: Option<CoverArt>,
}

impl AssetStore {
    /// Loads what the config points at. Assets that cannot be read are
    /// logged and left out; the synthesized clap and a cover-less tag take
    /// their place.
    pub fn load(config: &AssetConfig) -> Self {
        let cue = config.cue_sample.as_deref().and_then(|path| {
            CueSample::load(path)
                .inspect(|_| info!(path = %path.display(), "loaded cue sample"))
                .inspect_err(|err| {
                    warn!(path = %path.display(), %err, "cue sample unavailable, using synthesized clap")
                })
                .ok()
        });

        Self {
            cue,
            cover: config.cover_art.as_deref().and_then(Self::load_cover),
        }
    }

    /// Loads a cover, logging and returning `None` when it is unusable.
    pub fn load_cover(path: &Path) -> Option<CoverArt> {
        CoverArt::load(path)
            .inspect_err(|err| warn!(path = %path.display(), %err, "cover art unavailable"))
            .ok()
    }

    pub fn with_cue(mut self, cue: CueSample) -> Self {
        self.cue = Some(cue);
        self
    }

    pub fn with_cover(mut self, cover: Option<CoverArt>) -> Self {
        self.cover = cover;
        self
    }

    pub fn cover(&self) -> Option<&CoverArt> {
        self.cover.as_ref()
    }

    /// The cue sample converted to the stems' format. Without a loaded
    /// sample a clap is synthesized, capped at half a beat.
    pub fn cue_for(&self, stems: &StemPair, beat_seconds: f64) -> Result<CueSample> {
        match &self.cue {
            Some(cue) => cue.conform(stems.sample_rate(), stems.channels()),
            None => CueSample::synthesized_clap(stems.sample_rate(), Some(beat_seconds))
                .conform(stems.sample_rate(), stems.channels()),
        }
    }

    /// The synthesized impact in the stems' format.
    pub fn impact_for(&self, stems: &StemPair) -> Result<CueSample> {
        CueSample::synthesized_impact(stems.sample_rate())
            .conform(stems.sample_rate(), stems.channels())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AudioBuffer;

    fn stems(rate: u32) -> StemPair {
        let buffer = AudioBuffer::silence(rate as usize, 2, rate);
        StemPair::new(buffer.clone(), buffer).unwrap()
    }

    #[test]
    fn missing_files_degrade_to_defaults() {
        let config = AssetConfig {
            cue_sample: Some("/nonexistent/clap.wav".into()),
            cover_art: Some("/nonexistent/cover.jpg".into()),
        };
        let store = AssetStore::load(&config);
        assert!(store.cover().is_none());

        let cue = store.cue_for(&stems(8_000), 0.5).unwrap();
        assert_eq!(cue.buffer().channels(), 2);
        assert_eq!(cue.buffer().sample_rate(), 8_000);
    }

    #[test]
    fn loaded_cue_is_conformed_to_the_stems() {
        let mono = AudioBuffer::from_interleaved(vec![0.5; 400], 1, 8_000).unwrap();
        let store = AssetStore::default().with_cue(CueSample::from_buffer(mono).unwrap());
        let cue = store.cue_for(&stems(8_000), 0.5).unwrap();
        assert_eq!(cue.buffer().frames(), 400);
        assert_eq!(cue.buffer().channels(), 2);
    }

    #[test]
    fn non_image_cover_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cover.jpg");
        std::fs::write(&path, b"jpg").unwrap();
        assert!(AssetStore::load_cover(&path).is_none());
    }
}
