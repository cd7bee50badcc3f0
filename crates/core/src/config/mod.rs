use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{OutputFormat, Result};

/// Top-level engine configuration, usually read from a JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub render: RenderConfig,
    pub export: ExportConfig,
    pub assets: AssetConfig,
}

impl EngineConfig {
    /// Reads a JSON config. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Timing and level settings used when planning and rendering edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub crossfade_seconds: f64,
    /// Fades shorter than this become hard cuts.
    pub min_crossfade_seconds: f64,
    pub intro_fraction: f64,
    pub outro_fraction: f64,
    /// Share of the body used as the drop when no tempo is known.
    pub body_fraction_short: f64,
    pub lead_in_beats: u32,
    pub phrase_beats: u32,
    pub cue_gain: f32,
    pub cue_headroom_ratio: f32,
    /// Render threads; 0 lets rayon decide.
    pub workers: usize,
    /// Detect tempo and drop when the caller supplies no markers.
    pub analyse: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            crossfade_seconds: 0.5,
            min_crossfade_seconds: 0.01,
            intro_fraction: 0.08,
            outro_fraction: 0.08,
            body_fraction_short: 0.6,
            lead_in_beats: 16,
            phrase_beats: 32,
            cue_gain: 0.8,
            cue_headroom_ratio: 1.0,
            workers: 0,
            analyse: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub formats: Vec<OutputFormat>,
    pub lossy_bitrate_kbps: u32,
    pub ffmpeg: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            formats: vec![OutputFormat::Lossless, OutputFormat::Lossy],
            lossy_bitrate_kbps: 320,
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

/// Optional files shared by every job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    pub cue_sample: Option<PathBuf>,
    pub cover_art: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "render": { "crossfade_seconds": 1.5 } }"#).unwrap();
        assert_eq!(config.render.crossfade_seconds, 1.5);
        assert_eq!(config.render.lead_in_beats, 16);
        assert_eq!(config.export, ExportConfig::default());
    }

    #[test]
    fn formats_use_lowercase_names() {
        let config: ExportConfig = serde_json::from_str(r#"{ "formats": ["lossy"] }"#).unwrap();
        assert_eq!(config.formats, vec![OutputFormat::Lossy]);
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "export": { "lossy_bitrate_kbps": 192 } }"#).unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.export.lossy_bitrate_kbps, 192);
    }
}
