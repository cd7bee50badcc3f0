use std::{
    fmt, fs,
    path::{Path, PathBuf},
    process::Command,
    str::FromStr,
    sync::Arc,
};

use lofty::{
    config::WriteOptions,
    tag::{Accessor, ItemKey, Tag, TagExt, TagType},
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    AudioBuffer, CoverArt, ExportConfig, RenderedEdit, Result, StemEditError, TrackMetadata,
};

/// Deliverable formats. Every edit is written once per requested format.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// 16-bit PCM WAV.
    Lossless,
    /// MP3.
    Lossy,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 2] = [OutputFormat::Lossless, OutputFormat::Lossy];

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Lossless => "wav",
            OutputFormat::Lossy => "mp3",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OutputFormat::Lossless => "lossless",
            OutputFormat::Lossy => "lossy",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OutputFormat {
    type Err = StemEditError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lossless" | "wav" => Ok(OutputFormat::Lossless),
            "lossy" | "mp3" => Ok(OutputFormat::Lossy),
            other => Err(StemEditError::invalid_input(format!(
                "unknown output format `{other}`, expected lossless or lossy"
            ))),
        }
    }
}

/// Writes a buffer to `path` in one format. Implementations must either
/// produce a complete file or return an error.
pub trait Encoder: Send + Sync {
    fn format(&self) -> OutputFormat;

    fn encode(&self, buffer: &AudioBuffer, path: &Path) -> Result<()>;
}

/// 16-bit integer WAV through `hound`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WavEncoder;

impl Encoder for WavEncoder {
    fn format(&self) -> OutputFormat {
        OutputFormat::Lossless
    }

    fn encode(&self, buffer: &AudioBuffer, path: &Path) -> Result<()> {
        write_wav(buffer, path).map_err(|err| StemEditError::encode(self.format(), err))
    }
}

fn write_wav(buffer: &AudioBuffer, path: &Path) -> std::result::Result<(), hound::Error> {
    let spec = hound::WavSpec {
        channels: buffer.channels(),
        sample_rate: buffer.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)?;
    for sample in buffer.samples() {
        let quantized = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)).round() as i16;
        writer.write_sample(quantized)?;
    }
    writer.finalize()
}

/// MP3 through an external `ffmpeg` with libmp3lame.
#[derive(Debug, Clone)]
pub struct Mp3Encoder {
    ffmpeg: PathBuf,
    bitrate_kbps: u32,
    scratch_dir: Option<PathBuf>,
}

impl Mp3Encoder {
    pub fn new(ffmpeg: impl Into<PathBuf>, bitrate_kbps: u32) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            bitrate_kbps,
            scratch_dir: None,
        }
    }

    /// Directory for the intermediate WAV; the system temp dir otherwise.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }
}

impl Encoder for Mp3Encoder {
    fn format(&self) -> OutputFormat {
        OutputFormat::Lossy
    }

    fn encode(&self, buffer: &AudioBuffer, path: &Path) -> Result<()> {
        let fail = |reason: String| StemEditError::encode(self.format(), reason);

        let temp_dir = match &self.scratch_dir {
            Some(dir) => tempfile::tempdir_in(dir),
            None => tempfile::tempdir(),
        }
        .map_err(|err| fail(format!("no scratch space for the intermediate wav: {err}")))?;
        let temp_wav = temp_dir.path().join("edit.wav");
        write_wav(buffer, &temp_wav)
            .map_err(|err| fail(format!("intermediate wav failed: {err}")))?;

        let output = Command::new(&self.ffmpeg)
            .args(["-y", "-hide_banner", "-loglevel", "error", "-i"])
            .arg(&temp_wav)
            .args(["-codec:a", "libmp3lame", "-b:a"])
            .arg(format!("{}k", self.bitrate_kbps))
            .args(["-f", "mp3"])
            .arg(path)
            .output()
            .map_err(|err| fail(format!("failed to spawn {}: {err}", self.ffmpeg.display())))?;

        if !output.status.success() {
            return Err(fail(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Outcome of one format of one edit.
#[derive(Debug)]
pub struct ExportOutcome {
    pub format: OutputFormat,
    pub result: Result<PathBuf>,
}

/// Encodes rendered edits, tags them and publishes them into an output
/// directory. Files only appear under their final name once complete.
#[derive(Clone)]
pub struct Exporter {
    encoders: Vec<Arc<dyn Encoder>>,
}

impl Exporter {
    pub fn new(encoders: Vec<Arc<dyn Encoder>>) -> Self {
        Self { encoders }
    }

    pub fn from_config(config: &ExportConfig) -> Self {
        Self::new(vec![
            Arc::new(WavEncoder),
            Arc::new(Mp3Encoder::new(&config.ffmpeg, config.lossy_bitrate_kbps)),
        ])
    }

    /// Replaces the encoder registered for the same format.
    pub fn with_encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoders
            .retain(|existing| existing.format() != encoder.format());
        self.encoders.push(encoder);
        self
    }

    fn encoder(&self, format: OutputFormat) -> Option<&Arc<dyn Encoder>> {
        self.encoders
            .iter()
            .find(|encoder| encoder.format() == format)
    }

    /// Writes `edit` in every format, in parallel. A failing format never
    /// affects the others.
    #[instrument(skip_all, fields(edit = %edit.metadata.edit_label, dir = %out_dir.display()))]
    pub fn export(
        &self,
        edit: &RenderedEdit,
        formats: &[OutputFormat],
        out_dir: &Path,
        cover: Option<&CoverArt>,
    ) -> Vec<ExportOutcome> {
        formats
            .par_iter()
            .map(|format| {
                let result = match self.encoder(*format) {
                    Some(encoder) => publish(encoder.as_ref(), edit, out_dir, cover),
                    None => Err(StemEditError::encode(format, "no encoder registered")),
                };
                match &result {
                    Ok(path) => info!(%format, path = %path.display(), "published"),
                    Err(err) => warn!(%format, %err, "export failed"),
                }
                ExportOutcome {
                    format: *format,
                    result,
                }
            })
            .collect()
    }
}

impl fmt::Debug for Exporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formats: Vec<OutputFormat> = self.encoders.iter().map(|e| e.format()).collect();
        f.debug_struct("Exporter").field("formats", &formats).finish()
    }
}

/// Encodes into a hidden temporary file next to the target, tags it and
/// renames it into place. On error the temporary file is removed.
fn publish(
    encoder: &dyn Encoder,
    edit: &RenderedEdit,
    out_dir: &Path,
    cover: Option<&CoverArt>,
) -> Result<PathBuf> {
    let format = encoder.format();
    fs::create_dir_all(out_dir)?;
    let target = out_dir.join(format!("{}.{}", edit.metadata.file_stem(), format.extension()));

    let temp = tempfile::Builder::new()
        .prefix(".stem-edit-")
        .suffix(&format!(".{}", format.extension()))
        .tempfile_in(out_dir)?;
    encoder.encode(&edit.buffer, temp.path())?;
    write_tags(temp.path(), &edit.metadata, cover)
        .map_err(|err| StemEditError::encode(format, err))?;

    temp.persist(&target)
        .map_err(|err| StemEditError::encode(format, err.error))?;
    debug!(path = %target.display(), "persisted");
    Ok(target)
}

/// Writes an ID3v2 tag. Files without cover art simply carry no picture.
pub fn write_tags(path: &Path, metadata: &TrackMetadata, cover: Option<&CoverArt>) -> Result<()> {
    let mut tag = Tag::new(TagType::Id3v2);
    tag.set_title(metadata.display_title());
    tag.set_artist(metadata.artist.clone());
    tag.set_album(metadata.title.clone());
    tag.set_genre(metadata.genre.clone());
    tag.set_comment(metadata.edit_label.clone());
    if let Some(bpm) = metadata.bpm {
        tag.insert_text(ItemKey::Bpm, format!("{bpm:.0}"));
    }
    if let Some(cover) = cover {
        tag.push_picture(cover.picture().clone());
    }

    tag.save_to_path(path, WriteOptions::default())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use lofty::file::TaggedFileExt;

    use super::*;
    use crate::EditKind;

    struct Broken;

    impl Encoder for Broken {
        fn format(&self) -> OutputFormat {
            OutputFormat::Lossy
        }

        fn encode(&self, _buffer: &AudioBuffer, path: &Path) -> Result<()> {
            fs::write(path, b"partial")?;
            Err(StemEditError::encode(self.format(), "disk full"))
        }
    }

    fn edit() -> RenderedEdit {
        let samples: Vec<f32> = (0..2_000).map(|i| (i as f32 * 0.01).sin() * 0.5).collect();
        RenderedEdit {
            kind: EditKind::ClapIn,
            buffer: AudioBuffer::from_interleaved(samples, 2, 8_000).unwrap(),
            metadata: TrackMetadata {
                title: "Night Drive".into(),
                artist: "Someone".into(),
                genre: "Techno".into(),
                edit_label: "Clap In".into(),
                bpm: Some(126.0),
                cover: None,
            },
            cue_offsets: Vec::new(),
        }
    }

    #[test]
    fn parses_format_names() {
        assert_eq!("Lossless".parse::<OutputFormat>().unwrap(), OutputFormat::Lossless);
        assert_eq!("mp3".parse::<OutputFormat>().unwrap(), OutputFormat::Lossy);
        assert!("flac".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn wav_export_is_tagged_and_named_after_the_edit() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = Exporter::new(vec![Arc::new(WavEncoder)]);
        let outcomes = exporter.export(&edit(), &[OutputFormat::Lossless], dir.path(), None);

        let path = outcomes[0].result.as_ref().unwrap();
        assert_eq!(path, &dir.path().join("Night Drive (Clap In).wav"));

        let decoded = crate::audio::decode_file(path).unwrap();
        assert_eq!(decoded.frames(), 1_000);
        assert_eq!(decoded.channels(), 2);

        let tagged = lofty::read_from_path(path).unwrap();
        let tag = tagged.tag(TagType::Id3v2).unwrap();
        assert_eq!(tag.title().as_deref(), Some("Night Drive (Clap In)"));
        assert_eq!(tag.artist().as_deref(), Some("Someone"));
        assert_eq!(tag.comment().as_deref(), Some("Clap In"));
    }

    #[test]
    fn failed_format_leaves_no_file_and_keeps_the_other() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = Exporter::new(vec![Arc::new(WavEncoder)]).with_encoder(Arc::new(Broken));
        let outcomes = exporter.export(&edit(), &OutputFormat::ALL, dir.path(), None);

        let lossless = outcomes
            .iter()
            .find(|o| o.format == OutputFormat::Lossless)
            .unwrap();
        let lossy = outcomes
            .iter()
            .find(|o| o.format == OutputFormat::Lossy)
            .unwrap();
        assert!(lossless.result.is_ok());
        assert!(matches!(lossy.result, Err(StemEditError::Encode { .. })));

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["Night Drive (Clap In).wav".to_string()]);
    }

    #[test]
    fn missing_ffmpeg_is_an_encode_error() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = Mp3Encoder::new("/nonexistent/ffmpeg", 320);
        let err = encoder
            .encode(&edit().buffer, &dir.path().join("out.mp3"))
            .unwrap_err();
        assert!(matches!(err, StemEditError::Encode { .. }));
    }

    #[test]
    fn intermediate_wav_failures_are_reported_as_lossy() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("scratch");
        fs::write(&not_a_dir, b"file").unwrap();

        let encoder = Mp3Encoder::new("ffmpeg", 320).with_scratch_dir(&not_a_dir);
        let err = encoder
            .encode(&edit().buffer, &dir.path().join("out.mp3"))
            .unwrap_err();
        match err {
            StemEditError::Encode { format, .. } => assert_eq!(format, "lossy"),
            other => panic!("expected an encode error, got {other:?}"),
        }
        assert!(!dir.path().join("out.mp3").exists());
    }
}
