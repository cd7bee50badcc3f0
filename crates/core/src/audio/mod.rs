use std::{fmt, fs, io::Cursor, ops::Range, path::Path, sync::Arc};

use rubato::{FftFixedIn, Resampler};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use tracing::{debug, warn};

use crate::{Result, StemEditError};

const RESAMPLE_CHUNK: usize = 1024;

/// Decoded PCM audio with interleaved `f32` samples.
///
/// Buffers are immutable: every operation allocates and returns a new buffer,
/// and clones share the underlying samples. This is what lets several edits
/// read the same stems from different worker threads without locking.
#[derive(Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    channels: u16,
    samples: Arc<[f32]>,
}

impl AudioBuffer {
    /// Wraps interleaved samples, validating the layout.
    pub fn from_interleaved(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Result<Self> {
        if channels == 0 {
            return Err(StemEditError::invalid_input("buffer needs at least one channel"));
        }
        if sample_rate == 0 {
            return Err(StemEditError::invalid_input("sample rate must be positive"));
        }
        if samples.len() % channels as usize != 0 {
            return Err(StemEditError::invalid_input(format!(
                "{} samples do not divide into {channels} channels",
                samples.len()
            )));
        }

        Ok(Self::from_parts(samples, channels, sample_rate))
    }

    /// A buffer of `frames` frames of digital silence.
    pub fn silence(frames: usize, channels: u16, sample_rate: u32) -> Self {
        let channels = channels.max(1);
        Self::from_parts(vec![0.0; frames * channels as usize], channels, sample_rate)
    }

    pub(crate) fn from_parts(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels,
            samples: samples.into(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Interleaved samples.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Nearest frame index for a time offset. Negative offsets clamp to zero.
    pub fn frame_at(&self, seconds: f64) -> usize {
        seconds_to_frames(seconds, self.sample_rate)
    }

    pub fn seconds_at(&self, frame: usize) -> f64 {
        frame as f64 / self.sample_rate as f64
    }

    /// Returns `true` when both buffers share sample rate and channel count.
    pub fn same_format(&self, other: &AudioBuffer) -> bool {
        self.sample_rate == other.sample_rate && self.channels == other.channels
    }

    /// Copies the region `[start, end)` given in seconds.
    pub fn slice(&self, start: f64, end: f64) -> Result<AudioBuffer> {
        let duration = self.duration_seconds();
        let range_error = StemEditError::Range {
            start,
            end,
            duration,
        };

        if !(start >= 0.0) || !(start < end) || !end.is_finite() {
            return Err(range_error);
        }

        let start_frame = self.frame_at(start);
        let end_frame = self.frame_at(end);
        if end_frame > self.frames() {
            return Err(range_error);
        }

        self.slice_frames(start_frame..end_frame)
    }

    /// Copies a frame range.
    pub fn slice_frames(&self, range: Range<usize>) -> Result<AudioBuffer> {
        if range.start > range.end || range.end > self.frames() {
            return Err(StemEditError::Range {
                start: self.seconds_at(range.start),
                end: self.seconds_at(range.end),
                duration: self.duration_seconds(),
            });
        }

        let channels = self.channels as usize;
        let samples = self.samples[range.start * channels..range.end * channels].to_vec();
        Ok(Self::from_parts(samples, self.channels, self.sample_rate))
    }

    /// Joins buffers end to end. All inputs must share one format.
    pub fn concat(buffers: &[AudioBuffer]) -> Result<AudioBuffer> {
        let first = buffers
            .first()
            .ok_or_else(|| StemEditError::invalid_input("concat requires at least one buffer"))?;

        if let Some(other) = buffers.iter().find(|buffer| !buffer.same_format(first)) {
            return Err(format_mismatch(first, other));
        }

        let total: usize = buffers.iter().map(|buffer| buffer.samples.len()).sum();
        let mut samples = Vec::with_capacity(total);
        for buffer in buffers {
            samples.extend_from_slice(&buffer.samples);
        }

        Ok(Self::from_parts(samples, first.channels, first.sample_rate))
    }

    /// Sums two equally sized buffers with independent linear gains.
    pub fn mix(a: &AudioBuffer, b: &AudioBuffer, gain_a: f32, gain_b: f32) -> Result<AudioBuffer> {
        if a.sample_rate != b.sample_rate {
            return Err(format_mismatch(a, b));
        }
        if a.channels != b.channels || a.frames() != b.frames() {
            return Err(StemEditError::LengthMismatch {
                left: a.samples.len(),
                right: b.samples.len(),
            });
        }

        let samples = a
            .samples
            .iter()
            .zip(b.samples.iter())
            .map(|(x, y)| x * gain_a + y * gain_b)
            .collect();

        Ok(Self::from_parts(samples, a.channels, a.sample_rate))
    }

    /// Scales every sample by `gain`.
    pub fn gain(&self, gain: f32) -> AudioBuffer {
        let samples = self.samples.iter().map(|sample| sample * gain).collect();
        Self::from_parts(samples, self.channels, self.sample_rate)
    }

    /// Extends the buffer with silence up to `frames` frames. Longer buffers
    /// are returned unchanged.
    pub fn padded_to(&self, frames: usize) -> AudioBuffer {
        if frames <= self.frames() {
            return self.clone();
        }

        let mut samples = self.samples.to_vec();
        samples.resize(frames * self.channels as usize, 0.0);
        Self::from_parts(samples, self.channels, self.sample_rate)
    }

    /// Absolute peak over the whole buffer.
    pub fn peak(&self) -> f32 {
        self.peak_in(0..self.frames())
    }

    /// Absolute peak over a frame range, clamped to the buffer.
    pub fn peak_in(&self, frames: Range<usize>) -> f32 {
        let channels = self.channels as usize;
        let end = frames.end.min(self.frames());
        let start = frames.start.min(end);
        self.samples[start * channels..end * channels]
            .iter()
            .fold(0.0_f32, |peak, sample| peak.max(sample.abs()))
    }

    /// Averages all channels into a single mono signal.
    pub fn to_mono(&self) -> Vec<f32> {
        let channels = self.channels as usize;
        if channels == 1 {
            return self.samples.to_vec();
        }

        self.samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }

    /// Converts to another channel count. Mono sources are duplicated, mono
    /// targets are averaged; other layout changes are rejected.
    pub fn with_channels(&self, channels: u16) -> Result<AudioBuffer> {
        if channels == self.channels {
            return Ok(self.clone());
        }

        if channels == 1 {
            return Ok(Self::from_parts(self.to_mono(), 1, self.sample_rate));
        }

        if self.channels == 1 {
            let samples = self
                .samples
                .iter()
                .flat_map(|&sample| std::iter::repeat(sample).take(channels as usize))
                .collect();
            return Ok(Self::from_parts(samples, channels, self.sample_rate));
        }

        Err(StemEditError::FormatMismatch(format!(
            "cannot convert {} channels to {channels}",
            self.channels
        )))
    }

    /// Converts to `target_rate`. The result has `round(frames * target / source)`
    /// frames with the resampler's latency removed.
    pub fn resample(&self, target_rate: u32) -> Result<AudioBuffer> {
        if target_rate == 0 {
            return Err(StemEditError::invalid_input("target sample rate must be positive"));
        }
        if target_rate == self.sample_rate {
            return Ok(self.clone());
        }

        let frames = self.frames();
        let channels = self.channels as usize;
        let expected =
            (frames as f64 * target_rate as f64 / self.sample_rate as f64).round() as usize;
        if frames == 0 {
            return Ok(Self::silence(0, self.channels, target_rate));
        }

        let mut resampler = FftFixedIn::<f32>::new(
            self.sample_rate as usize,
            target_rate as usize,
            RESAMPLE_CHUNK,
            2,
            channels,
        )?;
        let delay = resampler.output_delay();
        let planar = self.to_planar();
        let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + delay); channels];

        let mut position = 0;
        while position + resampler.input_frames_next() <= frames {
            let needed = resampler.input_frames_next();
            let chunk: Vec<&[f32]> = planar
                .iter()
                .map(|channel| &channel[position..position + needed])
                .collect();
            append_planar(&mut output, resampler.process(&chunk, None)?);
            position += needed;
        }

        if position < frames {
            let chunk: Vec<&[f32]> = planar.iter().map(|channel| &channel[position..]).collect();
            append_planar(&mut output, resampler.process_partial(Some(&chunk), None)?);
        }

        while output[0].len() < delay + expected {
            let flushed = resampler.process_partial(None::<&[Vec<f32>]>, None)?;
            if flushed.first().map(Vec::is_empty).unwrap_or(true) {
                break;
            }
            append_planar(&mut output, flushed);
        }

        let mut samples = Vec::with_capacity(expected * channels);
        for frame in 0..expected {
            for channel in &output {
                samples.push(channel.get(delay + frame).copied().unwrap_or(0.0));
            }
        }

        debug!(
            from = self.sample_rate,
            to = target_rate,
            frames_in = frames,
            frames_out = expected,
            "resampled buffer"
        );
        Ok(Self::from_parts(samples, self.channels, target_rate))
    }

    fn to_planar(&self) -> Vec<Vec<f32>> {
        let channels = self.channels as usize;
        let mut planar = vec![Vec::with_capacity(self.frames()); channels];
        for frame in self.samples.chunks_exact(channels) {
            for (channel, sample) in planar.iter_mut().zip(frame) {
                channel.push(*sample);
            }
        }
        planar
    }
}

impl fmt::Debug for AudioBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("frames", &self.frames())
            .finish()
    }
}

/// Nearest frame index for `seconds` at `sample_rate`.
pub fn seconds_to_frames(seconds: f64, sample_rate: u32) -> usize {
    if seconds <= 0.0 || !seconds.is_finite() {
        return 0;
    }
    (seconds * sample_rate as f64).round() as usize
}

/// Decodes an in-memory file. `extension` is a probe hint such as `"mp3"`.
pub fn decode(bytes: &[u8], extension: Option<&str>) -> Result<AudioBuffer> {
    let source = Cursor::new(bytes.to_vec());
    let stream = MediaSourceStream::new(Box::new(source), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = extension {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        stream,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|track| track.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| StemEditError::Decode("no audio track found".to_string()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| StemEditError::Decode("unknown sample rate".to_string()))?;
    let mut channels = track
        .codec_params
        .channels
        .map(|layout| layout.count() as u16)
        .unwrap_or(0);

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut samples = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(err) => return Err(err.into()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(reason)) => {
                warn!(reason, "skipping corrupt packet");
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        if sample_buf.is_none() {
            let spec = *decoded.spec();
            channels = spec.channels.count() as u16;
            sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
        }

        if let Some(buf) = sample_buf.as_mut() {
            buf.copy_interleaved_ref(decoded);
            samples.extend_from_slice(buf.samples());
        }
    }

    if samples.is_empty() || channels == 0 {
        return Err(StemEditError::Decode("stream contains no audio frames".to_string()));
    }

    let buffer = AudioBuffer::from_interleaved(samples, channels, sample_rate)
        .map_err(|err| StemEditError::Decode(err.to_string()))?;
    debug!(
        sample_rate,
        channels,
        frames = buffer.frames(),
        "decoded audio"
    );
    Ok(buffer)
}

/// Reads and decodes a file, using its extension as the probe hint.
pub fn decode_file(path: &Path) -> Result<AudioBuffer> {
    let bytes = fs::read(path)?;
    let extension = path.extension().and_then(|ext| ext.to_str());
    decode(&bytes, extension)
}

fn append_planar(output: &mut [Vec<f32>], chunk: Vec<Vec<f32>>) {
    for (channel, samples) in output.iter_mut().zip(chunk) {
        channel.extend(samples);
    }
}

fn format_mismatch(a: &AudioBuffer, b: &AudioBuffer) -> StemEditError {
    StemEditError::FormatMismatch(format!(
        "{} Hz/{} ch vs {} Hz/{} ch",
        a.sample_rate, a.channels, b.sample_rate, b.channels
    ))
}
