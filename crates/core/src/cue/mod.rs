use std::{f32::consts::PI, path::Path};

use rand::Rng;
use rand_pcg::Pcg32;
use tracing::debug;

use crate::{audio, AudioBuffer, CuePlacement, Result, StemEditError};

const MAX_CUE_SECONDS: f64 = 1.0;
const CUE_FADE_SECONDS: f64 = 0.05;
const CLAP_SECONDS: f64 = 0.2;
const CLAP_HIGH_PASS_HZ: f32 = 800.0;
const CLAP_SEED: u64 = 0x636c_6170;
const IMPACT_SECONDS: f64 = 1.0;
const IMPACT_TONE_HZ: f32 = 60.0;
const IMPACT_LOW_PASS_HZ: f32 = 500.0;
const IMPACT_SEED: u64 = 0x696d_7061;
const SYNTH_PEAK: f32 = 0.9;
/// Combined peak the overlay aims to stay under.
const CEILING: f32 = 0.99;

/// The percussive sample laid over edits, usually a clap.
#[derive(Debug, Clone, PartialEq)]
pub struct CueSample {
    buffer: AudioBuffer,
}

impl CueSample {
    /// Uses a decoded sample, trimming anything past one second with a short
    /// fade so the tail does not click.
    pub fn from_buffer(buffer: AudioBuffer) -> Result<Self> {
        if buffer.is_empty() {
            return Err(StemEditError::invalid_input("cue sample is empty"));
        }
        if buffer.duration_seconds() <= MAX_CUE_SECONDS {
            return Ok(Self { buffer });
        }

        let trimmed = buffer.slice_frames(0..buffer.frame_at(MAX_CUE_SECONDS))?;
        Ok(Self {
            buffer: fade_out_tail(&trimmed, CUE_FADE_SECONDS),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_buffer(audio::decode_file(path)?)
    }

    /// Deterministic synthetic clap: a high-passed noise burst with an
    /// exponential decay. `beat_seconds` caps the length at half a beat.
    pub fn synthesized_clap(sample_rate: u32, beat_seconds: Option<f64>) -> Self {
        let seconds = beat_seconds
            .map(|beat| (beat / 2.0).min(CLAP_SECONDS))
            .unwrap_or(CLAP_SECONDS);
        let frames = audio::seconds_to_frames(seconds, sample_rate).max(1);
        let mut rng = Pcg32::new(CLAP_SEED, 0xa02b_dbf7_bb3c_0a7);

        let dt = 1.0 / sample_rate as f32;
        let rc = 1.0 / (2.0 * PI * CLAP_HIGH_PASS_HZ);
        let alpha = rc / (rc + dt);
        let decay = frames as f32 / 5.0;

        let mut samples = Vec::with_capacity(frames);
        let (mut last_in, mut last_out) = (0.0_f32, 0.0_f32);
        for index in 0..frames {
            let noise: f32 = rng.gen_range(-1.0..1.0);
            let envelope = (-(index as f32) / decay).exp();
            let input = noise * envelope;
            let output = alpha * (last_out + input - last_in);
            last_in = input;
            last_out = output;
            samples.push(output);
        }

        Self {
            buffer: AudioBuffer::from_parts(normalise(samples), 1, sample_rate),
        }
    }

    /// Deterministic synthetic impact for slamming into a drop: a 60 Hz tone
    /// fading out over one second, under a low-passed noise burst half as
    /// long.
    pub fn synthesized_impact(sample_rate: u32) -> Self {
        let frames = audio::seconds_to_frames(IMPACT_SECONDS, sample_rate).max(1);
        let burst = (frames / 2).max(1);
        let mut rng = Pcg32::new(IMPACT_SEED, 0xa02b_dbf7_bb3c_0a7);

        let dt = 1.0 / sample_rate as f32;
        let rc = 1.0 / (2.0 * PI * IMPACT_LOW_PASS_HZ);
        let alpha = dt / (rc + dt);

        let mut samples = Vec::with_capacity(frames);
        let mut low = 0.0_f32;
        for index in 0..frames {
            let tone_env = 1.0 - index as f32 / frames as f32;
            let tone = (2.0 * PI * IMPACT_TONE_HZ * index as f32 * dt).sin() * tone_env;

            let noise = if index < burst {
                let raw: f32 = rng.gen_range(-1.0..1.0);
                low += alpha * (raw * (1.0 - index as f32 / burst as f32) - low);
                low
            } else {
                0.0
            };
            samples.push(tone + noise);
        }

        Self {
            buffer: AudioBuffer::from_parts(normalise(samples), 1, sample_rate),
        }
    }

    /// Converts the sample to the given rate and channel count.
    pub fn conform(&self, sample_rate: u32, channels: u16) -> Result<Self> {
        let buffer = self.buffer.resample(sample_rate)?.with_channels(channels)?;
        Ok(Self { buffer })
    }

    pub fn buffer(&self) -> &AudioBuffer {
        &self.buffer
    }

    pub fn duration_seconds(&self) -> f64 {
        self.buffer.duration_seconds()
    }
}

fn normalise(mut samples: Vec<f32>) -> Vec<f32> {
    let peak = samples.iter().fold(0.0_f32, |peak, s| peak.max(s.abs()));
    if peak > f32::EPSILON {
        for sample in &mut samples {
            *sample *= SYNTH_PEAK / peak;
        }
    }
    samples
}

fn fade_out_tail(buffer: &AudioBuffer, seconds: f64) -> AudioBuffer {
    let channels = buffer.channels() as usize;
    let frames = buffer.frames();
    let fade = buffer.frame_at(seconds).min(frames).max(1);
    let mut samples = buffer.samples().to_vec();
    for (frame, chunk) in samples.chunks_exact_mut(channels).enumerate() {
        if frame + fade >= frames {
            let gain = (frames - frame - 1) as f32 / fade as f32;
            chunk.iter_mut().for_each(|sample| *sample *= gain);
        }
    }
    AudioBuffer::from_parts(samples, buffer.channels(), buffer.sample_rate())
}

/// Linear gains used for one cue hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CueGains {
    pub cue: f32,
    pub bed: f32,
}

/// Mixes cue hits into a bed at given offsets, level-matched to the bed.
#[derive(Debug, Clone, Copy)]
pub struct CueOverlay {
    nominal_gain: f32,
    headroom_ratio: f32,
}

impl CueOverlay {
    pub fn new(nominal_gain: f32, headroom_ratio: f32) -> Self {
        Self {
            nominal_gain: nominal_gain.max(0.0),
            headroom_ratio: headroom_ratio.max(0.0),
        }
    }

    /// The cue peak may not exceed `headroom_ratio` times the bed's local peak.
    /// When bed and cue together would pass the ceiling both are scaled down.
    pub fn gains(&self, cue_peak: f32, bed_peak: f32) -> CueGains {
        if cue_peak <= f32::EPSILON {
            return CueGains { cue: 0.0, bed: 1.0 };
        }

        let allowed = self.headroom_ratio * bed_peak / cue_peak;
        let cue = self.nominal_gain.min(allowed);
        let combined = bed_peak + cue_peak * cue;
        let scale = if combined > CEILING {
            CEILING / combined
        } else {
            1.0
        };
        CueGains {
            cue: cue * scale,
            bed: scale,
        }
    }

    /// Returns a copy of `bed` with the cue mixed in at each offset. Hits that
    /// run past the end are truncated; hits starting past the end add nothing.
    pub fn apply(
        &self,
        bed: &AudioBuffer,
        cue: &CueSample,
        placement: &CuePlacement,
    ) -> Result<AudioBuffer> {
        let cue = cue.buffer();
        if !bed.same_format(cue) {
            return Err(StemEditError::FormatMismatch(format!(
                "cue is {} Hz/{} ch but bed is {} Hz/{} ch",
                cue.sample_rate(),
                cue.channels(),
                bed.sample_rate(),
                bed.channels()
            )));
        }
        if placement.is_empty() {
            return Ok(bed.clone());
        }

        let channels = bed.channels() as usize;
        let frames = bed.frames();
        let cue_peak = cue.peak();
        let mut cue_layer = vec![0.0_f32; frames * channels];
        let mut bed_gain = vec![1.0_f32; frames];
        let mut placed = 0;

        for offset in placement.offsets() {
            let start = bed.frame_at(*offset);
            if start >= frames {
                debug!(offset, "cue starts past the end of the bed, skipping");
                continue;
            }
            let length = cue.frames().min(frames - start);
            let gains = self.gains(cue_peak, bed.peak_in(start..start + length));

            for frame in 0..length {
                let target = (start + frame) * channels;
                let source = frame * channels;
                for channel in 0..channels {
                    cue_layer[target + channel] += cue.samples()[source + channel] * gains.cue;
                }
                bed_gain[start + frame] = bed_gain[start + frame].min(gains.bed);
            }
            placed += 1;
        }

        let samples = bed
            .samples()
            .chunks_exact(channels)
            .zip(bed_gain.iter())
            .flat_map(|(frame, gain)| frame.iter().map(move |sample| sample * gain))
            .zip(cue_layer)
            .map(|(bed, cue)| bed + cue)
            .collect();

        debug!(placed, requested = placement.len(), "cue overlay applied");
        Ok(AudioBuffer::from_parts(samples, bed.channels(), bed.sample_rate()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bed(value: f32, frames: usize) -> AudioBuffer {
        AudioBuffer::from_interleaved(vec![value; frames * 2], 2, 1_000).unwrap()
    }

    fn impulse() -> CueSample {
        let samples = vec![1.0, 1.0, 0.5, 0.5];
        CueSample::from_buffer(AudioBuffer::from_interleaved(samples, 2, 1_000).unwrap()).unwrap()
    }

    #[test]
    fn cue_beyond_the_bed_is_truncated_to_nothing() {
        let bed = bed(0.2, 100);
        let placement = CuePlacement::new(vec![0.5]).unwrap();
        let out = CueOverlay::new(1.0, 1.0)
            .apply(&bed, &impulse(), &placement)
            .unwrap();
        assert_eq!(out, bed);
    }

    #[test]
    fn cue_running_past_the_end_keeps_bed_length() {
        let bed = bed(0.2, 100);
        let placement = CuePlacement::new(vec![0.099]).unwrap();
        let out = CueOverlay::new(1.0, 1.0)
            .apply(&bed, &impulse(), &placement)
            .unwrap();
        assert_eq!(out.frames(), 100);
        assert!(out.samples()[99 * 2] > 0.2);
    }

    #[test]
    fn cue_peak_respects_headroom() {
        let overlay = CueOverlay::new(1.0, 1.0);
        let gains = overlay.gains(1.0, 0.3);
        assert!((gains.cue - 0.3).abs() < 1e-6);
        assert_eq!(gains.bed, 1.0);

        let loud = overlay.gains(1.0, 0.9);
        assert!(loud.bed < 1.0);
        assert!(0.9 * loud.bed + loud.cue <= CEILING + 1e-6);
        assert!(loud.cue <= 0.9 * loud.bed + 1e-6);
    }

    #[test]
    fn quiet_beds_keep_the_cue_under_their_peak() {
        let overlay = CueOverlay::new(1.0, 1.0);
        assert!(overlay.gains(1.0, 0.01).cue <= 0.01 + 1e-6);
        assert_eq!(overlay.gains(1.0, 0.0).cue, 0.0);

        let doubled = CueOverlay::new(1.0, 2.0).gains(0.5, 0.01);
        assert!(doubled.cue * 0.5 <= 0.02 + 1e-6);
    }

    #[test]
    fn overlay_mixes_at_offsets_without_touching_input() {
        let bed = bed(0.2, 10);
        let placement = CuePlacement::new(vec![0.0, 0.005]).unwrap();
        let out = CueOverlay::new(1.0, 1.0)
            .apply(&bed, &impulse(), &placement)
            .unwrap();

        assert!((out.samples()[0] - 0.4).abs() < 1e-6);
        assert!((out.samples()[2] - 0.3).abs() < 1e-6);
        assert!((out.samples()[10] - 0.4).abs() < 1e-6);
        assert!((out.samples()[8] - 0.2).abs() < 1e-6);
        assert!(bed.samples().iter().all(|s| (*s - 0.2).abs() < f32::EPSILON));
    }

    #[test]
    fn rejects_mismatched_formats() {
        let mono = AudioBuffer::silence(10, 1, 1_000);
        let err = CueOverlay::new(1.0, 1.0)
            .apply(&mono, &impulse(), &CuePlacement::new(vec![0.0]).unwrap())
            .unwrap_err();
        assert!(matches!(err, StemEditError::FormatMismatch(_)));
    }

    #[test]
    fn synthesized_clap_is_short_and_normalised() {
        let clap = CueSample::synthesized_clap(44_100, Some(0.25));
        assert!((clap.duration_seconds() - 0.125).abs() < 1e-3);
        assert!((clap.buffer().peak() - 0.9).abs() < 1e-4);
        assert_eq!(clap, CueSample::synthesized_clap(44_100, Some(0.25)));
    }

    #[test]
    fn synthesized_impact_is_a_second_long_and_repeatable() {
        let impact = CueSample::synthesized_impact(8_000);
        assert_eq!(impact.buffer().frames(), 8_000);
        assert_eq!(impact.buffer().channels(), 1);
        assert!((impact.buffer().peak() - 0.9).abs() < 1e-4);
        assert_eq!(impact, CueSample::synthesized_impact(8_000));

        // The noise burst stops halfway, leaving only the fading tone.
        let tail = impact.buffer().peak_in(6_000..8_000);
        let head = impact.buffer().peak_in(0..2_000);
        assert!(tail < head);
    }

    #[test]
    fn long_samples_are_trimmed_to_a_second() {
        let long = AudioBuffer::from_interleaved(vec![0.5; 3_000], 1, 1_000).unwrap();
        let cue = CueSample::from_buffer(long).unwrap();
        assert_eq!(cue.buffer().frames(), 1_000);
        assert_eq!(*cue.buffer().samples().last().unwrap(), 0.0);
    }
}
