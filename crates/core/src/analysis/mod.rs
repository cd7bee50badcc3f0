use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{AudioBuffer, Result, StemPair};

/// Tempo used when the signal carries no usable pulse.
pub const DEFAULT_BPM: f64 = 120.0;

const FRAME_SIZE: usize = 1024;
const HOP_SIZE: usize = 512;
const MIN_BPM: f64 = 70.0;
const MAX_BPM: f64 = 180.0;
const MAX_TEMPO_SECONDS: f64 = 120.0;
const DROP_SKIP_SECONDS: f64 = 15.0;
const DROP_SKIP_MIN_DURATION: f64 = 45.0;
const DROP_SEARCH_SECONDS: f64 = 240.0;

/// Structural facts derived from the stems.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackAnalysis {
    pub bpm: f64,
    /// Start of the loudest phrase of the instrumental, in seconds.
    pub drop_start: f64,
}

impl TrackAnalysis {
    pub fn beat_seconds(&self) -> f64 {
        60.0 / self.bpm
    }
}

/// Offline tempo and drop detector. Keeps its FFT plan between calls so a
/// batch of tracks only plans once.
pub struct TrackAnalyzer {
    fft_planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

impl Default for TrackAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackAnalyzer {
    pub fn new() -> Self {
        Self {
            fft_planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    /// Detects tempo from the full mix and the drop from the instrumental.
    #[instrument(skip_all, fields(duration = stems.duration_seconds()))]
    pub fn analyse(&mut self, stems: &StemPair, phrase_beats: u32) -> Result<TrackAnalysis> {
        let bpm = self.estimate_bpm(stems.full_mix())?;
        let drop_start = find_drop_start(stems.instrumental(), 60.0 / bpm, phrase_beats);
        debug!(bpm, drop_start, "track analysed");
        Ok(TrackAnalysis { bpm, drop_start })
    }

    /// Estimates the tempo in whole BPM from the first two minutes of audio.
    /// Falls back to [`DEFAULT_BPM`] for short or silent input.
    pub fn estimate_bpm(&mut self, buffer: &AudioBuffer) -> Result<f64> {
        let mono = buffer.to_mono();
        let limit = buffer.frame_at(MAX_TEMPO_SECONDS).min(mono.len());
        let envelope = self.onset_envelope(&mono[..limit])?;
        let envelope_rate = buffer.sample_rate() as f64 / HOP_SIZE as f64;

        Ok(tempo_from_envelope(&envelope, envelope_rate).unwrap_or(DEFAULT_BPM))
    }

    /// Spectral flux of successive Hann-windowed frames.
    fn onset_envelope(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        if samples.len() < FRAME_SIZE {
            return Ok(Vec::new());
        }

        let fft = self.prepare_fft(FRAME_SIZE);
        let bins = fft.spectrum.len();
        let mut previous = vec![0.0_f32; bins];
        let mut magnitudes = vec![0.0_f32; bins];
        let mut envelope = Vec::with_capacity(samples.len() / HOP_SIZE);

        for start in (0..=samples.len() - FRAME_SIZE).step_by(HOP_SIZE) {
            for (index, value) in samples[start..start + FRAME_SIZE].iter().enumerate() {
                fft.input[index] = *value * hann_value(index, FRAME_SIZE);
            }

            fft.plan
                .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

            let mut flux = 0.0;
            for (magnitude, bin) in magnitudes.iter_mut().zip(fft.spectrum.iter()) {
                *magnitude = bin.norm();
            }
            for (current, last) in magnitudes.iter().zip(previous.iter()) {
                flux += (current - last).max(0.0);
            }
            envelope.push(flux);
            std::mem::swap(&mut previous, &mut magnitudes);
        }

        Ok(envelope)
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        let fft = match self.fft.take() {
            Some(fft) if fft.size == size => fft,
            _ => FftResources::plan(&mut self.fft_planner, size),
        };
        self.fft.insert(fft)
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl FftResources {
    fn plan(planner: &mut RealFftPlanner<f32>, size: usize) -> Self {
        let plan = planner.plan_fft_forward(size);
        Self {
            size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        }
    }
}

impl fmt::Debug for TrackAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackAnalyzer")
            .field("fft", &self.fft)
            .finish()
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.size)
            .finish()
    }
}

/// Autocorrelates the onset envelope over the DJ tempo range and returns the
/// strongest period, rounded to whole BPM.
fn tempo_from_envelope(envelope: &[f32], envelope_rate: f64) -> Option<f64> {
    let min_lag = (60.0 * envelope_rate / MAX_BPM).floor().max(1.0) as usize;
    let max_lag = (60.0 * envelope_rate / MIN_BPM).ceil() as usize;
    if envelope.len() < max_lag * 2 {
        return None;
    }

    let mean = envelope.iter().sum::<f32>() / envelope.len() as f32;
    let centred: Vec<f32> = envelope.iter().map(|value| value - mean).collect();
    let energy: f32 = centred.iter().map(|value| value * value).sum();
    if energy <= f32::EPSILON {
        return None;
    }

    let correlation: Vec<f32> = (0..=max_lag + 1)
        .map(|lag| {
            if lag < min_lag.saturating_sub(1) {
                return 0.0;
            }
            let sum: f32 = centred
                .iter()
                .zip(&centred[lag..])
                .map(|(a, b)| a * b)
                .sum();
            sum / (centred.len() - lag) as f32
        })
        .collect();

    let best = (min_lag..=max_lag).max_by(|&a, &b| correlation[a].total_cmp(&correlation[b]))?;
    if correlation[best] <= 0.0 {
        return None;
    }

    // Parabolic interpolation around the peak for sub-frame lag precision.
    let (left, centre, right) = (
        correlation[best - 1] as f64,
        correlation[best] as f64,
        correlation[best + 1] as f64,
    );
    let denominator = left - 2.0 * centre + right;
    let offset = if denominator.abs() > f64::EPSILON {
        (0.5 * (left - right) / denominator).clamp(-0.5, 0.5)
    } else {
        0.0
    };

    let lag = best as f64 + offset;
    Some((60.0 * envelope_rate / lag).round())
}

/// Finds the start of the loudest `phrase_beats` window of `buffer`, stepping
/// one beat at a time. The first 15 s are skipped on tracks longer than 45 s
/// so loud intros do not win, and at most four minutes are searched.
pub fn find_drop_start(buffer: &AudioBuffer, beat_seconds: f64, phrase_beats: u32) -> f64 {
    let mono = buffer.to_mono();
    let sample_rate = buffer.sample_rate();

    let offset = if buffer.duration_seconds() > DROP_SKIP_MIN_DURATION {
        buffer.frame_at(DROP_SKIP_SECONDS)
    } else {
        0
    };
    let analysed = &mono[offset.min(mono.len())..];

    let window = crate::audio::seconds_to_frames(beat_seconds * phrase_beats as f64, sample_rate);
    let step = crate::audio::seconds_to_frames(beat_seconds, sample_rate).max(1);
    if window == 0 || analysed.len() < window {
        return 0.0;
    }

    let mut prefix = Vec::with_capacity(analysed.len() + 1);
    prefix.push(0.0_f64);
    let mut running = 0.0_f64;
    for sample in analysed {
        running += (*sample as f64) * (*sample as f64);
        prefix.push(running);
    }

    let search_limit = crate::audio::seconds_to_frames(DROP_SEARCH_SECONDS, sample_rate);
    let last_start = (analysed.len() - window).min(search_limit);

    let mut best_start = 0;
    let mut best_energy = -1.0;
    for start in (0..=last_start).step_by(step) {
        let energy = prefix[start + window] - prefix[start];
        if energy > best_energy {
            best_energy = energy;
            best_start = start;
        }
    }

    buffer.seconds_at(best_start + offset)
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}
