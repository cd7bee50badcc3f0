use std::f32::consts::FRAC_PI_2;

use serde::{Deserialize, Serialize};

use crate::{AudioBuffer, Result, StemEditError};

/// Gain law used across a crossfade window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FadeCurve {
    /// `cos θ` out, `sin θ` in; keeps perceived loudness steady.
    #[default]
    EqualPower,
    Linear,
}

impl FadeCurve {
    /// `(fade_out, fade_in)` gains at `position` in `[0, 1]`.
    pub fn gains(self, position: f32) -> (f32, f32) {
        let position = position.clamp(0.0, 1.0);
        match self {
            FadeCurve::EqualPower => {
                let theta = position * FRAC_PI_2;
                (theta.cos(), theta.sin())
            }
            FadeCurve::Linear => (1.0 - position, position),
        }
    }
}

/// Blends the last `fade_frames` of `a` with the first `fade_frames` of `b`.
///
/// The output holds `a.frames() + b.frames() - fade_frames` frames; samples
/// outside the overlap are copied through untouched.
pub fn crossfade(
    a: &AudioBuffer,
    b: &AudioBuffer,
    fade_frames: usize,
    curve: FadeCurve,
) -> Result<AudioBuffer> {
    if !a.same_format(b) {
        return Err(StemEditError::FormatMismatch(format!(
            "cannot crossfade {} Hz/{} ch into {} Hz/{} ch",
            a.sample_rate(),
            a.channels(),
            b.sample_rate(),
            b.channels()
        )));
    }
    if fade_frames == 0 || fade_frames > a.frames() || fade_frames > b.frames() {
        return Err(StemEditError::InvalidFadeWindow {
            fade: fade_frames,
            left: a.frames(),
            right: b.frames(),
        });
    }

    let channels = a.channels() as usize;
    let overlap_start = (a.frames() - fade_frames) * channels;
    let overlap_len = fade_frames * channels;

    let mut samples = Vec::with_capacity(a.samples().len() + b.samples().len() - overlap_len);
    samples.extend_from_slice(&a.samples()[..overlap_start]);

    let tail = &a.samples()[overlap_start..];
    let head = &b.samples()[..overlap_len];
    for frame in 0..fade_frames {
        // Sample at the centre of each frame so the curve is symmetric.
        let position = (frame as f32 + 0.5) / fade_frames as f32;
        let (out_gain, in_gain) = curve.gains(position);
        for channel in 0..channels {
            let index = frame * channels + channel;
            samples.push(tail[index] * out_gain + head[index] * in_gain);
        }
    }

    samples.extend_from_slice(&b.samples()[overlap_len..]);
    Ok(AudioBuffer::from_parts(samples, a.channels(), a.sample_rate()))
}

/// Joins buffers in order. `fades[i]` is the overlap in frames between
/// `parts[i]` and `parts[i + 1]`; zero means a hard cut.
pub fn stitch(parts: &[AudioBuffer], fades: &[usize], curve: FadeCurve) -> Result<AudioBuffer> {
    let (first, rest) = parts
        .split_first()
        .ok_or_else(|| StemEditError::invalid_input("nothing to stitch"))?;
    if fades.len() + 1 != parts.len() {
        return Err(StemEditError::invalid_input(format!(
            "{} parts need {} fades, got {}",
            parts.len(),
            parts.len() - 1,
            fades.len()
        )));
    }

    let mut output = first.clone();
    let mut pending = Vec::new();
    for (part, fade) in rest.iter().zip(fades) {
        if *fade == 0 {
            pending.push(part.clone());
            continue;
        }
        if !pending.is_empty() {
            pending.insert(0, output);
            output = AudioBuffer::concat(&pending)?;
            pending.clear();
        }
        output = crossfade(&output, part, *fade, curve)?;
    }

    if !pending.is_empty() {
        pending.insert(0, output);
        output = AudioBuffer::concat(&pending)?;
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(value: f32, frames: usize) -> AudioBuffer {
        AudioBuffer::from_interleaved(vec![value; frames * 2], 2, 1_000).unwrap()
    }

    #[test]
    fn equal_power_gains_meet_at_the_midpoint() {
        let (out, inn) = FadeCurve::EqualPower.gains(0.5);
        assert!((out - inn).abs() < 1e-6);
        assert!((out - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert!((out * out + inn * inn - 1.0).abs() < 1e-6);
    }

    #[test]
    fn output_length_drops_the_overlap() {
        let out = crossfade(&constant(1.0, 100), &constant(0.0, 50), 20, FadeCurve::EqualPower)
            .unwrap();
        assert_eq!(out.frames(), 130);
    }

    #[test]
    fn samples_outside_the_overlap_pass_through() {
        let a = constant(0.3, 10);
        let b = constant(-0.6, 10);
        let out = crossfade(&a, &b, 4, FadeCurve::Linear).unwrap();

        assert!(out.samples()[..12].iter().all(|s| *s == 0.3));
        assert!(out.samples()[20..].iter().all(|s| *s == -0.6));
        // Overlap moves monotonically from one level to the other.
        let overlap: Vec<f32> = out.samples()[12..20].iter().step_by(2).copied().collect();
        assert!(overlap.windows(2).all(|pair| pair[1] < pair[0]));
    }

    #[test]
    fn rejects_empty_or_oversized_windows() {
        let a = constant(0.0, 10);
        let b = constant(0.0, 5);
        for fade in [0, 6, 11] {
            let err = crossfade(&a, &b, fade, FadeCurve::EqualPower).unwrap_err();
            assert!(matches!(err, StemEditError::InvalidFadeWindow { .. }));
        }
    }

    #[test]
    fn stitch_mixes_cuts_and_fades() {
        let parts = [constant(0.1, 10), constant(0.2, 10), constant(0.3, 10)];
        let out = stitch(&parts, &[0, 5], FadeCurve::EqualPower).unwrap();
        assert_eq!(out.frames(), 25);
        assert_eq!(out.samples()[0], 0.1);
        assert_eq!(out.samples()[20], 0.2);
        assert_eq!(*out.samples().last().unwrap(), 0.3);
    }
}
