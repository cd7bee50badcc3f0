use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use rayon::{prelude::*, ThreadPool};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::{
    mixer::{self, FadeCurve},
    AudioBuffer, CueOverlay, CuePlacement, CueSample, EditKind, EditSpec, RenderConfig, Result, StemEditError,
    StemPair,
};

/// Tags attached to an exported edit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub genre: String,
    pub edit_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bpm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover: Option<PathBuf>,
}

impl TrackMetadata {
    /// `"<title> (<edit label>)"`.
    pub fn display_title(&self) -> String {
        format!("{} ({})", self.title, self.edit_label)
    }

    /// Display title with path separators and other reserved characters
    /// replaced, safe to use as a file name.
    pub fn file_stem(&self) -> String {
        self.display_title()
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .collect()
    }
}

/// One finished edit, ready for export.
#[derive(Debug, Clone)]
pub struct RenderedEdit {
    pub kind: EditKind,
    pub buffer: AudioBuffer,
    pub metadata: TrackMetadata,
    /// Where the cue sample landed, in seconds from the start of the edit.
    pub cue_offsets: Vec<f64>,
}

/// Job-wide cancellation signal, optionally with a deadline. Clones share
/// the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Fails with [`StemEditError::Cancelled`] once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StemEditError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Turns segment plans into audio for one stem pair.
#[derive(Debug, Clone)]
pub struct EditRenderer<'a> {
    stems: &'a StemPair,
    cue: &'a CueSample,
    impact: &'a CueSample,
    overlay: CueOverlay,
    curve: FadeCurve,
}

impl<'a> EditRenderer<'a> {
    /// `cue` is laid at each segment's cue offsets, `impact` at the start of
    /// segments flagged for it. Both must already match the stems' format.
    pub fn new(
        stems: &'a StemPair,
        cue: &'a CueSample,
        impact: &'a CueSample,
        config: &RenderConfig,
    ) -> Self {
        Self {
            stems,
            cue,
            impact,
            overlay: CueOverlay::new(config.cue_gain, config.cue_headroom_ratio),
            curve: FadeCurve::default(),
        }
    }

    pub fn with_curve(mut self, curve: FadeCurve) -> Self {
        self.curve = curve;
        self
    }

    /// Slices every segment from its stem, lays cues over it and stitches
    /// the parts together with the plan's fades.
    pub fn render(&self, spec: &EditSpec) -> Result<AudioBuffer> {
        let rate = self.stems.sample_rate();
        let parts = spec
            .plan
            .segments()
            .iter()
            .map(|segment| {
                let mut part = self
                    .stems
                    .source(segment.source)
                    .slice_frames(segment.frame_range(rate))?;
                if !segment.cues.is_empty() {
                    part = self.overlay.apply(&part, self.cue, &segment.cues)?;
                }
                if segment.impact {
                    part = self
                        .overlay
                        .apply(&part, self.impact, &CuePlacement::at_start())?;
                }
                Ok(part)
            })
            .collect::<Result<Vec<_>>>()?;

        let buffer = mixer::stitch(&parts, &spec.plan.boundary_fades(rate), self.curve)?;
        debug!(
            edit = spec.label(),
            frames = buffer.frames(),
            seconds = buffer.duration_seconds(),
            "edit rendered"
        );
        Ok(buffer)
    }
}

/// Result of rendering one edit; failures stay attached to their edit.
#[derive(Debug)]
pub struct RenderOutcome {
    pub kind: EditKind,
    pub result: Result<RenderedEdit>,
}

/// Renders every spec on `pool`. Each task checks `cancel` before it starts;
/// edits already rendering run to completion.
#[instrument(skip_all, fields(edits = specs.len()))]
pub fn render_all(
    pool: &ThreadPool,
    renderer: &EditRenderer<'_>,
    specs: &[EditSpec],
    metadata: &TrackMetadata,
    cancel: &CancelToken,
) -> Vec<RenderOutcome> {
    let rate = renderer.stems.sample_rate();
    pool.install(|| {
        specs
            .par_iter()
            .map(|spec| {
                let result = cancel.check().and_then(|()| {
                    let buffer = renderer.render(spec)?;
                    Ok(RenderedEdit {
                        kind: spec.kind,
                        buffer,
                        metadata: TrackMetadata {
                            edit_label: spec.label().to_string(),
                            ..metadata.clone()
                        },
                        cue_offsets: spec.plan.absolute_cues(rate),
                    })
                });

                match &result {
                    Ok(_) => info!(edit = spec.label(), "render finished"),
                    Err(StemEditError::Cancelled) => {
                        warn!(edit = spec.label(), "render skipped after cancellation")
                    }
                    Err(err) => warn!(edit = spec.label(), %err, "render failed"),
                }
                RenderOutcome {
                    kind: spec.kind,
                    result,
                }
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        timeline::{SegmentSelector, StructureMarkers, TrackStructure},
        Source,
    };

    const RATE: u32 = 1_000;

    fn stems(seconds: usize) -> StemPair {
        let frames = seconds * RATE as usize;
        let vocal: Vec<f32> = (0..frames).map(|i| 0.1 + (i % 7) as f32 * 0.01).collect();
        let inst: Vec<f32> = (0..frames).map(|i| -0.2 + (i % 5) as f32 * 0.01).collect();
        StemPair::new(
            AudioBuffer::from_interleaved(vocal, 1, RATE).unwrap(),
            AudioBuffer::from_interleaved(inst, 1, RATE).unwrap(),
        )
        .unwrap()
    }

    fn specs(config: &RenderConfig, duration: f64) -> Vec<EditSpec> {
        let markers = StructureMarkers {
            bpm: Some(120.0),
            drop_start: Some(20.0),
            ..Default::default()
        };
        let structure = TrackStructure::resolve(duration, &markers, None, config).unwrap();
        let selector = SegmentSelector::new(config);
        EditKind::ALL
            .into_iter()
            .map(|kind| EditSpec {
                kind,
                plan: selector.select(kind, &structure).unwrap(),
            })
            .collect()
    }

    fn metadata() -> TrackMetadata {
        TrackMetadata {
            title: "Night Drive".into(),
            artist: "Someone".into(),
            genre: "Techno".into(),
            edit_label: String::new(),
            bpm: Some(120.0),
            cover: None,
        }
    }

    #[test]
    fn rendered_length_matches_the_plan() {
        let config = RenderConfig::default();
        let stems = stems(90);
        let cue = CueSample::synthesized_clap(RATE, Some(0.5));
        let impact = CueSample::synthesized_impact(RATE);
        let renderer = EditRenderer::new(&stems, &cue, &impact, &config);

        for spec in specs(&config, 90.0) {
            let buffer = renderer.render(&spec).unwrap();
            assert_eq!(buffer.frames(), spec.plan.expected_frames(RATE), "{}", spec.label());
        }
    }

    #[test]
    fn cut_only_plans_reproduce_the_source_exactly() {
        let config = RenderConfig::default();
        let stems = stems(10);
        let cue = CueSample::synthesized_clap(RATE, None);
        let plan = crate::SegmentPlan::new(
            vec![
                crate::Segment {
                    source: Source::Vocal,
                    start: 0.0,
                    end: 4.0,
                    cues: crate::CuePlacement::empty(),
                    impact: false,
                    transition: crate::Transition::Cut,
                },
                crate::Segment {
                    source: Source::Vocal,
                    start: 4.0,
                    end: 10.0,
                    cues: crate::CuePlacement::empty(),
                    impact: false,
                    transition: crate::Transition::Cut,
                },
            ],
            10.0,
        )
        .unwrap();
        let spec = EditSpec {
            kind: EditKind::Main,
            plan,
        };
        let impact = CueSample::synthesized_impact(RATE);
        let buffer = EditRenderer::new(&stems, &cue, &impact, &config)
            .render(&spec)
            .unwrap();
        assert_eq!(&buffer, stems.vocal());
    }

    #[test]
    fn impact_only_touches_the_head_of_its_segment() {
        let config = RenderConfig::default();
        let stems = stems(4);
        let cue = CueSample::synthesized_clap(RATE, None);
        let impact = CueSample::synthesized_impact(RATE);
        let plan = crate::SegmentPlan::new(
            vec![crate::Segment {
                source: Source::Vocal,
                start: 0.0,
                end: 4.0,
                cues: crate::CuePlacement::empty(),
                impact: true,
                transition: crate::Transition::Cut,
            }],
            4.0,
        )
        .unwrap();
        let spec = EditSpec {
            kind: EditKind::Slam,
            plan,
        };

        let buffer = EditRenderer::new(&stems, &cue, &impact, &config)
            .render(&spec)
            .unwrap();
        let source = stems.vocal().samples();
        let head = RATE as usize;
        assert_eq!(buffer.frames(), stems.vocal().frames());
        assert_ne!(&buffer.samples()[..head], &source[..head]);
        assert_eq!(&buffer.samples()[head..], &source[head..]);
    }

    #[test]
    fn render_all_returns_one_outcome_per_edit() {
        let config = RenderConfig::default();
        let stems = stems(90);
        let cue = CueSample::synthesized_clap(RATE, Some(0.5));
        let impact = CueSample::synthesized_impact(RATE);
        let renderer = EditRenderer::new(&stems, &cue, &impact, &config);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let specs = specs(&config, 90.0);

        let outcomes = render_all(&pool, &renderer, &specs, &metadata(), &CancelToken::new());
        assert_eq!(outcomes.len(), specs.len());
        for outcome in &outcomes {
            let edit = outcome.result.as_ref().unwrap();
            assert_eq!(edit.metadata.edit_label, edit.kind.label());
        }
        let clap_in = outcomes
            .iter()
            .find(|outcome| outcome.kind == EditKind::ClapIn)
            .unwrap();
        assert_eq!(clap_in.result.as_ref().unwrap().cue_offsets.len(), 16);
    }

    #[test]
    fn cancelled_token_skips_every_edit() {
        let config = RenderConfig::default();
        let stems = stems(60);
        let cue = CueSample::synthesized_clap(RATE, Some(0.5));
        let impact = CueSample::synthesized_impact(RATE);
        let renderer = EditRenderer::new(&stems, &cue, &impact, &config);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let outcomes = render_all(&pool, &renderer, &specs(&config, 60.0), &metadata(), &cancel);
        assert!(outcomes
            .iter()
            .all(|outcome| matches!(outcome.result, Err(StemEditError::Cancelled))));
    }

    #[test]
    fn past_deadline_counts_as_cancelled() {
        let token = CancelToken::with_deadline(Instant::now());
        assert!(token.is_cancelled());
        assert!(!CancelToken::new().is_cancelled());
    }

    #[test]
    fn file_stem_strips_reserved_characters() {
        let metadata = TrackMetadata {
            title: "AC/DC: Live?".into(),
            edit_label: "Clap In".into(),
            ..metadata()
        };
        assert_eq!(metadata.display_title(), "AC/DC: Live? (Clap In)");
        assert_eq!(metadata.file_stem(), "AC_DC_ Live_ (Clap In)");
    }
}
