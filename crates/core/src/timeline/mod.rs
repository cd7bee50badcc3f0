use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    audio::seconds_to_frames, EditKind, RenderConfig, Result, Source, StemEditError,
    TrackAnalysis,
};

const EPSILON: f64 = 1e-9;

/// Structural markers a caller may supply for a track, in seconds. Anything
/// left unset is detected or derived from fixed fractions of the duration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructureMarkers {
    pub bpm: Option<f64>,
    /// End of the intro, which is also where the body starts.
    pub intro_end: Option<f64>,
    /// Start of the outro, which is also where the body ends.
    pub outro_start: Option<f64>,
    pub drop_start: Option<f64>,
    pub drop_end: Option<f64>,
}

/// Fully resolved structure of a track. All points lie inside
/// `[0, duration]` and `drop_start < drop_end`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackStructure {
    pub duration: f64,
    pub intro_end: f64,
    pub outro_start: f64,
    pub drop_start: f64,
    pub drop_end: f64,
    pub beat_seconds: f64,
}

impl TrackStructure {
    /// Merges caller markers, optional analysis and the fractional fallback.
    /// Markers always win over analysis.
    pub fn resolve(
        duration: f64,
        markers: &StructureMarkers,
        analysis: Option<&TrackAnalysis>,
        config: &RenderConfig,
    ) -> Result<Self> {
        if !(duration > 0.0) || !duration.is_finite() {
            return Err(StemEditError::invalid_input(format!(
                "track duration must be positive, got {duration}"
            )));
        }

        let clamp = |value: f64| value.clamp(0.0, duration);
        let phrase_beats = config.phrase_beats.max(1) as f64;

        let beat = markers
            .bpm
            .or(analysis.map(|analysis| analysis.bpm))
            .filter(|bpm| *bpm > 0.0)
            .map(|bpm| 60.0 / bpm);
        let phrase = beat.map(|beat| beat * phrase_beats);

        // A beat-based phrase only makes sense when it fits twice into the track.
        let edge = |fraction: f64| match phrase {
            Some(phrase) if phrase * 2.0 < duration => phrase,
            _ => duration * fraction,
        };

        let intro_end = clamp(markers.intro_end.unwrap_or_else(|| edge(config.intro_fraction)));
        let outro_start = clamp(
            markers
                .outro_start
                .unwrap_or_else(|| duration - edge(config.outro_fraction)),
        )
        .max(intro_end);

        let mut drop_start = clamp(
            markers
                .drop_start
                .or(analysis.map(|analysis| analysis.drop_start))
                .unwrap_or(intro_end),
        );
        if drop_start >= duration {
            drop_start = 0.0;
        }

        let default_drop_len = match phrase {
            Some(phrase) => phrase,
            None => (outro_start - intro_end) * config.body_fraction_short,
        };
        let mut drop_end = clamp(
            markers
                .drop_end
                .unwrap_or(drop_start + default_drop_len),
        );
        if drop_end <= drop_start + EPSILON {
            drop_end = duration;
        }

        let beat_seconds = beat.unwrap_or((drop_end - drop_start) / phrase_beats);

        Ok(Self {
            duration,
            intro_end,
            outro_start,
            drop_start,
            drop_end,
            beat_seconds,
        })
    }
}

/// How a segment joins the one after it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Transition {
    Cut,
    Crossfade { seconds: f64 },
}

impl Transition {
    pub fn fade_seconds(&self) -> f64 {
        match self {
            Transition::Cut => 0.0,
            Transition::Crossfade { seconds } => *seconds,
        }
    }
}

/// Offsets, in seconds from the start of a segment, where the cue sample is
/// mixed in. Offsets are finite, non-negative and strictly increasing, so a
/// placement never inserts the cue twice at one point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CuePlacement {
    offsets: Vec<f64>,
}

impl CuePlacement {
    pub fn new(offsets: Vec<f64>) -> Result<Self> {
        if offsets.iter().any(|offset| !offset.is_finite() || *offset < 0.0) {
            return Err(StemEditError::invalid_input(
                "cue offsets must be finite and non-negative",
            ));
        }
        if offsets.windows(2).any(|pair| pair[1] <= pair[0]) {
            return Err(StemEditError::invalid_input(
                "cue offsets must be strictly increasing",
            ));
        }
        Ok(Self { offsets })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// A single hit at offset zero.
    pub fn at_start() -> Self {
        Self { offsets: vec![0.0] }
    }

    /// `count` cues spaced `interval` apart, keeping only those before `limit`.
    pub fn every(interval: f64, count: u32, limit: f64) -> Self {
        if !(interval > 0.0) {
            return Self::empty();
        }
        let offsets = (0..count)
            .map(|index| index as f64 * interval)
            .take_while(|offset| *offset < limit)
            .collect();
        Self { offsets }
    }

    pub fn offsets(&self) -> &[f64] {
        &self.offsets
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }
}

/// One region of one stem inside an edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub source: Source,
    pub start: f64,
    pub end: f64,
    #[serde(default, skip_serializing_if = "CuePlacement::is_empty")]
    pub cues: CuePlacement,
    /// Lays the impact sample over the first frames of the segment.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub impact: bool,
    /// Transition into the following segment; always a cut on the last one.
    pub transition: Transition,
}

impl Segment {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn frame_range(&self, sample_rate: u32) -> Range<usize> {
        seconds_to_frames(self.start, sample_rate)..seconds_to_frames(self.end, sample_rate)
    }
}

/// Ordered segments that make up one edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentPlan {
    segments: Vec<Segment>,
}

impl SegmentPlan {
    /// Validates a plan against a stem of `stem_duration` seconds: segments
    /// are non-empty and in bounds, cues sit inside their segment, and every
    /// fade fits in what is left of both neighbours.
    pub fn new(segments: Vec<Segment>, stem_duration: f64) -> Result<Self> {
        if segments.is_empty() {
            return Err(StemEditError::invalid_input("a plan needs at least one segment"));
        }

        let mut incoming = 0.0;
        for (index, segment) in segments.iter().enumerate() {
            if !(segment.start >= 0.0)
                || !(segment.start < segment.end)
                || segment.end > stem_duration + EPSILON
            {
                return Err(StemEditError::Range {
                    start: segment.start,
                    end: segment.end,
                    duration: stem_duration,
                });
            }

            if let Some(last) = segment.cues.offsets().last() {
                if *last >= segment.duration() {
                    return Err(StemEditError::invalid_input(format!(
                        "cue at {last:.3}s lies outside a {:.3}s segment",
                        segment.duration()
                    )));
                }
            }

            let fade = segment.transition.fade_seconds();
            match segments.get(index + 1) {
                None if fade > 0.0 => {
                    return Err(StemEditError::invalid_input(
                        "the last segment cannot fade into anything",
                    ));
                }
                Some(next) => {
                    let available = segment.duration() - incoming;
                    if matches!(segment.transition, Transition::Crossfade { .. })
                        && (!(fade > 0.0)
                            || fade > available + EPSILON
                            || fade > next.duration() + EPSILON)
                    {
                        return Err(StemEditError::invalid_input(format!(
                            "fade of {fade:.3}s does not fit between segments {index} and {}",
                            index + 1
                        )));
                    }
                }
                None => {}
            }
            incoming = fade;
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Rendered length in seconds: segment lengths minus fade overlaps.
    pub fn duration_seconds(&self) -> f64 {
        let total: f64 = self.segments.iter().map(Segment::duration).sum();
        let overlap: f64 = self
            .segments
            .iter()
            .map(|segment| segment.transition.fade_seconds())
            .sum();
        total - overlap
    }

    /// Fade length in frames at each boundary (`segments.len() - 1` entries),
    /// clamped so no fade reaches past its neighbours' frames.
    pub fn boundary_fades(&self, sample_rate: u32) -> Vec<usize> {
        let lengths: Vec<usize> = self
            .segments
            .iter()
            .map(|segment| segment.frame_range(sample_rate).len())
            .collect();

        let mut incoming = 0;
        self.segments
            .windows(2)
            .enumerate()
            .map(|(index, pair)| {
                let wanted = seconds_to_frames(pair[0].transition.fade_seconds(), sample_rate);
                let fade = wanted
                    .min(lengths[index].saturating_sub(incoming))
                    .min(lengths[index + 1]);
                incoming = fade;
                fade
            })
            .collect()
    }

    /// Exact number of frames a render of this plan produces.
    pub fn expected_frames(&self, sample_rate: u32) -> usize {
        let total: usize = self
            .segments
            .iter()
            .map(|segment| segment.frame_range(sample_rate).len())
            .sum();
        total - self.boundary_fades(sample_rate).iter().sum::<usize>()
    }

    /// Cue offsets relative to the start of the rendered edit.
    pub fn absolute_cues(&self, sample_rate: u32) -> Vec<f64> {
        let fades = self.boundary_fades(sample_rate);
        let mut cursor = 0usize;
        let mut cues = Vec::new();
        for (index, segment) in self.segments.iter().enumerate() {
            let origin = cursor as f64 / sample_rate as f64;
            cues.extend(segment.cues.offsets().iter().map(|offset| origin + offset));
            cursor += segment.frame_range(sample_rate).len();
            cursor -= fades.get(index).copied().unwrap_or(0);
        }
        cues
    }
}

#[derive(Debug, Clone, Copy)]
enum Join {
    Cut,
    Fade,
}

struct Region {
    source: Source,
    start: f64,
    end: f64,
    cues: CuePlacement,
    impact: bool,
    join: Join,
}

fn region(source: Source, start: f64, end: f64, join: Join) -> Region {
    Region {
        source,
        start,
        end,
        cues: CuePlacement::empty(),
        impact: false,
        join,
    }
}

/// Turns an edit name and a track structure into a concrete [`SegmentPlan`].
#[derive(Debug, Clone)]
pub struct SegmentSelector {
    crossfade_seconds: f64,
    min_crossfade_seconds: f64,
    lead_in_beats: u32,
    phrase_beats: u32,
    slam_cue_every: u32,
}

impl SegmentSelector {
    pub fn new(config: &RenderConfig) -> Self {
        Self {
            crossfade_seconds: config.crossfade_seconds.max(0.0),
            min_crossfade_seconds: config.min_crossfade_seconds.max(0.0),
            lead_in_beats: config.lead_in_beats.max(1),
            phrase_beats: config.phrase_beats.max(1),
            slam_cue_every: 4,
        }
    }

    /// Looks an edit up by name. Fails with `UnknownEditType` outside the catalog.
    pub fn select_named(&self, name: &str, structure: &TrackStructure) -> Result<SegmentPlan> {
        let kind: EditKind = name.parse()?;
        self.select(kind, structure)
    }

    pub fn select(&self, kind: EditKind, structure: &TrackStructure) -> Result<SegmentPlan> {
        use Join::{Cut, Fade};
        use Source::{Full, Instrumental, Vocal};

        let s = structure;
        let beat = s.beat_seconds;
        let lead_in = (self.lead_in_beats as f64 * beat).min(s.drop_end - s.drop_start);
        let lead_end = s.drop_start + lead_in;
        let break_start = (s.drop_start - lead_in).max(0.0);

        let clap_lead_in = || Region {
            cues: CuePlacement::every(beat, self.lead_in_beats, lead_in),
            ..region(Instrumental, s.drop_start, lead_end, Fade)
        };
        let drop_outro = || region(Instrumental, s.drop_start, s.drop_end, Cut);
        let short_body = || region(Full, break_start, s.drop_end, Fade);

        let regions = match kind {
            EditKind::Main => vec![region(Full, 0.0, s.duration, Cut)],
            EditKind::ClapIn => vec![
                clap_lead_in(),
                region(Full, s.drop_start, s.duration, Cut),
                drop_outro(),
            ],
            EditKind::AcapIn => vec![
                region(Vocal, s.drop_start, lead_end, Fade),
                region(Full, s.drop_start, s.duration, Cut),
                drop_outro(),
            ],
            EditKind::Extended => vec![
                region(Instrumental, 0.0, s.intro_end, Fade),
                region(Full, s.intro_end, s.outro_start, Fade),
                region(Instrumental, s.outro_start, s.duration, Cut),
                drop_outro(),
            ],
            EditKind::Short => vec![
                region(Instrumental, 0.0, lead_in, Cut),
                short_body(),
                drop_outro(),
            ],
            EditKind::Slam => {
                let drop_len = s.drop_end - s.drop_start;
                vec![
                    Region {
                        cues: CuePlacement::every(
                            beat * self.slam_cue_every as f64,
                            self.phrase_beats,
                            drop_len,
                        ),
                        impact: true,
                        ..region(Full, s.drop_start, s.drop_end, Fade)
                    },
                    region(Full, s.drop_start, s.duration, Cut),
                    drop_outro(),
                ]
            }
            EditKind::AcapOut => vec![
                region(Full, 0.0, s.duration, Fade),
                region(Vocal, s.drop_start, s.drop_end, Cut),
            ],
            EditKind::ShortClapIn => vec![
                Region {
                    join: Cut,
                    ..clap_lead_in()
                },
                short_body(),
                drop_outro(),
            ],
            EditKind::ShortAcapIn => vec![
                region(Vocal, s.drop_start, lead_end, Cut),
                short_body(),
                drop_outro(),
            ],
            EditKind::ShortAcapOut => vec![
                short_body(),
                region(Vocal, s.drop_start, s.drop_end, Cut),
            ],
            EditKind::AcapInAcapOut => vec![
                region(Vocal, s.drop_start, lead_end, Fade),
                region(Full, 0.0, s.duration, Fade),
                region(Vocal, s.drop_start, s.drop_end, Cut),
            ],
        };

        let plan = SegmentPlan::new(self.finish(regions), s.duration)?;
        debug!(
            edit = kind.label(),
            segments = plan.segments().len(),
            seconds = plan.duration_seconds(),
            "planned edit"
        );
        Ok(plan)
    }

    /// Drops empty regions and sizes each fade to what both neighbours can
    /// spare, degrading to a cut below the minimum fade length.
    fn finish(&self, regions: Vec<Region>) -> Vec<Segment> {
        let regions: Vec<Region> = regions
            .into_iter()
            .filter(|region| region.end - region.start > EPSILON)
            .collect();

        let mut segments = Vec::with_capacity(regions.len());
        let mut incoming = 0.0;
        for (index, current) in regions.iter().enumerate() {
            let transition = match (current.join, regions.get(index + 1)) {
                (Join::Fade, Some(next)) => {
                    let available = (current.end - current.start) - incoming;
                    let fade = self
                        .crossfade_seconds
                        .min(available)
                        .min(next.end - next.start);
                    if fade >= self.min_crossfade_seconds && fade > EPSILON {
                        Transition::Crossfade { seconds: fade }
                    } else {
                        Transition::Cut
                    }
                }
                _ => Transition::Cut,
            };
            incoming = transition.fade_seconds();

            segments.push(Segment {
                source: current.source,
                start: current.start,
                end: current.end,
                cues: current.cues.clone(),
                impact: current.impact,
                transition,
            });
        }
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RenderConfig {
        RenderConfig::default()
    }

    fn structure(duration: f64) -> TrackStructure {
        TrackStructure::resolve(duration, &StructureMarkers::default(), None, &config()).unwrap()
    }

    #[test]
    fn falls_back_to_fractional_markers() {
        let s = structure(180.0);
        assert!((s.intro_end - 14.4).abs() < 1e-9);
        assert!((s.outro_start - 165.6).abs() < 1e-9);
        assert!((s.drop_start - 14.4).abs() < 1e-9);
        // First 60% of the body.
        assert!((s.drop_end - (14.4 + 0.6 * 151.2)).abs() < 1e-9);
    }

    #[test]
    fn markers_override_analysis() {
        let markers = StructureMarkers {
            drop_start: Some(40.0),
            ..Default::default()
        };
        let analysis = TrackAnalysis {
            bpm: 128.0,
            drop_start: 75.0,
        };
        let s = TrackStructure::resolve(200.0, &markers, Some(&analysis), &config()).unwrap();
        assert_eq!(s.drop_start, 40.0);
        assert!((s.beat_seconds - 60.0 / 128.0).abs() < 1e-12);
        assert!((s.drop_end - (40.0 + 32.0 * 60.0 / 128.0)).abs() < 1e-9);
    }

    #[test]
    fn every_catalog_entry_produces_a_valid_plan() {
        let selector = SegmentSelector::new(&config());
        for duration in [180.0, 12.0, 0.5] {
            let s = structure(duration);
            for kind in EditKind::ALL {
                let plan = selector.select(kind, &s).unwrap();
                assert!(!plan.segments().is_empty(), "{kind} at {duration}s");
            }
        }
    }

    #[test]
    fn main_is_the_whole_track() {
        let plan = SegmentSelector::new(&config())
            .select(EditKind::Main, &structure(180.0))
            .unwrap();
        assert_eq!(plan.segments().len(), 1);
        assert_eq!(plan.duration_seconds(), 180.0);
    }

    #[test]
    fn clap_in_places_cues_on_every_lead_in_beat() {
        let markers = StructureMarkers {
            bpm: Some(120.0),
            drop_start: Some(30.0),
            ..Default::default()
        };
        let s = TrackStructure::resolve(180.0, &markers, None, &config()).unwrap();
        let plan = SegmentSelector::new(&config())
            .select(EditKind::ClapIn, &s)
            .unwrap();

        let lead_in = &plan.segments()[0];
        assert_eq!(lead_in.source, Source::Instrumental);
        assert_eq!(lead_in.duration(), 8.0);
        assert_eq!(lead_in.cues.len(), 16);
        assert_eq!(lead_in.transition, Transition::Crossfade { seconds: 0.5 });
    }

    #[test]
    fn fades_shrink_to_fit_short_segments() {
        let mut cfg = config();
        cfg.crossfade_seconds = 5.0;
        let markers = StructureMarkers {
            bpm: Some(120.0),
            drop_start: Some(10.0),
            drop_end: Some(11.0),
            ..Default::default()
        };
        let s = TrackStructure::resolve(60.0, &markers, None, &cfg).unwrap();
        let plan = SegmentSelector::new(&cfg).select(EditKind::AcapIn, &s).unwrap();

        // The lead-in is clamped to the 1 s drop, so the fade is too.
        assert_eq!(
            plan.segments()[0].transition,
            Transition::Crossfade { seconds: 1.0 }
        );
    }

    #[test]
    fn unknown_names_are_rejected() {
        let err = SegmentSelector::new(&config())
            .select_named("Reverse", &structure(60.0))
            .unwrap_err();
        assert!(matches!(err, StemEditError::UnknownEditType(_)));
    }

    #[test]
    fn plan_rejects_fades_longer_than_a_neighbour() {
        let segments = vec![
            Segment {
                source: Source::Full,
                start: 0.0,
                end: 1.0,
                cues: CuePlacement::empty(),
                impact: false,
                transition: Transition::Crossfade { seconds: 2.0 },
            },
            Segment {
                source: Source::Vocal,
                start: 0.0,
                end: 10.0,
                cues: CuePlacement::empty(),
                impact: false,
                transition: Transition::Cut,
            },
        ];
        assert!(SegmentPlan::new(segments, 10.0).is_err());
    }

    #[test]
    fn slam_opens_with_an_impact_and_cues_every_bar() {
        let markers = StructureMarkers {
            bpm: Some(120.0),
            drop_start: Some(30.0),
            ..Default::default()
        };
        let s = TrackStructure::resolve(180.0, &markers, None, &config()).unwrap();
        let plan = SegmentSelector::new(&config())
            .select(EditKind::Slam, &s)
            .unwrap();

        let head = &plan.segments()[0];
        assert!(head.impact);
        assert_eq!(head.cues.offsets()[..3], [0.0, 2.0, 4.0]);
        assert_eq!(head.cues.len(), 8);
        assert!(plan.segments()[1..].iter().all(|segment| !segment.impact));
    }

    #[test]
    fn slam_cue_count_is_bounded_by_the_phrase() {
        let markers = StructureMarkers {
            bpm: Some(60_000.0),
            drop_start: Some(30.0),
            drop_end: Some(100.0),
            ..Default::default()
        };
        let s = TrackStructure::resolve(180.0, &markers, None, &config()).unwrap();
        let plan = SegmentSelector::new(&config())
            .select(EditKind::Slam, &s)
            .unwrap();
        assert_eq!(plan.segments()[0].cues.len(), config().phrase_beats as usize);
    }

    #[test]
    fn cue_placement_rejects_duplicates() {
        assert!(CuePlacement::new(vec![0.0, 1.0, 1.0]).is_err());
        assert!(CuePlacement::new(vec![0.0, 0.5, 1.0]).is_ok());
    }

    #[test]
    fn expected_frames_subtracts_fades() {
        let s = structure(180.0);
        let plan = SegmentSelector::new(&config())
            .select(EditKind::Extended, &s)
            .unwrap();
        let rate = 1_000;
        let total: usize = plan
            .segments()
            .iter()
            .map(|segment| segment.frame_range(rate).len())
            .sum();
        let fades: usize = plan.boundary_fades(rate).iter().sum();
        assert_eq!(fades, 1_000);
        assert_eq!(plan.expected_frames(rate), total - fades);
    }
}
