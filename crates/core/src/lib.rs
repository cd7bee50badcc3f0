//! Core library for building DJ edits from separated stems.
//!
//! A job starts from a vocal and an instrumental stem. The genre policy picks
//! which edits to build, the segment selector turns each edit into a plan of
//! stem regions and transitions, and the renderer slices, cues and crossfades
//! those regions on a worker pool. Finished edits are encoded, tagged and
//! published by the exporter.

pub mod analysis;
pub mod assets;
pub mod audio;
pub mod config;
pub mod cue;
pub mod edit;
pub mod error;
pub mod export;
pub mod job;
pub mod mixer;
pub mod policy;
pub mod render;
pub mod report;
pub mod stems;
pub mod timeline;

pub use analysis::{TrackAnalysis, TrackAnalyzer, DEFAULT_BPM};
pub use assets::{AssetStore, CoverArt};
pub use audio::AudioBuffer;
pub use config::{AssetConfig, EngineConfig, ExportConfig, RenderConfig};
pub use cue::{CueGains, CueOverlay, CueSample};
pub use edit::{EditKind, EditSpec};
pub use error::{Result, StemEditError};
pub use export::{Encoder, ExportOutcome, Exporter, Mp3Encoder, OutputFormat, WavEncoder};
pub use job::{
    plan_edits, EditReport, Engine, FailureReason, FormatReport, Job, JobReport, JobRequest,
    JobState,
};
pub use mixer::FadeCurve;
pub use policy::GenrePolicy;
pub use render::{CancelToken, EditRenderer, RenderedEdit, TrackMetadata};
pub use report::MetadataReporter;
pub use stems::{Separator, Source, StemFiles, StemPair};
pub use timeline::{
    CuePlacement, Segment, SegmentPlan, SegmentSelector, StructureMarkers, TrackStructure,
    Transition,
};
