use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::{
    render::{render_all, EditRenderer},
    report, AssetStore, AudioBuffer, CancelToken, CueSample, EditKind, EditSpec, EngineConfig,
    ExportOutcome, Exporter, GenrePolicy, MetadataReporter, OutputFormat, RenderConfig,
    RenderedEdit, Result, SegmentSelector, Separator, StemEditError, StemPair, StructureMarkers,
    TrackAnalysis, TrackAnalyzer, TrackMetadata, TrackStructure,
};

/// Everything a caller specifies about one job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub id: String,
    pub genre: String,
    pub title: String,
    pub artist: String,
    pub markers: StructureMarkers,
    /// Explicit edits; empty means "whatever the genre policy says".
    pub edits: Vec<EditKind>,
    /// Empty means the formats from the export config.
    pub formats: Vec<OutputFormat>,
    pub output_dir: PathBuf,
    /// Overrides the configured cover for this job.
    pub cover_art: Option<PathBuf>,
}

impl JobRequest {
    pub fn new(
        id: impl Into<String>,
        genre: impl Into<String>,
        title: impl Into<String>,
        artist: impl Into<String>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            genre: genre.into(),
            title: title.into(),
            artist: artist.into(),
            markers: StructureMarkers::default(),
            edits: Vec::new(),
            formats: Vec::new(),
            output_dir: output_dir.into(),
            cover_art: None,
        }
    }
}

/// Why a job ended in [`JobState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "message")]
pub enum FailureReason {
    Cancelled,
    AllEditsFailed,
    /// Policy resolution or plan construction failed; nothing was rendered.
    Planning(String),
}

impl FailureReason {
    fn from_error(err: StemEditError) -> Self {
        match err {
            StemEditError::Cancelled => FailureReason::Cancelled,
            other => FailureReason::Planning(other.to_string()),
        }
    }
}

/// Lifecycle of a job. `Complete` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum JobState {
    Pending,
    Planning,
    Rendering,
    Exporting,
    Complete,
    Failed(FailureReason),
}

impl JobState {
    pub fn name(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Planning => "planning",
            JobState::Rendering => "rendering",
            JobState::Exporting => "exporting",
            JobState::Complete => "complete",
            JobState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed(_))
    }

    pub fn can_move_to(&self, next: &JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Pending, Planning) | (Planning, Rendering) | (Rendering, Exporting) => true,
            (Exporting, Complete) => true,
            (current, Failed(_)) => !current.is_terminal(),
            _ => false,
        }
    }
}

/// Per-format result for one edit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatReport {
    pub format: OutputFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<ExportOutcome> for FormatReport {
    fn from(outcome: ExportOutcome) -> Self {
        match outcome.result {
            Ok(path) => Self {
                format: outcome.format,
                path: Some(path),
                error: None,
            },
            Err(err) => Self {
                format: outcome.format,
                path: None,
                error: Some(err.to_string()),
            },
        }
    }
}

/// What happened to one requested edit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditReport {
    pub edit: EditKind,
    pub label: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub formats: Vec<FormatReport>,
    /// Whether the metadata collaborator acknowledged this edit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported: Option<bool>,
}

impl EditReport {
    fn new(edit: EditKind) -> Self {
        Self {
            edit,
            label: edit.label(),
            duration_seconds: None,
            error: None,
            formats: Vec::new(),
            reported: None,
        }
    }

    pub fn rendered(&self) -> bool {
        self.duration_seconds.is_some()
    }

    pub fn published(&self) -> impl Iterator<Item = &Path> {
        self.formats.iter().filter_map(|format| format.path.as_deref())
    }

    /// Rendered and written in every requested format.
    pub fn fully_exported(&self) -> bool {
        self.rendered()
            && !self.formats.is_empty()
            && self.formats.iter().all(|format| format.error.is_none())
    }
}

/// Summary handed back to callers once a job stops.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub genre: String,
    #[serde(flatten)]
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structure: Option<TrackStructure>,
    pub edits: Vec<EditReport>,
    pub published: Vec<PathBuf>,
}

/// One stem pair moving through planning, rendering and export.
#[derive(Debug)]
pub struct Job {
    request: JobRequest,
    stems: Arc<StemPair>,
    state: JobState,
    bpm: Option<f64>,
    structure: Option<TrackStructure>,
    specs: Vec<EditSpec>,
    edits: Vec<EditReport>,
}

impl Job {
    pub fn new(request: JobRequest, stems: StemPair) -> Self {
        Self {
            request,
            stems: Arc::new(stems),
            state: JobState::Pending,
            bpm: None,
            structure: None,
            specs: Vec::new(),
            edits: Vec::new(),
        }
    }

    /// Creates a job from a separation collaborator. Its errors are
    /// returned unchanged.
    pub fn from_separator(
        request: JobRequest,
        separator: &dyn Separator,
        source: Option<&AudioBuffer>,
    ) -> Result<Self> {
        info!(job_id = %request.id, separator = separator.name(), "separating source");
        Ok(Self::new(request, separator.separate(source)?))
    }

    pub fn id(&self) -> &str {
        &self.request.id
    }

    pub fn request(&self) -> &JobRequest {
        &self.request
    }

    pub fn stems(&self) -> &StemPair {
        &self.stems
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn structure(&self) -> Option<&TrackStructure> {
        self.structure.as_ref()
    }

    pub fn specs(&self) -> &[EditSpec] {
        &self.specs
    }

    pub fn edits(&self) -> &[EditReport] {
        &self.edits
    }

    /// Every file published so far, for packaging.
    pub fn published_files(&self) -> Vec<PathBuf> {
        self.edits
            .iter()
            .flat_map(EditReport::published)
            .map(Path::to_path_buf)
            .collect()
    }

    pub fn report(&self) -> JobReport {
        JobReport {
            job_id: self.request.id.clone(),
            genre: self.request.genre.clone(),
            state: self.state.clone(),
            structure: self.structure,
            edits: self.edits.clone(),
            published: self.published_files(),
        }
    }

    fn advance(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_move_to(&next) {
            return Err(StemEditError::InvalidTransition {
                from: self.state.name(),
                to: next.name(),
            });
        }
        info!(job_id = %self.request.id, from = self.state.name(), to = next.name(), "job state");
        self.state = next;
        Ok(())
    }

    fn fail(&mut self, reason: FailureReason) {
        if self.advance(JobState::Failed(reason.clone())).is_err() {
            warn!(job_id = %self.request.id, ?reason, "job already finished");
        }
    }

    fn edit_mut(&mut self, kind: EditKind) -> Option<&mut EditReport> {
        self.edits.iter_mut().find(|edit| edit.edit == kind)
    }

    fn base_metadata(&self, cover: Option<&Path>) -> TrackMetadata {
        TrackMetadata {
            title: self.request.title.clone(),
            artist: self.request.artist.clone(),
            genre: self.request.genre.clone(),
            edit_label: String::new(),
            bpm: self.bpm,
            cover: cover.map(Path::to_path_buf),
        }
    }
}

/// Resolves track structure and builds one plan per edit. Used by the
/// engine and by callers that only want to inspect plans.
pub fn plan_edits(
    duration: f64,
    edits: &[EditKind],
    markers: &StructureMarkers,
    analysis: Option<&TrackAnalysis>,
    config: &RenderConfig,
) -> Result<(TrackStructure, Vec<EditSpec>)> {
    let structure = TrackStructure::resolve(duration, markers, analysis, config)?;
    let selector = SegmentSelector::new(config);
    let specs = edits
        .iter()
        .map(|kind| {
            Ok(EditSpec {
                kind: *kind,
                plan: selector.select(*kind, &structure)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((structure, specs))
}

/// Runs jobs: plans sequentially, then renders and exports edits on a
/// worker pool.
pub struct Engine {
    config: EngineConfig,
    assets: AssetStore,
    exporter: Exporter,
    reporter: Option<Arc<dyn MetadataReporter>>,
    pool: ThreadPool,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.render.workers)
            .thread_name(|index| format!("stem-edit-{index}"))
            .build()?;
        Ok(Self {
            assets: AssetStore::load(&config.assets),
            exporter: Exporter::from_config(&config.export),
            reporter: None,
            pool,
            config,
        })
    }

    pub fn with_assets(mut self, assets: AssetStore) -> Self {
        self.assets = assets;
        self
    }

    pub fn with_exporter(mut self, exporter: Exporter) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn MetadataReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Drives `job` to a terminal state and returns its report. Edit and
    /// format failures are recorded in the report; only planning failure,
    /// cancellation or every edit failing mark the job failed.
    #[instrument(skip_all, fields(job_id = %job.id(), genre = %job.request.genre))]
    pub fn run(&self, job: &mut Job, cancel: &CancelToken) -> JobReport {
        if let Err(reason) = self.drive(job, cancel) {
            job.fail(reason);
        }

        let report = job.report();
        info!(
            state = job.state().name(),
            rendered = report.edits.iter().filter(|edit| edit.rendered()).count(),
            published = report.published.len(),
            "job finished"
        );
        report
    }

    fn drive(&self, job: &mut Job, cancel: &CancelToken) -> std::result::Result<(), FailureReason> {
        let (cue, impact) = self.plan(job).map_err(FailureReason::from_error)?;
        let rendered = self.render(job, &cue, &impact, cancel)?;
        self.export(job, rendered, cancel)?;
        job.advance(JobState::Complete)
            .map_err(FailureReason::from_error)
    }

    /// Resolves structure and plans, and returns the cue and impact samples
    /// conformed to the stems.
    fn plan(&self, job: &mut Job) -> Result<(CueSample, CueSample)> {
        job.advance(JobState::Planning)?;
        let config = &self.config.render;
        let markers = job.request.markers;

        let needs_detection = markers.bpm.is_none() || markers.drop_start.is_none();
        let analysis = if config.analyse && needs_detection {
            TrackAnalyzer::new()
                .analyse(&job.stems, config.phrase_beats)
                .inspect_err(|err| warn!(%err, "analysis failed, using fixed markers"))
                .ok()
        } else {
            None
        };

        let edits = GenrePolicy::global().resolve(&job.request.genre, &job.request.edits);
        let (structure, specs) = plan_edits(
            job.stems.duration_seconds(),
            &edits,
            &markers,
            analysis.as_ref(),
            config,
        )?;
        info!(
            edits = ?edits.iter().map(|kind| kind.label()).collect::<Vec<_>>(),
            drop_start = structure.drop_start,
            drop_end = structure.drop_end,
            "job planned"
        );

        let cue = self.assets.cue_for(&job.stems, structure.beat_seconds)?;
        let impact = self.assets.impact_for(&job.stems)?;
        job.bpm = markers.bpm.or(analysis.map(|analysis| analysis.bpm));
        job.structure = Some(structure);
        job.edits = edits.iter().copied().map(EditReport::new).collect();
        job.specs = specs;
        Ok((cue, impact))
    }

    fn render(
        &self,
        job: &mut Job,
        cue: &CueSample,
        impact: &CueSample,
        cancel: &CancelToken,
    ) -> std::result::Result<Vec<RenderedEdit>, FailureReason> {
        job.advance(JobState::Rendering)
            .map_err(FailureReason::from_error)?;

        let stems = Arc::clone(&job.stems);
        let renderer = EditRenderer::new(&stems, cue, impact, &self.config.render);
        let metadata = job.base_metadata(None);
        let outcomes = render_all(&self.pool, &renderer, &job.specs, &metadata, cancel);
        let skipped = outcomes
            .iter()
            .any(|outcome| matches!(outcome.result, Err(StemEditError::Cancelled)));

        let mut rendered = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            let Some(report) = job.edit_mut(outcome.kind) else {
                continue;
            };
            match outcome.result {
                Ok(edit) => {
                    report.duration_seconds = Some(edit.buffer.duration_seconds());
                    rendered.push(edit);
                }
                Err(err) => report.error = Some(err.to_string()),
            }
        }

        if skipped {
            return Err(FailureReason::Cancelled);
        }
        if rendered.is_empty() {
            return Err(FailureReason::AllEditsFailed);
        }
        Ok(rendered)
    }

    fn export(
        &self,
        job: &mut Job,
        rendered: Vec<RenderedEdit>,
        cancel: &CancelToken,
    ) -> std::result::Result<(), FailureReason> {
        job.advance(JobState::Exporting)
            .map_err(FailureReason::from_error)?;

        let formats = if job.request.formats.is_empty() {
            self.config.export.formats.clone()
        } else {
            job.request.formats.clone()
        };
        let cover = match &job.request.cover_art {
            Some(path) => AssetStore::load_cover(path),
            None => self.assets.cover().cloned(),
        };
        let cover_path = cover.as_ref().map(|cover| cover.path().to_path_buf());
        let out_dir = job.request.output_dir.clone();

        let results: Vec<(RenderedEdit, Vec<FormatReport>, bool)> = self.pool.install(|| {
            rendered
                .into_par_iter()
                .map(|mut edit| {
                    edit.metadata.cover = cover_path.clone();
                    let skipped = cancel.is_cancelled();
                    let reports: Vec<FormatReport> = if skipped {
                        formats
                            .iter()
                            .map(|format| FormatReport {
                                format: *format,
                                path: None,
                                error: Some(StemEditError::Cancelled.to_string()),
                            })
                            .collect()
                    } else {
                        self.exporter
                            .export(&edit, &formats, &out_dir, cover.as_ref())
                            .into_iter()
                            .map(FormatReport::from)
                            .collect()
                    };
                    (edit, reports, skipped)
                })
                .collect()
        });

        let mut skipped_any = false;
        for (edit, formats, skipped) in results {
            skipped_any |= skipped;
            let files: Vec<PathBuf> = formats
                .iter()
                .filter_map(|format| format.path.clone())
                .collect();
            let reported = match &self.reporter {
                Some(reporter) if !files.is_empty() => Some(report::deliver(
                    reporter.as_ref(),
                    &job.request.id,
                    edit.kind.label(),
                    &files,
                    &edit.metadata,
                )),
                _ => None,
            };
            if let Some(report) = job.edit_mut(edit.kind) {
                report.formats = formats;
                report.reported = reported;
            }
        }

        if skipped_any {
            return Err(FailureReason::Cancelled);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("exporter", &self.exporter)
            .field("workers", &self.pool.current_num_threads())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_only_moves_forward() {
        let failed = JobState::Failed(FailureReason::Cancelled);
        assert!(JobState::Pending.can_move_to(&JobState::Planning));
        assert!(JobState::Exporting.can_move_to(&JobState::Complete));
        assert!(JobState::Rendering.can_move_to(&failed));
        assert!(!JobState::Pending.can_move_to(&JobState::Rendering));
        assert!(!JobState::Complete.can_move_to(&failed));
        assert!(!failed.can_move_to(&JobState::Planning));
    }

    #[test]
    fn advancing_out_of_order_is_rejected() {
        let stems = StemPair::new(
            AudioBuffer::silence(100, 1, 100),
            AudioBuffer::silence(100, 1, 100),
        )
        .unwrap();
        let mut job = Job::new(JobRequest::new("job", "Techno", "T", "A", "/tmp"), stems);
        let err = job.advance(JobState::Exporting).unwrap_err();
        assert!(matches!(
            err,
            StemEditError::InvalidTransition {
                from: "pending",
                to: "exporting"
            }
        ));
    }

    #[test]
    fn plan_edits_builds_one_plan_per_edit() {
        let markers = StructureMarkers {
            bpm: Some(128.0),
            drop_start: Some(45.0),
            ..Default::default()
        };
        let (structure, specs) = plan_edits(
            200.0,
            &EditKind::FULL_CATALOG,
            &markers,
            None,
            &RenderConfig::default(),
        )
        .unwrap();
        assert_eq!(structure.drop_start, 45.0);
        let kinds: Vec<EditKind> = specs.iter().map(|spec| spec.kind).collect();
        assert_eq!(kinds, EditKind::FULL_CATALOG.to_vec());
    }

    #[test]
    fn report_serialises_state_inline() {
        let report = JobReport {
            job_id: "job".into(),
            genre: "House".into(),
            state: JobState::Failed(FailureReason::Planning("bad plan".into())),
            structure: None,
            edits: Vec::new(),
            published: Vec::new(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["reason"]["kind"], "planning");
        assert_eq!(json["reason"]["message"], "bad plan");
    }
}
