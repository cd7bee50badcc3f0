use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use clap::{Args, Parser, Subcommand};
use stem_edits_core::{
    audio, plan_edits, CancelToken, EditKind, Engine, EngineConfig, GenrePolicy, Job, JobRequest,
    MetadataReporter, OutputFormat, StemFiles, StemPair, StructureMarkers,
    TrackAnalyzer, TrackMetadata,
};
use tracing_subscriber::EnvFilter;

fn main() -> stem_edits_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Render(args) => run_render(config, args),
        Commands::Plan {
            duration,
            genre,
            edits,
            markers,
        } => run_plan(&config, duration, &genre, &edits, &markers.into()),
        Commands::Policy { genre } => print_json(&GenrePolicy::global().edits_for(&genre)),
        Commands::Analyse { path } => run_analyse(&config, &path),
    }
}

fn run_render(config: EngineConfig, args: RenderArgs) -> stem_edits_core::Result<()> {
    let mut request = JobRequest::new(
        job_id(&args.title),
        args.genre,
        args.title,
        args.artist,
        args.out,
    );
    request.markers = args.markers.into();
    request.edits = args.edits;
    request.formats = args.formats;
    request.cover_art = args.cover;

    let separator = StemFiles::new(args.vocals, args.instrumental);
    let mut job = Job::from_separator(request, &separator, None)?;

    let engine = Engine::new(config)?.with_reporter(Arc::new(LogReporter));
    let cancel = match args.deadline_secs {
        Some(secs) => CancelToken::with_deadline(Instant::now() + Duration::from_secs(secs)),
        None => CancelToken::new(),
    };

    tracing::info!(job_id = job.id(), "rendering edits");
    let report = engine.run(&mut job, &cancel);
    print_json(&report)
}

fn run_plan(
    config: &EngineConfig,
    duration: f64,
    genre: &str,
    edits: &[EditKind],
    markers: &StructureMarkers,
) -> stem_edits_core::Result<()> {
    let edits = GenrePolicy::global().resolve(genre, edits);
    let (structure, specs) = plan_edits(duration, &edits, markers, None, &config.render)?;
    print_json(&serde_json::json!({
        "structure": structure,
        "edits": specs,
    }))
}

fn run_analyse(config: &EngineConfig, path: &Path) -> stem_edits_core::Result<()> {
    tracing::info!(path = %path.display(), "analysing track");
    let buffer = audio::decode_file(path)?;
    let stems = StemPair::new(buffer.clone(), buffer)?;
    let analysis = TrackAnalyzer::new().analyse(&stems, config.render.phrase_beats)?;
    print_json(&analysis)
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> stem_edits_core::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn job_id(title: &str) -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    let slug: String = title
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!("{}-{secs}", slug.trim_matches('-'))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Records completed edits in the log instead of calling a catalog service.
struct LogReporter;

impl MetadataReporter for LogReporter {
    fn report(
        &self,
        job_id: &str,
        edit_label: &str,
        files: &[PathBuf],
        tags: &TrackMetadata,
    ) -> stem_edits_core::Result<()> {
        tracing::info!(
            job_id,
            edit = edit_label,
            title = %tags.display_title(),
            artist = %tags.artist,
            files = ?files,
            "edit published"
        );
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "DJ edit generator for separated stems", long_about = None)]
struct Cli {
    /// Engine configuration file (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render every edit for a stem pair and write the deliverables.
    Render(RenderArgs),
    /// Print the segment plans for a track length without touching audio.
    Plan {
        /// Track length in seconds.
        #[arg(short, long)]
        duration: f64,
        #[arg(short, long)]
        genre: String,
        /// Edits to plan instead of the genre's default set.
        #[arg(short, long = "edit")]
        edits: Vec<EditKind>,
        #[command(flatten)]
        markers: MarkerArgs,
    },
    /// Show which edits a genre produces.
    Policy { genre: String },
    /// Detect tempo and drop position of an audio file.
    Analyse { path: PathBuf },
}

#[derive(Args, Debug)]
struct RenderArgs {
    /// Separated vocal stem.
    #[arg(long)]
    vocals: PathBuf,
    /// Separated instrumental stem.
    #[arg(long)]
    instrumental: PathBuf,
    #[arg(short, long)]
    genre: String,
    #[arg(short, long)]
    title: String,
    #[arg(short, long)]
    artist: String,
    /// Output directory for the encoded edits.
    #[arg(short, long)]
    out: PathBuf,
    /// Cover image embedded into every file.
    #[arg(long)]
    cover: Option<PathBuf>,
    /// Output formats (lossless, lossy); defaults to the config.
    #[arg(short, long = "format")]
    formats: Vec<OutputFormat>,
    /// Edits to render instead of the genre's default set.
    #[arg(short, long = "edit")]
    edits: Vec<EditKind>,
    /// Give up on edits not started within this many seconds.
    #[arg(long)]
    deadline_secs: Option<u64>,
    #[command(flatten)]
    markers: MarkerArgs,
}

/// Structural markers, in seconds unless noted.
#[derive(Args, Debug)]
struct MarkerArgs {
    /// Tempo in beats per minute.
    #[arg(long)]
    bpm: Option<f64>,
    /// End of the intro.
    #[arg(long)]
    intro: Option<f64>,
    /// Start of the outro.
    #[arg(long)]
    outro: Option<f64>,
    /// Start of the drop.
    #[arg(long = "drop")]
    drop_start: Option<f64>,
    /// End of the drop.
    #[arg(long)]
    drop_end: Option<f64>,
}

impl From<MarkerArgs> for StructureMarkers {
    fn from(args: MarkerArgs) -> Self {
        StructureMarkers {
            bpm: args.bpm,
            intro_end: args.intro,
            outro_start: args.outro,
            drop_start: args.drop_start,
            drop_end: args.drop_end,
        }
    }
}
