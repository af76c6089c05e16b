//! CLI binary for paper2video.
//!
//! A thin shim over the library crate: `generate` maps flags onto
//! `PipelineConfig` and runs one job to completion; `jobs` inspects and
//! edits the persisted job table.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use paper2video::orchestrator::{delete_job, rename_job};
use paper2video::{
    Job, JobId, JobMetrics, JobRepository, JobStatus, JsonFileJobStore, Orchestrator,
    PipelineConfig, PipelineObserver, RenderQuality, SourceRef, Stage,
};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI observer using indicatif ─────────────────────────────────────────────

/// Terminal observer: one bar over the planned clips, one log line per
/// clip event. A clip advances the bar when it is composed or fails to
/// render.
struct CliObserver {
    bar: ProgressBar,
    problems: AtomicUsize,
}

impl CliObserver {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Fetching paper…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            problems: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>2}/{len} clips  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Producing");
    }
}

fn shorten(msg: &str) -> String {
    if msg.chars().count() > 80 {
        let head: String = msg.chars().take(79).collect();
        format!("{head}\u{2026}")
    } else {
        msg.to_string()
    }
}

impl PipelineObserver for CliObserver {
    fn on_job_started(&self, _job: JobId, source: &SourceRef) {
        self.bar.set_message(format!("planning {source}"));
    }

    fn on_plan_ready(&self, _job: JobId, planned: usize, kept: usize) {
        self.activate_bar(kept);
        let note = if planned > kept {
            dim(&format!(" ({planned} planned)"))
        } else {
            String::new()
        };
        self.bar.println(format!(
            "{} {}{}",
            cyan("◆"),
            bold(&format!("Producing {kept} clips")),
            note
        ));
    }

    fn on_clip_started(&self, _job: JobId, clip: usize, total: usize, stage: Stage) {
        self.bar
            .set_message(format!("clip {}/{total}: {stage}", clip + 1));
    }

    fn on_clip_succeeded(&self, _job: JobId, clip: usize, stage: Stage) {
        if stage == Stage::Compose {
            self.bar
                .println(format!("  {} Clip {:>2}", green("✓"), clip + 1));
            self.bar.inc(1);
        }
    }

    fn on_clip_degraded(&self, _job: JobId, clip: usize, stage: Stage, reason: &str) {
        self.problems.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} Clip {:>2}  {} {}",
            yellow("⚠"),
            clip + 1,
            dim(&stage.to_string()),
            yellow(&shorten(reason))
        ));
        if stage == Stage::Compose {
            self.bar.inc(1);
        }
    }

    fn on_clip_failed(&self, _job: JobId, clip: usize, stage: Stage, reason: &str) {
        self.problems.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} Clip {:>2}  {} {}",
            red("✗"),
            clip + 1,
            dim(&stage.to_string()),
            red(&shorten(reason))
        ));
        if stage == Stage::Render {
            self.bar.inc(1);
        }
    }

    fn on_closing_clip(&self, _job: JobId, source: Option<&str>) {
        if let Some(s) = source {
            self.bar
                .println(format!("  {} Closing clip  {}", green("✓"), dim(s)));
        }
        self.bar.set_message("stitching");
    }

    fn on_job_finished(&self, _job: JobId, _status: JobStatus, _metrics: Option<&JobMetrics>) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Paper from arXiv, default settings
  paper2video generate https://arxiv.org/pdf/1706.03762

  # Local file, steer the script, high quality
  paper2video generate paper.pdf --prompt "focus on the proof" --quality high

  # Skip the closing clip, JSON result on stdout
  paper2video generate paper.pdf --no-closing-clip --json

  # Manage past jobs
  paper2video jobs list
  paper2video jobs rename 3f2c… "Attention explained"
  paper2video jobs delete 3f2c…

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  LMNT_API_KEY            LMNT speech key (edge-tts is used without it)
  GOOGLE_API_KEY          Veo key for the generated closing clip
  PDFIUM_LIB_PATH         Path to libpdfium

REQUIRED TOOLS:
  manim, ffmpeg, ffprobe on PATH; edge-tts when LMNT is not configured.
"#;

/// Turn research-paper PDFs into narrated explainer videos.
#[derive(Parser, Debug)]
#[command(
    name = "paper2video",
    version,
    about = "Turn research-paper PDFs into narrated explainer videos",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Job table location.
    #[arg(long, global = true, env = "PAPER2VIDEO_JOBS_FILE", default_value = "jobs.json")]
    jobs_file: PathBuf,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PAPER2VIDEO_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PAPER2VIDEO_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Produce a video from a PDF file or URL.
    Generate(GenerateArgs),

    /// Inspect or edit past jobs.
    #[command(subcommand)]
    Jobs(JobsCommand),
}

#[derive(clap::Args, Debug)]
struct GenerateArgs {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Extra steering for the script writer.
    #[arg(short, long)]
    prompt: Option<String>,

    /// Directory for the finished video.
    #[arg(short, long, env = "PAPER2VIDEO_OUTPUT_DIR", default_value = "outputs")]
    output_dir: PathBuf,

    /// Scratch directory for per-job intermediates.
    #[arg(long, env = "PAPER2VIDEO_WORK_DIR", default_value = "work")]
    work_dir: PathBuf,

    /// Keep intermediates after the job ends.
    #[arg(long)]
    keep_work_dir: bool,

    /// Render quality: low, medium, high.
    #[arg(long, env = "PAPER2VIDEO_QUALITY", value_enum, default_value = "medium")]
    quality: QualityArg,

    /// Narration voice id.
    #[arg(long, env = "PAPER2VIDEO_VOICE")]
    voice: Option<String>,

    /// Most clips to keep from the plan.
    #[arg(long, env = "PAPER2VIDEO_MAX_CLIPS", default_value_t = 4,
          value_parser = clap::value_parser!(u16).range(1..=16))]
    max_clips: u16,

    /// Do not append a closing clip.
    #[arg(long, env = "PAPER2VIDEO_NO_CLOSING_CLIP")]
    no_closing_clip: bool,

    /// Pre-rendered closing clip to use before trying generation.
    #[arg(long, env = "PAPER2VIDEO_CLOSING_CLIP")]
    closing_clip: Option<PathBuf>,

    /// LLM model ID.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Retries for the planning call.
    #[arg(long, env = "PAPER2VIDEO_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PAPER2VIDEO_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Print the finished job as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PAPER2VIDEO_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Subcommand, Debug)]
enum JobsCommand {
    /// List jobs, newest first.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show one job.
    Show { id: JobId },
    /// Give a job's video a display name.
    Rename { id: JobId, name: String },
    /// Delete a job with its video and uploaded source.
    Delete {
        id: JobId,
        /// Upload directory whose files belong to jobs.
        #[arg(long, env = "PAPER2VIDEO_UPLOAD_DIR", default_value = "uploads")]
        upload_dir: PathBuf,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum QualityArg {
    Low,
    Medium,
    High,
}

impl From<QualityArg> for RenderQuality {
    fn from(v: QualityArg) -> Self {
        match v {
            QualityArg::Low => RenderQuality::Low,
            QualityArg::Medium => RenderQuality::Medium,
            QualityArg::High => RenderQuality::High,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs while it is visible.
    let show_progress = match cli.command {
        Command::Generate(ref g) => !cli.quiet && !g.no_progress && !g.json,
        Command::Jobs(_) => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Generate(ref args) => generate(&cli, args, show_progress).await,
        Command::Jobs(ref cmd) => jobs(&cli, cmd).await,
    }
}

async fn generate(cli: &Cli, args: &GenerateArgs, show_progress: bool) -> Result<()> {
    let observer = show_progress.then(CliObserver::new);
    let config = build_config(cli, args, observer.clone())?;
    let orchestrator = Orchestrator::from_config(config)
        .await
        .context("Failed to set up the pipeline")?;

    let job = orchestrator
        .run(SourceRef::parse(&args.input), args.prompt.clone())
        .await
        .context("Job bookkeeping failed")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&job).context("Failed to serialise job")?
        );
    } else if !cli.quiet {
        print_summary(&job);
    }

    match job.status {
        JobStatus::Completed => Ok(()),
        _ => anyhow::bail!(job.error.unwrap_or_else(|| "job failed".into())),
    }
}

/// Map CLI args to `PipelineConfig`.
fn build_config(
    cli: &Cli,
    args: &GenerateArgs,
    observer: Option<Arc<CliObserver>>,
) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .output_dir(&args.output_dir)
        .work_dir(&args.work_dir)
        .jobs_file(&cli.jobs_file)
        .keep_work_dir(args.keep_work_dir)
        .quality(args.quality.into())
        .max_clips(args.max_clips as usize)
        .closing_clip(!args.no_closing_clip)
        .max_retries(args.max_retries)
        .download_timeout_secs(args.download_timeout);

    if let Some(ref voice) = args.voice {
        builder = builder.voice_id(voice);
    }
    if let Some(ref path) = args.closing_clip {
        builder = builder.closing_clip_cache(path);
    }
    if let Some(ref model) = args.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = args.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(obs) = observer {
        builder = builder.observer(obs as Arc<dyn PipelineObserver>);
    }

    builder.build().context("Invalid configuration")
}

fn print_summary(job: &Job) {
    let Some(ref m) = job.metrics else {
        eprintln!("{} {}", red("✘"), job.error.as_deref().unwrap_or("job failed"));
        return;
    };
    let mark = if m.clip_errors.is_empty() {
        green("✔")
    } else {
        yellow("⚠")
    };
    let path = job
        .video_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    eprintln!(
        "{}  {}/{} clips  {:.0}% narrated  {}ms  →  {}",
        mark,
        m.successful_clips,
        m.total_clips,
        m.narration_coverage * 100.0,
        m.duration_ms,
        bold(&path),
    );
    if let Some(ref closing) = m.closing_clip {
        eprintln!("   closing clip: {}", dim(closing));
    }
    for e in &m.clip_errors {
        eprintln!("   {}", dim(&e.to_string()));
    }
}

async fn jobs(cli: &Cli, cmd: &JobsCommand) -> Result<()> {
    let store = JsonFileJobStore::open(&cli.jobs_file)
        .await
        .with_context(|| format!("Failed to open job table {:?}", cli.jobs_file))?;

    match cmd {
        JobsCommand::List { json } => {
            let jobs = store.list().await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
                return Ok(());
            }
            for job in jobs {
                let status = match job.status {
                    JobStatus::Completed => green(&job.status.to_string()),
                    JobStatus::Failed => red(&job.status.to_string()),
                    _ => cyan(&job.status.to_string()),
                };
                println!(
                    "{}  {:<10}  {}  {}",
                    job.id,
                    status,
                    job.created_at.format("%Y-%m-%d %H:%M"),
                    job.display_name()
                );
            }
        }
        JobsCommand::Show { id } => {
            let job = store
                .get(*id)
                .await?
                .with_context(|| format!("Job {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        JobsCommand::Rename { id, name } => {
            let job = rename_job(&store, *id, name).await?;
            if !cli.quiet {
                eprintln!("{} {} → {}", green("✔"), job.id, bold(&job.display_name()));
            }
        }
        JobsCommand::Delete { id, upload_dir } => {
            let job = delete_job(&store, upload_dir, *id).await?;
            if !cli.quiet {
                eprintln!("{} deleted {}", green("✔"), job.display_name());
            }
        }
    }
    Ok(())
}
