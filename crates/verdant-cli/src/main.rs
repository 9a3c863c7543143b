use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use image::DynamicImage;
use serde_json::{json, Value};
use verdant_contracts::control::{parse_control, ControlCommand, CONTROL_HELP_COMMANDS};
use verdant_contracts::edits::{EditPlan, MarkerColor, VerificationMode};
use verdant_contracts::jobs::{JobSnapshot, JobStatus, LogLine};
use verdant_contracts::regions::{PreserveRect, RegionDescriptor};
use verdant_contracts::settings::ChainPolicy;
use verdant_engine::imaging::{decode_image, encode_png};
use verdant_engine::mask::{build_binary_mask, build_overlay, MarkerStyle};
use verdant_engine::{
    default_registry, ChainInput, ChainStep, Comparator, EditChain, ImagePayload, JobOptions,
    JobStore,
};

#[derive(Debug, Parser)]
#[command(name = "verdant", version, about = "Region-masked plant replacement")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply every edit in a plan, in order.
    Run(RunArgs),
    /// Draw the marker overlay (or a binary mask) for one region.
    Mask(MaskArgs),
    /// Score a candidate against an original.
    Compare(CompareArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    plan: PathBuf,
    /// Overrides the plan's source photograph.
    #[arg(long)]
    source: Option<PathBuf>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "fal")]
    provider: String,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    policy: Option<String>,
    #[arg(long)]
    max_retries: Option<u32>,
    /// Ignore operator commands on stdin.
    #[arg(long)]
    no_control: bool,
}

#[derive(Debug, Parser)]
struct MaskArgs {
    #[arg(long)]
    image: PathBuf,
    /// Region JSON, e.g. '{"cx":0.5,"cy":0.6,"rx":0.1,"ry":0.2}'.
    #[arg(long)]
    region: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value = "red")]
    color: String,
    /// Marker opacity between 0.05 and 1.
    #[arg(long, default_value_t = 0.5)]
    alpha: f32,
    #[arg(long)]
    binary: bool,
}

#[derive(Debug, Parser)]
struct CompareArgs {
    #[arg(long)]
    original: PathBuf,
    #[arg(long)]
    candidate: PathBuf,
    #[arg(long)]
    region: String,
    /// Preserve rectangle JSON; switches to preserve-region scoring.
    #[arg(long)]
    preserve: Option<String>,
}

const POLL_INTERVAL: Duration = Duration::from_millis(200);

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("verdant error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_chain(args),
        Command::Mask(args) => {
            run_mask(args)?;
            Ok(0)
        }
        Command::Compare(args) => {
            run_compare(args)?;
            Ok(0)
        }
    }
}

fn run_chain(args: RunArgs) -> Result<i32> {
    let plan = EditPlan::load(&args.plan)?;
    let base_dir = args
        .plan
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let source_path = match (args.source.as_ref(), plan.source.as_deref()) {
        (Some(path), _) => path.clone(),
        (None, Some(path)) => base_dir.join(path),
        (None, None) => bail!("no source image: pass --source or set \"source\" in the plan"),
    };
    let source = fs::read(&source_path)
        .with_context(|| format!("failed reading source image {}", source_path.display()))?;

    let mut settings = plan.settings.clone();
    for warning in settings.apply_env_overrides() {
        println!("[warning] {warning}");
    }
    if let Some(raw) = args.policy.as_deref() {
        settings.policy = ChainPolicy::parse(raw)
            .with_context(|| format!("unknown policy '{raw}' (use skip or halt)"))?;
    }
    if let Some(max_retries) = args.max_retries {
        settings.max_retries = max_retries;
    }
    if args.model.is_some() {
        settings.model = args.model.clone();
    }
    let settings = settings.normalized();

    let registry = default_registry();
    let Some(client) = registry.get(&args.provider) else {
        bail!(
            "unknown provider '{}' (available: {})",
            args.provider,
            registry.names().join(", ")
        );
    };

    let mut steps = Vec::with_capacity(plan.edits.len());
    for edit in &plan.edits {
        let mut step = ChainStep::new(edit.clone());
        if let Some(reference) = edit.reference_image.as_deref() {
            step = step.with_reference(
                ImagePayload::load(reference, Some(&base_dir))
                    .with_context(|| format!("edit '{}' reference", edit.label()))?,
            );
        }
        steps.push(step);
    }

    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed creating {}", args.out.display()))?;
    let options = JobOptions {
        out_dir: Some(args.out.clone()),
        events_path: Some(
            args.events
                .clone()
                .unwrap_or_else(|| args.out.join("events.jsonl")),
        ),
    };
    let input = ChainInput {
        source,
        steps,
        instruction_template: plan.instruction_template().to_string(),
    };
    let store = JobStore::new();
    let chain = EditChain::new(client, settings);
    let (job, worker) = store.start(chain, input, &options)?;
    println!("Job {} started. Type /help for commands.", job.id());

    let commands = if args.no_control {
        None
    } else {
        Some(spawn_control_reader())
    };
    let mut printed = 0usize;
    loop {
        let snapshot = job.snapshot();
        printed = print_new_logs(&snapshot.logs, printed);
        if snapshot.status.is_terminal() {
            break;
        }
        if let Some(rx) = commands.as_ref() {
            while let Ok(line) = rx.try_recv() {
                handle_control(&store, job.id(), &line);
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
    if worker.join().is_err() {
        bail!("job thread panicked");
    }

    let snapshot = job.snapshot();
    print_new_logs(&snapshot.logs, printed);
    if let Some(path) = snapshot.final_image_path.as_deref() {
        println!("Final image: {path}");
    }
    match snapshot.status {
        JobStatus::Completed => Ok(0),
        JobStatus::Cancelled => Ok(2),
        JobStatus::Error => bail!(
            "{}",
            snapshot.error.as_deref().unwrap_or("job ended in error")
        ),
        JobStatus::Running => Ok(1),
    }
}

fn spawn_control_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn handle_control(store: &JobStore, job_id: &str, line: &str) {
    match parse_control(line) {
        ControlCommand::Noop => {}
        ControlCommand::Help => println!("Commands: {}", CONTROL_HELP_COMMANDS.join(" ")),
        ControlCommand::Status => match store.snapshot(job_id) {
            Some(snapshot) => println!("{}", status_line(&snapshot)),
            None => println!("[error] job {job_id} is gone"),
        },
        ControlCommand::Cancel => match store.cancel(job_id) {
            Ok(true) => {}
            Ok(false) => println!("[info] job already finished"),
            Err(err) => println!("[error] {err}"),
        },
        ControlCommand::Select { step, label } => {
            if let Err(err) = store.select_candidate(job_id, step, &label) {
                println!("[error] {err}");
            }
        }
        ControlCommand::Invalid { raw, reason } => println!("[error] {raw}: {reason}"),
    }
}

fn status_line(snapshot: &JobSnapshot) -> String {
    let live: Vec<Value> = snapshot
        .live_candidates
        .iter()
        .map(|candidate| {
            json!({
                "label": candidate.label,
                "score": (candidate.score * 1000.0).round() / 1000.0,
                "passed": candidate.passed,
            })
        })
        .collect();
    json!({
        "status": snapshot.status.as_str(),
        "progress": snapshot.progress,
        "step": snapshot.current_step,
        "total_steps": snapshot.total_steps,
        "attempt": snapshot.current_attempt,
        "pending_selection": snapshot.pending_selection,
        "candidates": live,
    })
    .to_string()
}

fn print_new_logs(logs: &[LogLine], printed: usize) -> usize {
    for line in logs.iter().skip(printed) {
        println!("[{}] {}", line.level.as_str(), line.message);
    }
    logs.len().max(printed)
}

fn parse_region(raw: &str) -> Result<RegionDescriptor> {
    let region: RegionDescriptor =
        serde_json::from_str(raw).with_context(|| format!("invalid region JSON: {raw}"))?;
    region.validate()?;
    Ok(region)
}

fn parse_marker(raw: &str) -> Result<MarkerColor> {
    serde_json::from_value(Value::String(raw.trim().to_ascii_lowercase()))
        .with_context(|| format!("unknown marker color '{raw}' (red, blue, yellow)"))
}

fn load_image(path: &Path) -> Result<DynamicImage> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    decode_image(&bytes).with_context(|| format!("failed decoding {}", path.display()))
}

fn run_mask(args: MaskArgs) -> Result<()> {
    let image = load_image(&args.image)?;
    let region = parse_region(&args.region)?.to_ellipse(image.width(), image.height());
    let rendered = if args.binary {
        DynamicImage::ImageLuma8(build_binary_mask(image.width(), image.height(), &region))
    } else {
        let style = MarkerStyle::new(parse_marker(&args.color)?, args.alpha.clamp(0.05, 1.0));
        DynamicImage::ImageRgb8(build_overlay(&image, &region, style))
    };
    fs::write(&args.out, encode_png(&rendered)?)
        .with_context(|| format!("failed writing {}", args.out.display()))?;
    println!("Mask written to {}", args.out.display());
    Ok(())
}

fn run_compare(args: CompareArgs) -> Result<()> {
    let original = load_image(&args.original)?;
    let candidate = load_image(&args.candidate)?;
    let region = parse_region(&args.region)?.to_ellipse(original.width(), original.height());
    let preserve = match args.preserve.as_deref() {
        Some(raw) => {
            let rect: PreserveRect = serde_json::from_str(raw)
                .with_context(|| format!("invalid preserve JSON: {raw}"))?;
            rect.validate()?;
            Some(rect)
        }
        None => None,
    };
    let mode = if preserve.is_some() {
        VerificationMode::PreserveRegion
    } else {
        VerificationMode::OutsideRegion
    };
    let score = Comparator::default().score(mode, &original, &candidate, &region, preserve.as_ref());
    println!(
        "{}",
        json!({"mode": mode.as_str(), "score": score, "percent": score * 100.0})
    );
    Ok(())
}
