use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use folio_core::{
    DocumentSource, NavigationOutcome, OutlineItem, ScrollCommand, Session, Viewer,
    ViewerConfig, ViewerEvent,
};
use folio_render::PdfiumProvider;
use serde::Serialize;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "folio",
    version,
    about = "Lazy page rendering and navigation for PDF documents"
)]
struct Args {
    /// Config file to use instead of the platform default
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show page count and metadata
    Info { document: String },
    /// Print the table of contents
    Toc {
        document: String,
        #[arg(long, default_value_t = 80)]
        width: usize,
    },
    /// Jump to a page and report what was rendered on the way
    Goto {
        document: String,
        page: usize,
        #[arg(short, long)]
        scale: Option<f32>,
    },
    /// Render one page to a PNG file
    Render {
        document: String,
        #[arg(short, long, default_value_t = 1)]
        page: usize,
        #[arg(short, long)]
        scale: Option<f32>,
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Print a page's narration lines with estimated start times
    Narrate {
        document: String,
        #[arg(short, long, default_value_t = 1)]
        page: usize,
        #[arg(long)]
        speed: Option<f32>,
    },
    /// Print the context a question about the current page is sent with
    Ask {
        document: String,
        question: String,
        #[arg(short, long)]
        page: Option<usize>,
    },
}

impl Command {
    fn document(&self) -> &str {
        match self {
            Command::Info { document }
            | Command::Toc { document, .. }
            | Command::Goto { document, .. }
            | Command::Render { document, .. }
            | Command::Narrate { document, .. }
            | Command::Ask { document, .. } => document,
        }
    }
}

#[derive(Debug, Serialize)]
struct GotoReport {
    #[serde(flatten)]
    outcome: NavigationOutcome,
    current_page: usize,
    scale: f32,
    rendered_pages: Vec<usize>,
    scrolls: Vec<ScrollCommand>,
}

#[derive(Debug, Serialize)]
struct NarrationReportLine<'a> {
    start_ms: u128,
    text: &'a str,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "folio", "folio")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;
    let config = ViewerConfig::load_or_default(args.config.as_deref())?;

    let provider = PdfiumProvider::new()?;
    let session = Session::new(config);
    let source = DocumentSource::parse(args.command.document())?;
    let viewer = session
        .open_with(&provider, source)
        .await
        .with_context(|| format!("failed to open {}", args.command.document()))?;

    let result = run(&viewer, &args).await;
    session.close();
    result
}

async fn run(viewer: &Viewer, args: &Args) -> Result<()> {
    match &args.command {
        Command::Info { .. } => print_info(viewer, args.json),
        Command::Toc { width, .. } => print_toc(&viewer.outline(), *width, args.json),
        Command::Goto { page, scale, .. } => {
            if let Some(scale) = scale {
                viewer.set_scale(*scale);
            }
            viewer.drain_events();
            let outcome = viewer.go_to(*page).await;
            if let NavigationOutcome::Arrived { page, .. } = outcome {
                viewer.wait_rendered(page).await?;
            }
            let report = goto_report(viewer, outcome, viewer.drain_events());
            print_goto(&report, args.json)
        }
        Command::Render {
            page, scale, out, ..
        } => {
            if let Some(scale) = scale {
                viewer.set_scale(*scale);
            }
            let rendered = viewer.wait_rendered(*page).await?;
            let surface = &rendered.surface;
            image::save_buffer(
                out,
                &surface.pixels,
                surface.width,
                surface.height,
                image::ExtendedColorType::Rgba8,
            )
            .with_context(|| format!("failed to write {:?}", out))?;
            info!(page, width = surface.width, height = surface.height, "page written");
            println!("{}", out.display());
            Ok(())
        }
        Command::Narrate { page, speed, .. } => {
            let speed = speed.unwrap_or(viewer.config().narration.default_speed);
            let sequence = viewer.narration_sequence(*page, speed).await?;
            if args.json {
                let lines: Vec<_> = sequence
                    .lines()
                    .iter()
                    .map(|line| NarrationReportLine {
                        start_ms: line.start.as_millis(),
                        text: &line.text,
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&lines)?);
            } else {
                for line in sequence.lines() {
                    println!("[{}] {}", format_offset(line.start), line.text);
                }
                println!(
                    "~{} at {:.1}x",
                    format_offset(sequence.estimated_duration()),
                    sequence.speed()
                );
            }
            Ok(())
        }
        Command::Ask { question, page, .. } => {
            if let Some(page) = page {
                let outcome = viewer.go_to(*page).await;
                debug!(?outcome, "positioned before asking");
            }
            let context = viewer.question_context(question.as_str());
            println!("{}", serde_json::to_string_pretty(&context)?);
            Ok(())
        }
    }
}

fn print_info(viewer: &Viewer, json: bool) -> Result<()> {
    let info = viewer.info();
    if json {
        let value = serde_json::json!({
            "id": info.id.to_string(),
            "label": info.label,
            "page_count": info.page_count,
            "metadata": info.metadata,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    println!("{}", info.label);
    println!("  pages:  {}", info.page_count);
    if let Some(title) = &info.metadata.title {
        println!("  title:  {title}");
    }
    if let Some(author) = &info.metadata.author {
        println!("  author: {author}");
    }
    if !info.metadata.keywords.is_empty() {
        println!("  tags:   {}", info.metadata.keywords.join(", "));
    }
    Ok(())
}

fn print_toc(outline: &[OutlineItem], width: usize, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outline)?);
        return Ok(());
    }
    if outline.is_empty() {
        println!("(no table of contents)");
    }
    for entry in OutlineItem::flatten(outline) {
        println!("{}", format_toc_line(entry, width));
    }
    Ok(())
}

fn goto_report(viewer: &Viewer, outcome: NavigationOutcome, events: Vec<ViewerEvent>) -> GotoReport {
    let mut rendered_pages = Vec::new();
    let mut scrolls = Vec::new();
    for event in events {
        match event {
            ViewerEvent::PageRendered { page, .. } => rendered_pages.push(page),
            ViewerEvent::ScrollRequested(command) => scrolls.push(command),
            _ => {}
        }
    }
    rendered_pages.sort_unstable();
    rendered_pages.dedup();
    GotoReport {
        outcome,
        current_page: viewer.current_page(),
        scale: viewer.scale(),
        rendered_pages,
        scrolls,
    }
}

fn print_goto(report: &GotoReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    match report.outcome {
        NavigationOutcome::Arrived { page, chunk_steps } => {
            println!("arrived at page {page} after {chunk_steps} chunk step(s)")
        }
        NavigationOutcome::Superseded => println!("navigation was superseded"),
        NavigationOutcome::NotFound => println!("page not found"),
    }
    println!(
        "rendered {} page(s) at scale {:.2}: {:?}",
        report.rendered_pages.len(),
        report.scale,
        report.rendered_pages
    );
    Ok(())
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "folio.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    // stdout carries command output.
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

fn format_toc_line(entry: &OutlineItem, width: usize) -> String {
    let indent = "  ".repeat(entry.level.min(8));
    let page_suffix = format!(" (p{})", entry.target_page);
    let title_width = width.saturating_sub(indent.chars().count() + page_suffix.len());
    format!(
        "{indent}{}{page_suffix}",
        truncate_with_ellipsis(&entry.title, title_width)
    )
}

fn truncate_with_ellipsis(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_owned();
    }
    if width <= 3 {
        return text.chars().take(width).collect();
    }
    let mut truncated: String = text.chars().take(width - 3).collect();
    truncated.push_str("...");
    truncated
}

fn format_offset(offset: Duration) -> String {
    let tenths = offset.as_millis() / 100;
    format!("{:02}:{:02}.{}", tenths / 600, (tenths / 10) % 60, tenths % 10)
}
