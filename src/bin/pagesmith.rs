//! CLI binary for pagesmith.
//!
//! A thin shell over the library crate: it maps flags onto facade calls,
//! drives a progress bar from the event stream, and prints results. All
//! engine logic lives in the library.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use pagesmith::{Event, RequestFacade};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

#[derive(Parser)]
#[command(
    name = "pagesmith",
    version,
    about = "Recognize and transform document pages with a vision language model"
)]
struct Cli {
    /// Data directory for cache, history, and config.
    #[arg(long, env = "PAGESMITH_DATA_DIR", default_value = ".pagesmith")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recognize pages of a document (optionally transforming the result).
    Process {
        /// PDF or image file to process.
        input: PathBuf,

        /// Pages to process, e.g. "1-3,7" (default: all).
        #[arg(short, long)]
        pages: Option<String>,

        /// Transformation instruction; runs the AI stage after OCR.
        #[arg(long)]
        prompt: Option<String>,

        /// Include adjacent pages' text as context for the AI stage.
        #[arg(long)]
        context: bool,

        /// Ignore cached results and reprocess.
        #[arg(long)]
        force: bool,

        /// Write recognized text here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List recent processing runs.
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Full-text search across all processed pages.
    Search {
        query: String,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Probe platform dependencies.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let facade = RequestFacade::builder(&cli.data_dir)
        .build()
        .context("failed to initialise engine")?;

    match cli.command {
        Command::Process {
            input,
            pages,
            prompt,
            context,
            force,
            output,
        } => run_process(&facade, input, pages, prompt, context, force, output).await,
        Command::History { limit } => run_history(&facade, limit),
        Command::Search { query, limit } => run_search(&facade, &query, limit),
        Command::Check => run_check(&facade),
    }
}

async fn run_process(
    facade: &RequestFacade,
    input: PathBuf,
    pages: Option<String>,
    prompt: Option<String>,
    context: bool,
    force: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let doc = facade
        .load_document(&input)
        .await
        .with_context(|| format!("failed to load {}", input.display()))?;
    eprintln!(
        "{} {} ({} pages)",
        bold("Loaded"),
        doc.title,
        doc.page_count
    );

    let selected = match pages.as_deref() {
        Some(spec) => parse_page_spec(spec, doc.page_count)?,
        None => (1..=doc.page_count).collect(),
    };

    let mut events = facade.subscribe();
    match prompt {
        Some(prompt) => {
            facade
                .process_full(selected.clone(), prompt, context, force)
                .await?
        }
        None => facade.process_pages(selected.clone(), force).await?,
    }

    let bar = ProgressBar::new(selected.len() as u64);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:40.green/238}] {pos:>3}/{len} pages  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    bar.enable_steady_tick(Duration::from_millis(80));

    let mut errors = 0usize;
    loop {
        match events.recv().await {
            Event::PageProcessed {
                page_number,
                from_cache,
            } => {
                bar.inc(1);
                let note = if from_cache { dim("(cached)") } else { String::new() };
                bar.println(format!("  {} page {page_number} {note}", green("✓")));
            }
            Event::AiPageProcessed { page_number, .. } => {
                bar.println(format!("  {} page {page_number} transformed", green("✓")));
            }
            Event::ProcessingError { error } | Event::AiProcessingError { error } => {
                errors += 1;
                bar.println(format!("  {} {}", red("✗"), error));
            }
            Event::ProcessingComplete { processed, total }
            | Event::AiProcessingComplete { processed, total } => {
                bar.finish_and_clear();
                eprintln!(
                    "{} {processed}/{total} pages processed{}",
                    bold("Done:"),
                    if errors > 0 {
                        format!(", {errors} errors")
                    } else {
                        String::new()
                    }
                );
                break;
            }
            Event::ProcessingCancelled => {
                bar.finish_and_clear();
                bail!("processing was cancelled");
            }
            _ => {}
        }
    }

    let snapshot = facade.current_document().await?;
    let mut assembled = String::new();
    for page in &snapshot.pages {
        if !selected.contains(&page.number) {
            continue;
        }
        let text = if !page.ai_text.is_empty() {
            &page.ai_text
        } else {
            &page.ocr_text
        };
        if !text.is_empty() {
            assembled.push_str(text);
            assembled.push_str("\n\n");
        }
    }

    match output {
        Some(path) => {
            let written = facade.save_text_file(&assembled, &path)?;
            eprintln!("{} {}", bold("Wrote"), written.display());
        }
        None => print!("{assembled}"),
    }
    Ok(())
}

fn run_history(facade: &RequestFacade, limit: usize) -> Result<()> {
    let records = facade.history_list(limit)?;
    if records.is_empty() {
        eprintln!("no processing runs recorded yet");
        return Ok(());
    }
    for record in records {
        println!(
            "{:>5}  {:<10}  {:>4} pages  {:>8} tokens  {}  {}",
            record.id,
            record.status.as_str(),
            record.page_count,
            record.cost,
            record.started_at.format("%Y-%m-%d %H:%M"),
            record.document_name,
        );
    }
    Ok(())
}

fn run_search(facade: &RequestFacade, query: &str, limit: usize) -> Result<()> {
    let matches = facade.history_search(query, limit)?;
    if matches.is_empty() {
        eprintln!("no matches for {query:?}");
        return Ok(());
    }
    for hit in matches {
        println!(
            "{} {} {}",
            bold(&format!("{}#{}", hit.document_name, hit.page_number)),
            dim(&format!("(record {})", hit.record_id)),
            hit.snippet
        );
    }
    Ok(())
}

fn run_check(facade: &RequestFacade) -> Result<()> {
    let report = facade.check_system_dependencies();
    println!("{} {}/{}", bold("Platform:"), report.os, report.arch);
    for dep in report.dependencies {
        let mark = if dep.installed { green("✓") } else { red("✗") };
        let version = dep.version.map(|v| format!(" {v}")).unwrap_or_default();
        println!("  {mark} {}{version}  {}", dep.name, dim(&dep.description));
        if let Some(error) = dep.error {
            println!("      {}", red(&error));
        }
    }
    Ok(())
}

/// Parse "1-3,7,10-12" into sorted page numbers, validating the bounds.
fn parse_page_spec(spec: &str, total: u32) -> Result<Vec<u32>> {
    let mut pages = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u32 = start.trim().parse().context("invalid page range")?;
                let end: u32 = end.trim().parse().context("invalid page range")?;
                if start == 0 || end < start || end > total {
                    bail!("page range {part} is outside 1..={total}");
                }
                pages.extend(start..=end);
            }
            None => {
                let page: u32 = part.parse().context("invalid page number")?;
                if page == 0 || page > total {
                    bail!("page {page} is outside 1..={total}");
                }
                pages.push(page);
            }
        }
    }
    pages.sort_unstable();
    pages.dedup();
    if pages.is_empty() {
        bail!("page selection {spec:?} is empty");
    }
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::parse_page_spec;

    #[test]
    fn parses_ranges_and_singles() {
        assert_eq!(parse_page_spec("1-3,7", 10).unwrap(), vec![1, 2, 3, 7]);
        assert_eq!(parse_page_spec("5", 5).unwrap(), vec![5]);
        assert_eq!(parse_page_spec("3,1,2-3", 5).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(parse_page_spec("0", 5).is_err());
        assert!(parse_page_spec("6", 5).is_err());
        assert!(parse_page_spec("4-2", 5).is_err());
        assert!(parse_page_spec("", 5).is_err());
    }
}
