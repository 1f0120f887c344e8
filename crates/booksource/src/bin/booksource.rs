// ABOUTME: CLI binary for the book-source rule engine.
// ABOUTME: Normalizes, validates and runs search/chapter/audio lookups for sources stored in a JSON file.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use digests_booksource::{normalize_source, Engine, Source};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "booksource")]
#[command(about = "Run book-source rules: search, list chapters and resolve audio URLs")]
struct Args {
    /// Log engine activity to stderr (overrides RUST_LOG)
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Request timeout in seconds
    #[arg(long = "timeout", default_value_t = 30, global = true)]
    timeout: u64,

    /// User-Agent header to send
    #[arg(long = "user-agent", global = true)]
    user_agent: Option<String>,

    /// Extra request header as NAME:VALUE (repeatable)
    #[arg(short = 'H', long = "header", global = true)]
    headers: Vec<String>,

    /// Cache fetched pages for this many seconds
    #[arg(long = "cache-ttl", global = true)]
    cache_ttl: Option<u64>,

    /// Output file path (default: stdout)
    #[arg(short = 'o', long = "output", global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Normalize every source in a JSON file and print the canonical form
    Normalize {
        /// JSON file holding one source object or an array of them
        file: PathBuf,
    },
    /// Search a source for a keyword
    Search {
        file: PathBuf,
        keyword: String,
        #[arg(long = "page", default_value_t = 1)]
        page: u32,
        #[arg(long = "page-size", default_value_t = 20)]
        page_size: u32,
        /// Pick a source by id when the file holds several
        #[arg(long = "source-id")]
        source_id: Option<String>,
    },
    /// List the chapters of a book
    Chapters {
        file: PathBuf,
        book_url: String,
        #[arg(long = "source-id")]
        source_id: Option<String>,
    },
    /// Resolve the audio URL of a chapter
    Audio {
        file: PathBuf,
        chapter_url: String,
        #[arg(long = "source-id")]
        source_id: Option<String>,
    },
    /// Check that each source's base URL is reachable
    Validate { file: PathBuf },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("digests_booksource=debug,booksource=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn load_sources(path: &Path) -> Result<Vec<Source>, String> {
    let text = fs::read_to_string(path).map_err(|e| format!("error reading file {:?}: {}", path, e))?;
    let payload: Value = serde_json::from_str(text.trim_start_matches('\u{feff}'))
        .map_err(|e| format!("error parsing {:?}: {}", path, e))?;
    let list = match payload {
        Value::Array(items) => items,
        other => vec![other],
    };
    let sources: Vec<Source> = list.iter().filter_map(|raw| normalize_source(raw, None)).collect();
    if sources.is_empty() {
        return Err(format!("no valid sources in {:?}", path));
    }
    Ok(sources)
}

fn pick_source(path: &Path, id: Option<&str>) -> Result<Source, String> {
    let sources = load_sources(path)?;
    match id {
        Some(id) => sources
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| format!("no source with id {:?} in {:?}", id, path)),
        None => sources
            .into_iter()
            .next()
            .ok_or_else(|| format!("no valid sources in {:?}", path)),
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("error serializing output: {}", e))
}

fn build_engine(args: &Args, page_size: Option<u32>) -> Result<Engine, String> {
    let mut builder = Engine::builder().timeout(Duration::from_secs(args.timeout.max(1)));
    if let Some(ua) = &args.user_agent {
        builder = builder.user_agent(ua);
    }
    for header in &args.headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| format!("invalid header {:?}: expected NAME:VALUE", header))?;
        builder = builder.header(name.trim(), value.trim());
    }
    if let Some(ttl) = args.cache_ttl.filter(|t| *t > 0) {
        builder = builder.cache_ttl(Duration::from_secs(ttl));
    }
    if let Some(size) = page_size {
        builder = builder.page_size(size);
    }
    Ok(builder.build())
}

async fn run(args: &Args) -> Result<String, String> {
    match &args.command {
        Command::Normalize { file } => to_json(&load_sources(file)?),
        Command::Search {
            file,
            keyword,
            page,
            page_size,
            source_id,
        } => {
            let source = pick_source(file, source_id.as_deref())?;
            let engine = build_engine(args, Some(*page_size))?;
            let result = engine
                .search(&source, keyword, *page)
                .await
                .map_err(|e| e.to_string())?;
            to_json(&result)
        }
        Command::Chapters {
            file,
            book_url,
            source_id,
        } => {
            let source = pick_source(file, source_id.as_deref())?;
            let engine = build_engine(args, None)?;
            let result = engine
                .get_chapters(&source, book_url)
                .await
                .map_err(|e| e.to_string())?;
            to_json(&result)
        }
        Command::Audio {
            file,
            chapter_url,
            source_id,
        } => {
            let source = pick_source(file, source_id.as_deref())?;
            let engine = build_engine(args, None)?;
            engine
                .get_audio_url(&source, chapter_url)
                .await
                .map_err(|e| e.to_string())
        }
        Command::Validate { file } => {
            let engine = build_engine(args, None)?;
            let mut reports = Vec::new();
            for source in load_sources(file)? {
                reports.push(engine.validate_source(&source).await);
            }
            to_json(&reports)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let output = match run(&args).await {
        Ok(output) => output,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };

    if let Some(path) = &args.output {
        if let Err(e) = fs::write(path, &output) {
            eprintln!("error writing to {:?}: {}", path, e);
            return ExitCode::from(1);
        }
    } else {
        println!("{}", output);
    }
    ExitCode::SUCCESS
}
