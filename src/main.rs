//! Vision Navigator - command line front end
//!
//! Recognizes the UI elements in a screenshot file and lets you walk through
//! them the way a screen reader user would.
//!
//! # Usage
//!
//! ```bash
//! # Recognize a screenshot, then navigate with n/p/c/a/f/q
//! vision-navigator recognize screen.png
//!
//! # Only a region of it, allowing the remote backend
//! vision-navigator recognize screen.png --region 0,0,800,600 --allow-remote
//!
//! # Cache maintenance
//! vision-navigator stats
//! vision-navigator evict
//! vision-navigator clear
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vision_navigator::handoff;
use vision_navigator::{
    AnnounceSink, CaptureDescriptor, CaptureService, Config, ConsumerSession, FileCapture,
    NavigationState, PolicyConsent, RecognitionOrchestrator, ResultCache,
};

enum Command {
    Recognize {
        image: PathBuf,
        region: CaptureDescriptor,
        allow_remote: bool,
    },
    Stats,
    Clear,
    Evict,
}

struct CliArgs {
    command: Command,
    config_path: Option<PathBuf>,
}

/// Parse command line arguments
fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut positional = Vec::new();
    let mut region = CaptureDescriptor::FullScreen;
    let mut allow_remote = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-v" => {
                println!("Vision Navigator v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = Some(PathBuf::from(&args[i]));
                }
            }
            "--region" | "-r" => {
                i += 1;
                match args.get(i).and_then(|spec| CaptureDescriptor::parse_rect(spec)) {
                    Some(rect) => region = rect,
                    None => usage_error("--region expects x,y,width,height"),
                }
            }
            "--allow-remote" => {
                allow_remote = true;
            }
            arg if arg.starts_with('-') => {
                usage_error(&format!("Unknown argument: {}", arg));
            }
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let command = match positional.first().map(String::as_str) {
        Some("recognize") => match positional.get(1) {
            Some(image) => Command::Recognize {
                image: PathBuf::from(image),
                region,
                allow_remote,
            },
            None => usage_error("recognize needs an image path"),
        },
        Some("stats") => Command::Stats,
        Some("clear") => Command::Clear,
        Some("evict") => Command::Evict,
        Some(other) => usage_error(&format!("Unknown command: {}", other)),
        None => usage_error("No command given"),
    };

    CliArgs {
        command,
        config_path,
    }
}

fn usage_error(message: &str) -> ! {
    eprintln!("{}", message);
    eprintln!("Use --help for usage information.");
    std::process::exit(1);
}

fn print_help() {
    println!(
        r#"Vision Navigator - Screen element recognition for screen readers

USAGE:
    vision-navigator [OPTIONS] <COMMAND>

COMMANDS:
    recognize <IMAGE>       Recognize a screenshot file, then navigate its elements
    stats                   Show result cache statistics
    evict                   Remove expired cache entries
    clear                   Remove all cache entries

OPTIONS:
    -h, --help              Show this help message
    -v, --version           Show version
    -c, --config <PATH>     Path to configuration file
    -r, --region <X,Y,W,H>  Recognize only this rectangle of the image
    --allow-remote          Allow the remote backend for this session

NAVIGATION (after recognize):
    n   next element          p   previous element
    c   current element       a   activate
    f   activate after confirmation
    r   recognize again       q   quit

    Ctrl-C cancels a running recognition.

LOGGING:
    RUST_LOG overrides general.log_level from the config file.
"#
    );
}

/// Announcements go to stdout, logs to stderr
struct ConsoleSink;

impl AnnounceSink for ConsoleSink {
    fn announce(&mut self, text: &str) {
        println!("🔊 {}", text);
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();

    let config = match &args.config_path {
        Some(path) => Config::load_from_path(path.clone()),
        None => Config::load(),
    };
    init_logging(&config.general.log_level);

    match args.command {
        Command::Recognize {
            image,
            region,
            allow_remote,
        } => run_recognize(config, image, region, allow_remote).await,
        Command::Stats => {
            let cache = ResultCache::from_config(&config.cache)?;
            let stats = cache.stats()?;
            println!("📊 Result cache: {}", config.cache.db_path().display());
            println!("   Entries:         {} / {}", stats.entries, stats.max_entries);
            println!("   Hits / misses:   {} / {}", stats.total_hits, stats.total_misses);
            println!("   Hit rate:        {:.1}%", stats.hit_rate * 100.0);
            println!("   Avg latency:     {:.0} ms", stats.average_latency_ms);
            println!("   Storage:         {} bytes", stats.storage_bytes);
            Ok(())
        }
        Command::Clear => {
            let cache = ResultCache::from_config(&config.cache)?;
            let removed = cache.clear()?;
            println!("🧹 Removed {} cache entries", removed);
            Ok(())
        }
        Command::Evict => {
            let cache = ResultCache::from_config(&config.cache)?;
            let removed = cache.evict_expired()?;
            println!("🧹 Removed {} expired cache entries", removed);
            Ok(())
        }
    }
}

async fn run_recognize(
    config: Config,
    image: PathBuf,
    region: CaptureDescriptor,
    allow_remote: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !config.general.enabled {
        info!("Recognition is disabled in configuration, exiting");
        return Ok(());
    }

    let consent = Arc::new(PolicyConsent::from_config(&config.privacy));
    if allow_remote {
        consent.grant_for_session();
    }

    let (handoff, queue) = handoff::channel();
    let orchestrator = Arc::new(RecognitionOrchestrator::from_config(
        &config,
        consent,
        handoff,
    ));

    // Ctrl-C cancels a running recognition, otherwise quits
    let on_interrupt = Arc::clone(&orchestrator);
    ctrlc::set_handler(move || {
        if !on_interrupt.cancel() {
            println!("\n👋 Bye");
            std::process::exit(130);
        }
    })?;

    let screenshot = FileCapture::new(&image).capture_region(&region)?;
    let mut session = ConsumerSession::new(
        queue,
        NavigationState::new(config.recognition.activation_threshold),
        ConsoleSink,
    );

    if !recognize_once(&orchestrator, &mut session, screenshot.clone()).await {
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "n" => session.next(),
            "p" => session.previous(),
            "c" => session.current(),
            "a" => {
                if let Some((x, y)) = session.activate() {
                    println!("🖱  click at {}, {}", x, y);
                }
            }
            "f" => {
                if let Some((x, y)) = session.force_activate() {
                    println!("🖱  click at {}, {}", x, y);
                }
            }
            "r" => {
                recognize_once(&orchestrator, &mut session, screenshot.clone()).await;
            }
            "q" => break,
            "" => {}
            other => println!("Unknown command '{}' (n, p, c, a, f, r, q)", other),
        }
    }

    let stats = orchestrator.stats();
    info!(
        "Session: {} recognitions, {} cache hits, {} fallbacks, {} remote",
        stats.recognitions, stats.cache_hits, stats.fallbacks, stats.remote_uses
    );
    Ok(())
}

/// Submit and wait for the outcome; false when there is nothing to navigate
async fn recognize_once(
    orchestrator: &Arc<RecognitionOrchestrator>,
    session: &mut ConsumerSession<ConsoleSink>,
    screenshot: vision_navigator::Screenshot,
) -> bool {
    if let Err(e) = orchestrator.submit(screenshot) {
        session.rejected(&e);
        return false;
    }

    match session.wait_outcome().await {
        Some(Ok(())) => true,
        Some(Err(e)) => {
            error!("Recognition failed: {}", e);
            false
        }
        None => false,
    }
}
