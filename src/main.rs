use std::{error::Error, num::NonZeroUsize, path::PathBuf, process, sync::Arc};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use tokio::sync::broadcast::error::RecvError;

use spool::{
    catalog::{Catalog, Http, Local},
    config::Config,
    controller::RepeatMode,
    engine::Headless,
    events::Event,
    service::{DownloadService, Options},
    storage::{Fs, Memory, Storage},
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Items to play
    ///
    /// Paths relative to the library with `--library`, or HTTP(S) URLs
    /// otherwise.
    #[arg(required = true, value_name = "ID")]
    ids: Vec<String>,

    /// Library directory to play files from
    #[arg(short, long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    library: Option<PathBuf>,

    /// Configuration file
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Directory to cache downloads in
    ///
    /// [default: keep downloads in memory]
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    cache_dir: Option<PathBuf>,

    /// Maximum number of simultaneous downloads
    #[arg(long, value_name = "N")]
    concurrency: Option<NonZeroUsize>,

    /// Number of items after the current one to download first
    #[arg(long, value_name = "N")]
    look_ahead: Option<usize>,

    /// Repeat mode: none, all or one
    #[arg(long, value_name = "MODE")]
    repeat: Option<RepeatMode>,

    /// Play the items in random order
    #[arg(long, default_value_t = false)]
    shuffle: bool,

    /// Keep downloads in the cache directory after playing
    #[arg(long, default_value_t = false)]
    save: bool,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Reads the configuration file, if any, and applies command line
/// overrides.
fn load_config(args: &Args) -> spool::error::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(look_ahead) = args.look_ahead {
        config.look_ahead = look_ahead;
    }
    if let Some(repeat) = args.repeat {
        config.repeat = repeat;
    }
    if args.cache_dir.is_some() {
        config.cache_dir.clone_from(&args.cache_dir);
    }

    config.validate()?;
    Ok(config)
}

/// Plays the given items until the queue finishes or the user interrupts.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args)?;

    let catalog: Arc<dyn Catalog> = match &args.library {
        Some(root) => Arc::new(Local::new(root)),
        None => Arc::new(Http::new()?),
    };

    let storage: Arc<dyn Storage> = match &config.cache_dir {
        Some(dir) => Arc::new(Fs::new(dir).await?),
        None => Arc::new(Memory::new()),
    };

    let service = DownloadService::new(config, catalog, storage, Arc::new(Headless::new()?))?;
    let mut events = service.subscribe();

    let options = Options {
        autoplay: true,
        shuffle: args.shuffle,
        save: args.save,
        ..Options::default()
    };
    if service.download_ids(&args.ids, options).await?.is_empty() {
        warn!("nothing to play");
        return Ok(());
    }

    loop {
        tokio::select! {
            // Prioritize shutdown signals.
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down gracefully");
                service.shutdown();
                break Ok(());
            }

            event = events.recv() => match event {
                Ok(Event::TrackChanged(id)) => {
                    if let Some(unit) = service.downloads().into_iter().find(|unit| unit.id() == id) {
                        info!("now playing {}", unit.item());
                    }
                }

                Ok(Event::DownloadFailed(id)) => {
                    // Skip what cannot be downloaded, or give up at the end.
                    let current = service.current_index();
                    let stuck = current
                        .and_then(|index| service.downloads().get(index).map(|unit| unit.id() == id))
                        .unwrap_or_default();
                    if stuck {
                        service.next();
                        if service.current_index() == current {
                            error!("nothing left to play");
                            break Ok(());
                        }
                        service.play();
                    }
                }

                Ok(Event::EngineFailed) => {
                    let cause = service.player_error().unwrap_or_default();
                    break Err(cause.into());
                }

                Ok(Event::QueueFinished) => break Ok(()),

                Ok(event) => debug!("{event:?}"),

                Err(RecvError::Lagged(missed)) => warn!("missed {missed} events"),

                Err(RecvError::Closed) => break Ok(()),
            }
        }
    }
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
