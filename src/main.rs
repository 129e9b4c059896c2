use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use wuflow::assimilator::{Assimilator, AssimilatorDaemon, NoopHandler};
use wuflow::config::ProjectConfig;
use wuflow::daemon::{install_shutdown_handler, run_daemon, DaemonOpts, DaemonPass};
use wuflow::error::Error;
use wuflow::feeder::{Feeder, FeederOpts};
use wuflow::file_deleter::{AntiqueDeleter, FileDeleter, SweeperOpts};
use wuflow::purge::{ArchiveCompression, PurgeOpts, Purger};
use wuflow::store::{JobStore, LibSqlBackend, Shard};
use wuflow::transitioner::{Transitioner, TransitionerDaemon};

#[derive(Parser, Debug)]
#[command(name = "wuflow")]
#[command(version)]
#[command(about = "Workunit lifecycle pipeline daemons")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the job store database (or WUFLOW_DB).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Verbosity: 1=error, 2=warn, 3=info, 4=debug.
    #[arg(short = 'd', long = "debug_level", global = true, default_value = "3")]
    debug_level: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Run a single pass and exit.
    #[arg(long = "one_pass")]
    one_pass: bool,

    /// Seconds to sleep between passes that found no work.
    #[arg(long = "sleep_interval", default_value = "5")]
    sleep_interval: u64,

    /// Shard the id space: process only ids with id mod N == R.
    #[arg(long = "mod", num_args = 2, value_names = ["N", "R"])]
    shard: Option<Vec<u32>>,
}

impl CommonArgs {
    fn daemon_opts(&self) -> DaemonOpts {
        DaemonOpts {
            one_pass: self.one_pass,
            sleep_interval: Duration::from_secs(self.sleep_interval),
        }
    }

    fn shard(&self) -> Result<Option<Shard>, String> {
        match self.shard.as_deref() {
            None => Ok(None),
            Some([n, r]) if *n > 0 && r < n => Ok(Some(Shard { n: *n, r: *r })),
            Some(other) => Err(format!("--mod wants N R with R < N, got {other:?}")),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Transition Engine.
    Transition {
        #[command(flatten)]
        common: CommonArgs,

        /// Process a single WU regardless of its schedule, then exit.
        #[arg(long = "wu_id")]
        wu_id: Option<i64>,
    },

    /// Run the Assimilation Runner.
    Assimilate {
        #[command(flatten)]
        common: CommonArgs,

        /// Restrict to one application by name.
        #[arg(long)]
        app: Option<String>,
    },

    /// Run the File Deletion Sweeper.
    FileDelete {
        #[command(flatten)]
        common: CommonArgs,

        /// Restrict to one application by name.
        #[arg(long)]
        app: Option<String>,

        /// Mark WU input files deleted without unlinking them.
        #[arg(long = "preserve_wu_files")]
        preserve_wu_files: bool,

        /// Mark result output files deleted without unlinking them.
        #[arg(long = "preserve_result_files")]
        preserve_result_files: bool,

        /// Delete files but never write states back.
        #[arg(long = "no_db_update")]
        no_db_update: bool,

        /// Only sweep WU input files.
        #[arg(long = "input_files_only", conflicts_with = "output_files_only")]
        input_files_only: bool,

        /// Only sweep result output files.
        #[arg(long = "output_files_only")]
        output_files_only: bool,

        /// Never retry items previously left in the error state.
        #[arg(long = "dont_retry_errors")]
        dont_retry_errors: bool,

        /// SQL LIKE pattern the item's manifest must match.
        #[arg(long = "xml_doc_like")]
        xml_doc_like: Option<String>,
    },

    /// Remove orphaned upload files older than any live workunit.
    AntiqueDelete {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Archive and delete finished workunits.
    Purge {
        #[command(flatten)]
        common: CommonArgs,

        /// Restrict to one application by name.
        #[arg(long)]
        app: Option<String>,

        /// Purge members of retired batches regardless of age.
        #[arg(long = "retired_wus")]
        retired_wus: bool,

        /// Minimum WU age in days (ignored with --retired_wus).
        #[arg(long = "min_age_days", default_value = "0")]
        min_age_days: f64,

        /// Cap on WUs purged per pass.
        #[arg(long)]
        max: Option<usize>,

        /// Gzip the archive files.
        #[arg(long)]
        gzip: bool,

        /// Zlib-compress the archive files.
        #[arg(long, conflicts_with = "gzip")]
        zlib: bool,

        /// Place archives in a per-day subdirectory.
        #[arg(long = "daily_dir")]
        daily_dir: bool,

        /// Rotate archive files after this many WUs (0 = never).
        #[arg(long = "max_wu_per_file", default_value = "0")]
        max_wu_per_file: usize,

        /// Archive without deleting rows.
        #[arg(long = "dont_delete")]
        dont_delete: bool,

        /// Delete rows without archiving them.
        #[arg(long = "no_archive", conflicts_with_all = ["gzip", "zlib", "daily_dir", "dont_delete"])]
        no_archive: bool,
    },

    /// Run the proportional-share feeder.
    Feed {
        #[command(flatten)]
        common: CommonArgs,

        /// A job stream: submitter user id and its share. Repeatable.
        #[arg(long = "user", num_args = 2, value_names = ["ID", "SHARE"], required = true)]
        user: Vec<String>,

        /// Slot table size.
        #[arg(long, default_value = "100")]
        slots: usize,

        /// Dispatch lease duration in seconds.
        #[arg(long = "lease_secs", default_value = "300")]
        lease_secs: i64,

        /// Drop unclaimed slot items older than this many minutes.
        #[arg(long = "purge_stale", value_name = "MINUTES")]
        purge_stale: Option<i64>,
    },
}

fn init_tracing(debug_level: u8) {
    let default = match debug_level {
        0 | 1 => "error",
        2 => "warn",
        3 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .init();
}

async fn open_store(db: Option<PathBuf>) -> Arc<dyn JobStore> {
    let path = db
        .or_else(|| std::env::var("WUFLOW_DB").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./data/wuflow.db"));
    match LibSqlBackend::new_local(&path).await {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            eprintln!("Error: failed to open job store at {}: {e}", path.display());
            std::process::exit(1);
        }
    }
}

async fn resolve_app(store: &Arc<dyn JobStore>, name: Option<&str>) -> Option<i64> {
    let name = name?;
    match store.app_by_name(name).await {
        Ok(Some(app)) => Some(app.id),
        Ok(None) => {
            eprintln!("Error: no application named {name:?}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: app lookup failed: {e}");
            std::process::exit(1);
        }
    }
}

fn parse_streams(raw: &[String]) -> Vec<(i64, f64)> {
    raw.chunks(2)
        .map(|pair| {
            let id = pair[0].parse::<i64>().unwrap_or_else(|_| {
                eprintln!("Error: bad user id {:?}", pair[0]);
                std::process::exit(1);
            });
            let share = pair.get(1).and_then(|s| s.parse::<f64>().ok()).unwrap_or_else(|| {
                eprintln!("Error: bad share for user {id}");
                std::process::exit(1);
            });
            (id, share)
        })
        .collect()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug_level);

    let config = match ProjectConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    let store = open_store(cli.db.clone()).await;

    let outcome = run_command(cli.command, &config, store).await;
    if let Err(e) = outcome {
        tracing::error!(error = %e, "Daemon failed");
        let code = match e {
            Error::Assimilate(wuflow::error::AssimilateError::Handler { code, .. }) => code,
            _ => 1,
        };
        std::process::exit(code);
    }
}

async fn run_command(
    command: Commands,
    config: &ProjectConfig,
    store: Arc<dyn JobStore>,
) -> Result<(), Error> {
    let shutdown = install_shutdown_handler();
    let stop_trigger = config.stop_trigger();

    let (mut daemon, opts): (Box<dyn DaemonPass>, DaemonOpts) = match command {
        Commands::Transition { common, wu_id } => {
            let shard = common.shard().unwrap_or_else(bad_args);
            let mut opts = common.daemon_opts();
            // Single-WU debug mode is inherently one-shot.
            if wu_id.is_some() {
                opts.one_pass = true;
            }
            let engine = Transitioner::new(store, shard, wu_id, config.delete_delay_secs);
            (Box::new(TransitionerDaemon::new(engine)), opts)
        }
        Commands::Assimilate { common, app } => {
            let shard = common.shard().unwrap_or_else(bad_args);
            let appid = resolve_app(&store, app.as_deref()).await;
            let runner = Assimilator::new(store, Arc::new(NoopHandler), appid, shard);
            (Box::new(AssimilatorDaemon::new(runner)), common.daemon_opts())
        }
        Commands::FileDelete {
            common,
            app,
            preserve_wu_files,
            preserve_result_files,
            no_db_update,
            input_files_only,
            output_files_only,
            dont_retry_errors,
            xml_doc_like,
        } => {
            let shard = common.shard().unwrap_or_else(bad_args);
            let appid = resolve_app(&store, app.as_deref()).await;
            let opts = SweeperOpts {
                preserve_wu_files,
                preserve_result_files,
                no_db_update,
                input_files_only,
                output_files_only,
                retry_errors: !dont_retry_errors,
                appid,
                xml_doc_like,
                shard,
            };
            let sweeper = FileDeleter::new(store, config, opts);
            (Box::new(sweeper), common.daemon_opts())
        }
        Commands::AntiqueDelete { common } => {
            let antique = AntiqueDeleter::new(store, config);
            (Box::new(antique), common.daemon_opts())
        }
        Commands::Purge {
            common,
            app,
            retired_wus,
            min_age_days,
            max,
            gzip,
            zlib,
            daily_dir,
            max_wu_per_file,
            dont_delete,
            no_archive,
        } => {
            let shard = common.shard().unwrap_or_else(bad_args);
            let appid = resolve_app(&store, app.as_deref()).await;
            let compression = if gzip {
                ArchiveCompression::Gzip
            } else if zlib {
                ArchiveCompression::Zlib
            } else {
                ArchiveCompression::None
            };
            let opts = PurgeOpts {
                retired_wus,
                min_age_secs: (min_age_days * 86_400.0) as i64,
                max,
                compression,
                daily_dir,
                max_wu_per_file,
                dont_delete,
                no_archive,
                appid,
                shard,
            };
            let purger = Purger::new(store, config.archive_dir.clone(), opts);
            (Box::new(purger), common.daemon_opts())
        }
        Commands::Feed {
            common,
            user,
            slots,
            lease_secs,
            purge_stale,
        } => {
            let streams = parse_streams(&user);
            let opts = FeederOpts {
                slot_count: slots,
                lease_secs,
                purge_stale_mins: purge_stale,
            };
            let mut feeder = Feeder::new(store, &streams, opts, config.reread_trigger())?;
            feeder.load_apps().await?;
            (Box::new(feeder), common.daemon_opts())
        }
    };

    run_daemon(daemon.as_mut(), &opts, &stop_trigger, &shutdown).await
}

fn bad_args<T>(message: String) -> T {
    eprintln!("Error: {message}");
    std::process::exit(1);
}
