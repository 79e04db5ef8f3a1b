//! CLI mode for osync - drives one synchronizer over the disk cache.

mod progress;

use std::path::{Path, PathBuf};

use crate::manifest::generate;
use crate::{
    AppConfig, BuildManifest, CacheStorage, CoreSet, DiskCacheStorage, HttpFetcher,
    MessageOutcome, NoClients, Request, SyncConfig, Synchronizer,
};

use progress::{OfflineProgressBar, print_activation, print_offline_summary};

const DEFAULT_MANIFEST_OUT: &str = "build-manifest.json";

/// Synchronizer wired to the on-disk cache and the real network.
pub type DiskSynchronizer = Synchronizer<DiskCacheStorage, HttpFetcher, NoClients>;

/// A parsed subcommand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Hash a compiled bundle into a build manifest.
    Manifest {
        build_dir: PathBuf,
        core: Vec<String>,
        output: PathBuf,
    },
    /// Install and activate the configured build.
    Install,
    /// Cache every manifest resource not cached yet.
    Offline,
    /// Answer one GET request through the cache.
    Get { url: String },
    /// Show cache state for the configured build.
    Status,
    /// Deliver a control message payload.
    Message { payload: String },
    /// Run the local offline proxy.
    Serve,
    Help,
}

/// Parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub config_path: Option<PathBuf>,
    pub command: Command,
}

/// Parses arguments (without the program name).
///
/// # Errors
///
/// Returns a message suitable for printing when the arguments are invalid.
pub fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut config_path = None;
    let mut positional = Vec::new();
    let mut core = Vec::new();
    let mut output = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let value = args.get(i).ok_or("--config requires a path")?;
                config_path = Some(PathBuf::from(value));
            }
            "-c" | "--core" => {
                i += 1;
                let value = args.get(i).ok_or("--core requires a key list")?;
                core.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|k| !k.is_empty())
                        .map(String::from),
                );
            }
            "-o" | "--output" => {
                i += 1;
                let value = args.get(i).ok_or("--output requires a path")?;
                output = Some(PathBuf::from(value));
            }
            "-h" | "--help" => {
                return Ok(CliArgs {
                    config_path,
                    command: Command::Help,
                });
            }
            arg if !arg.starts_with('-') => positional.push(arg.to_string()),
            other => return Err(format!("Unknown option: {other}")),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        None => Command::Help,
        Some("manifest") => Command::Manifest {
            build_dir: positional
                .next()
                .map(PathBuf::from)
                .ok_or("manifest requires a build directory")?,
            core,
            output: output.unwrap_or_else(|| PathBuf::from(DEFAULT_MANIFEST_OUT)),
        },
        Some("install") => Command::Install,
        Some("offline") => Command::Offline,
        Some("get") => Command::Get {
            url: positional.next().ok_or("get requires a URL")?,
        },
        Some("status") => Command::Status,
        Some("message") => Command::Message {
            payload: positional.next().ok_or("message requires a payload")?,
        },
        Some("serve") => Command::Serve,
        Some(other) => return Err(format!("Unknown command: {other}")),
    };

    if let Some(extra) = positional.next() {
        return Err(format!("Unexpected argument: {extra}"));
    }

    Ok(CliArgs {
        config_path,
        command,
    })
}

pub fn print_usage() {
    eprintln!("Usage: osync [--config <PATH>] <COMMAND>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  manifest <DIR>      Hash a compiled bundle into a build manifest");
    eprintln!("    -c, --core <K,..> Keys fetched eagerly at install");
    eprintln!("    -o, --output <P>  Output path (default: {DEFAULT_MANIFEST_OUT})");
    eprintln!("  install             Install and activate the configured build");
    eprintln!("  offline             Cache every resource for offline use");
    eprintln!("  get <URL>           Answer one GET request through the cache");
    eprintln!("  status              Show cache state");
    eprintln!("  message <PAYLOAD>   Deliver a control message (skipWaiting, downloadOffline)");
    eprintln!("  serve               Run the local offline proxy");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <PATH>     Config file (default: {})", AppConfig::default_path().display());
    eprintln!("  -h, --help          Show this help");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  RUST_LOG            Log filter (default: info)");
}

/// Runs a parsed command.
///
/// # Errors
///
/// Returns an error if loading configuration, the manifest, or the command
/// itself fails.
pub async fn run(args: CliArgs) -> crate::Result<()> {
    let config_path = args.config_path.unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load(&config_path)?;

    match args.command {
        Command::Help => {
            print_usage();
            Ok(())
        }
        Command::Manifest {
            build_dir,
            core,
            output,
        } => run_manifest(&build_dir, &core, &output),
        Command::Install => run_install(&config).await,
        Command::Offline => run_offline(&resume(&config)?).await,
        Command::Get { url } => run_get(&resume(&config)?, &url).await,
        Command::Status => run_status(&resume(&config)?).await,
        Command::Message { payload } => run_message(&resume(&config)?, &payload).await,
        Command::Serve => run_serve(&config).await,
    }
}

type SyncParts = (SyncConfig, BuildManifest, DiskCacheStorage, HttpFetcher);

fn sync_parts(config: &AppConfig) -> crate::Result<SyncParts> {
    let build = BuildManifest::load(&config.manifest_path)?;
    Ok((
        config.sync.to_sync_config(),
        build,
        DiskCacheStorage::new(&config.cache_dir),
        HttpFetcher::with_defaults()?,
    ))
}

/// Builds an instance over a cache that an earlier `install` activated.
fn resume(config: &AppConfig) -> crate::Result<DiskSynchronizer> {
    let (sync_config, build, storage, fetcher) = sync_parts(config)?;
    Ok(Synchronizer::resume(sync_config, build, storage, fetcher, NoClients))
}

fn run_manifest(build_dir: &Path, core: &[String], output: &Path) -> crate::Result<()> {
    let build = generate(build_dir, CoreSet::new(core.iter().map(String::as_str)))?;
    build.save(output)?;
    println!(
        "Wrote {} ({} resources, {} core)",
        output.display(),
        build.resources.len(),
        build.core.len()
    );
    Ok(())
}

async fn run_install(config: &AppConfig) -> crate::Result<()> {
    let (sync_config, build, storage, fetcher) = sync_parts(config)?;
    let sync = Synchronizer::new(sync_config, build, storage, fetcher, NoClients);

    println!("Installing {} core resource(s)...", sync.build().core.len());
    sync.install().await?;
    let outcome = sync.activate().await?;
    print_activation(&outcome);
    Ok(())
}

async fn run_offline(sync: &DiskSynchronizer) -> crate::Result<()> {
    let missing = sync.missing_resources().await?;
    if missing.is_empty() {
        println!("All {} resource(s) already cached.", sync.build().resources.len());
        return Ok(());
    }

    let bar = OfflineProgressBar::new(missing.len() as u64);
    let report = sync.download_offline(&bar).await;
    bar.finish();
    print_offline_summary(&report?);
    Ok(())
}

async fn run_get(sync: &DiskSynchronizer, url: &str) -> crate::Result<()> {
    match sync.handle_fetch(&Request::get(url)).await? {
        Some(response) => {
            println!("{} ({} bytes)", response.status, response.body.len());
            for (name, value) in &response.headers {
                println!("  {name}: {value}");
            }
        }
        None => println!("Not a cached resource: {url}"),
    }
    Ok(())
}

async fn run_status(sync: &DiskSynchronizer) -> crate::Result<()> {
    let partitions = &sync.config().partitions;
    println!("Origin:   {}", sync.config().origin);
    for name in [&partitions.content, &partitions.temp, &partitions.manifest] {
        if sync.storage().has_partition(name).await? {
            let count = sync.storage().keys(name).await?.len();
            println!("  {name:<20} {count} entr{}", if count == 1 { "y" } else { "ies" });
        } else {
            println!("  {name:<20} absent");
        }
    }

    let total = sync.build().resources.len();
    let missing = sync.missing_resources().await?.len();
    println!("Cached:   {}/{total} manifest resource(s)", total - missing);
    Ok(())
}

async fn run_message(sync: &DiskSynchronizer, payload: &str) -> crate::Result<()> {
    let outcome = sync.handle_message(payload).await?;
    match outcome {
        MessageOutcome::SkippedWaiting => println!("Skipped waiting."),
        MessageOutcome::DownloadedOffline(report) => print_offline_summary(&report),
        MessageOutcome::Ignored => println!("Ignored unknown message {payload:?}"),
    }
    Ok(())
}

#[cfg(feature = "server")]
async fn run_serve(config: &AppConfig) -> crate::Result<()> {
    let sync = std::sync::Arc::new(resume(config)?);
    crate::server::run_server(sync, &config.server.host, config.server.port).await
}

#[cfg(not(feature = "server"))]
async fn run_serve(_config: &AppConfig) -> crate::Result<()> {
    Err(crate::Error::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "server support not compiled in",
    )))
}
