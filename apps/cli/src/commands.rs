//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use seoscope_cache::ResultCache;
use seoscope_shared::{
    AppConfig, CacheBackend, CacheConfig, cache_db_path, init_config, load_config,
};
use seoscope_storage::{KvStore, LibsqlStore, MemoryStore, compute_fingerprint};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// seoscope: site audit pipeline tooling.
#[derive(Parser)]
#[command(
    name = "seoscope",
    version,
    about = "Inspect and manage the seoscope analysis cache and configuration.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Result cache administration.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Print the fingerprint of a newline-separated URL list.
    Fingerprint {
        /// File with one URL per line.
        #[arg(long)]
        urls_file: PathBuf,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Cache subcommands.
#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Show entry counts, sizes, and ages.
    Stats,
    /// Remove entries, optionally only those whose key contains SUBSTR.
    Clear {
        #[arg(long, value_name = "SUBSTR")]
        filter: Option<String>,
    },
    /// Remove the entry for one site and URL set.
    Invalidate {
        /// Site URL the analysis was run for.
        #[arg(long)]
        site: String,
        /// File with the discovered URLs, one per line.
        #[arg(long)]
        urls_file: PathBuf,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "seoscope=info",
        1 => "seoscope=debug",
        _ => "seoscope=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Cache { action } => {
            let config = load_config()?;
            let cache = open_cache(&config).await?;
            let outcome = match action {
                CacheAction::Stats => cmd_cache_stats(&cache).await,
                CacheAction::Clear { filter } => cmd_cache_clear(&cache, filter.as_deref()).await,
                CacheAction::Invalidate { site, urls_file } => {
                    cmd_cache_invalidate(&cache, &site, &urls_file).await
                }
            };
            cache.settle().await;
            outcome
        }
        Command::Fingerprint { urls_file } => cmd_fingerprint(&urls_file),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

/// Build the result cache over the configured backend.
async fn open_cache(config: &AppConfig) -> Result<ResultCache> {
    let store: Arc<dyn KvStore> = match config.cache.backend {
        CacheBackend::Libsql => {
            let path = cache_db_path(config)?;
            info!(path = %path.display(), "opening cache database");
            Arc::new(
                LibsqlStore::open(&path)
                    .await?
                    .with_quota(config.cache.quota_bytes),
            )
        }
        CacheBackend::Memory => {
            warn!("memory backend selected; the cache starts empty and is discarded on exit");
            match config.cache.quota_bytes {
                Some(quota) => Arc::new(MemoryStore::with_quota(quota)),
                None => Arc::new(MemoryStore::new()),
            }
        }
    };
    Ok(ResultCache::new(store, CacheConfig::from(config)))
}

/// One URL per line; blank lines and surrounding whitespace are ignored.
fn parse_url_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_url_list(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("cannot read URL list '{}'", path.display()))?;
    let urls = parse_url_list(&content);
    if urls.is_empty() {
        return Err(eyre!("URL list '{}' is empty", path.display()));
    }
    Ok(urls)
}

async fn cmd_cache_stats(cache: &ResultCache) -> Result<()> {
    let stats = cache.stats().await;
    let meta = cache.metadata().await;
    let fmt_time = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
    };

    println!();
    println!("  Live entries:  {}", stats.entry_count);
    println!("  Total size:    {} bytes", stats.total_bytes);
    println!("  Oldest entry:  {}", fmt_time(stats.oldest_created_at));
    println!("  Newest entry:  {}", fmt_time(stats.newest_created_at));
    println!("  Tracked count: {}", meta.entry_count);
    println!("  Last cleanup:  {}", meta.last_cleanup_at.to_rfc3339());
    println!(
        "  TTL:           {}h, ceiling {} entries",
        cache.config().default_ttl.num_hours(),
        cache.config().max_entries
    );
    println!();
    Ok(())
}

async fn cmd_cache_clear(cache: &ResultCache, filter: Option<&str>) -> Result<()> {
    let removed = cache.clear(filter).await;
    match filter {
        Some(f) => println!("Removed {removed} cache entries matching '{f}'"),
        None => println!("Removed {removed} cache entries"),
    }
    Ok(())
}

async fn cmd_cache_invalidate(cache: &ResultCache, site: &str, urls_file: &Path) -> Result<()> {
    let urls = read_url_list(urls_file)?;
    let key = seoscope_cache::CacheKey::resolve(site, urls.iter());
    cache.invalidate(site, &urls).await;
    println!(
        "Invalidated {} ({} URLs, fingerprint {})",
        key.domain,
        urls.len(),
        key.fingerprint
    );
    Ok(())
}

fn cmd_fingerprint(urls_file: &Path) -> Result<()> {
    let urls = read_url_list(urls_file)?;
    println!("{}", compute_fingerprint(&urls));
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_list_skips_blank_lines() {
        let urls = parse_url_list("https://a.com/1\n\n  https://a.com/2  \n\t\n");
        assert_eq!(urls, vec!["https://a.com/1", "https://a.com/2"]);
    }

    #[test]
    fn parses_cache_invalidate() {
        let cli = Cli::try_parse_from([
            "seoscope",
            "-vv",
            "cache",
            "invalidate",
            "--site",
            "https://shop.example",
            "--urls-file",
            "urls.txt",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Cache {
                action: CacheAction::Invalidate { site, urls_file },
            } => {
                assert_eq!(site, "https://shop.example");
                assert_eq!(urls_file, PathBuf::from("urls.txt"));
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn parses_clear_filter_and_json_logs() {
        let cli = Cli::try_parse_from([
            "seoscope",
            "--log-format",
            "json",
            "cache",
            "clear",
            "--filter",
            "shop.example",
        ])
        .unwrap();
        assert!(matches!(cli.log_format, LogFormat::Json));
        assert!(matches!(
            cli.command,
            Command::Cache { action: CacheAction::Clear { filter: Some(ref f) } } if f == "shop.example"
        ));
    }
}
