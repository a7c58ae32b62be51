mod app;
mod config;
mod event;
mod http;
mod logging;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "swrc")]
#[command(about = "Offline-first stale-while-revalidate cache for JSON APIs")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/swrc/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print the cached response for a URL, then the revalidated one
  Get {
    url: String,
    /// Freshness window in milliseconds
    #[arg(long)]
    ttl_ms: Option<u64>,
    /// Keep the response out of the on-disk cache
    #[arg(long)]
    no_persist: bool,
    /// Retries after the first failed attempt
    #[arg(long)]
    retries: Option<u32>,
  },
  /// Follow a URL, revalidating on focus, on an interval, or on `r`
  Watch {
    url: String,
    /// Refresh interval in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,
  },
  /// List a cursor-paginated endpoint
  Pages {
    url: String,
    #[arg(long, default_value_t = 5)]
    max_pages: usize,
  },
  /// Remove cached entries whose key starts with a prefix
  Invalidate { prefix: String },
  /// Show the current network status
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let mut app = app::App::new(config)?;
  app.start_probe().await;
  let defaults = app.options();

  match args.command {
    Command::Get {
      url,
      ttl_ms,
      no_persist,
      retries,
    } => {
      let mut options = defaults;
      if let Some(ttl_ms) = ttl_ms {
        options = options.with_ttl(Duration::from_millis(ttl_ms));
      }
      if let Some(retries) = retries {
        options = options.with_retries(retries);
      }
      if no_persist {
        options = options.with_persist(false);
      }
      app.get(&url, options).await
    }
    Command::Watch { url, interval_ms } => {
      let options = match interval_ms {
        Some(ms) => defaults.with_refresh_interval(Duration::from_millis(ms)),
        None => defaults,
      };
      app.watch(&url, options).await
    }
    Command::Pages { url, max_pages } => app.pages(&url, max_pages, defaults).await,
    Command::Invalidate { prefix } => app.invalidate(&prefix),
    Command::Status => app.status(),
  }
}
