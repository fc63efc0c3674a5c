mod app;

use clap::{Args as ClapArgs, Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

use issuelist::config::Config;
use issuelist::logging;
use issuelist::sentry::IssueStatus;

#[derive(Parser, Debug)]
#[command(name = "issuelist")]
#[command(about = "Browse and triage Sentry issue lists from the terminal")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/issuelist/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Sentry organization slug to use instead of the configured one
  #[arg(long, global = true)]
  org: Option<String>,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print pages of an issue list
  Issues {
    /// Issue list URL or query string; configured defaults when omitted
    #[arg(long)]
    url: Option<String>,

    /// Number of pages to print, following next cursors
    #[arg(long, default_value_t = 1)]
    pages: usize,

    #[arg(long)]
    json: bool,
  },
  /// Mark issues resolved
  Resolve(StatusArgs),
  /// Mark issues ignored
  Ignore(StatusArgs),
  /// Mark issues unresolved
  Unresolve(StatusArgs),
  /// Print the canonical cache key of a list URL
  Key {
    #[arg(long)]
    url: String,
  },
}

#[derive(ClapArgs, Debug)]
struct StatusArgs {
  /// Project the issues belong to
  #[arg(long)]
  project: Option<u64>,

  /// List URL to show after the change
  #[arg(long)]
  url: Option<String>,

  #[arg(long)]
  json: bool,

  #[arg(required = true)]
  ids: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.log_file.as_deref())?;

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(org) = args.org {
    config.sentry.organization = org;
  }

  let (status_args, status) = match args.command {
    Command::Key { url } => {
      app::print_key(&url, config.defaults.query_defaults()?);
      return Ok(());
    }
    Command::Issues { url, pages, json } => {
      let mut app = app::App::new(&config)?;
      return app.list_issues(url.as_deref(), pages, json).await;
    }
    Command::Resolve(a) => (a, IssueStatus::Resolved),
    Command::Ignore(a) => (a, IssueStatus::Ignored),
    Command::Unresolve(a) => (a, IssueStatus::Unresolved),
  };

  let mut app = app::App::new(&config)?;
  app
    .set_status(
      status_args.url.as_deref(),
      status_args.project,
      &status_args.ids,
      status,
      status_args.json,
    )
    .await
}
