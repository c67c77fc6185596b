//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

/// Mirror a catalog's files to disk through a supervised aria2 engine.
///
/// Records are read from the catalog database, downloaded by aria2 into a
/// staging directory and moved into the download directory on completion.
#[derive(Parser, Debug)]
#[command(name = "mirror")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/mirror/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download every pending file of the catalog
    Run(RunArgs),
    /// Print record counts per status
    Stats(StatsArgs),
}

/// Options for `mirror run`. Unset values come from the config file, then defaults.
#[derive(ClapArgs, Debug, Default, Clone)]
pub struct RunArgs {
    /// Catalog database
    #[arg(short, long, value_name = "PATH")]
    pub database: Option<PathBuf>,

    /// Final download directory
    #[arg(long, value_name = "DIR")]
    pub download_dir: Option<PathBuf>,

    /// Staging directory for in-progress files
    #[arg(long, value_name = "DIR")]
    pub staging_dir: Option<PathBuf>,

    /// Directory for engine stdout/stderr logs
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// aria2c executable
    #[arg(long, value_name = "PATH")]
    pub engine: Option<PathBuf>,

    /// Maximum concurrent downloads (1-100)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// Download submissions allowed per 61 second window (1-1000)
    #[arg(short = 'l', long, value_parser = clap::value_parser!(u16).range(1..=1000))]
    pub request_limit: Option<u16>,

    /// Proxy for the engine (e.g. http://127.0.0.1:7890)
    #[arg(long, value_name = "URL")]
    pub proxy: Option<String>,

    /// Keep running and pick up new records until interrupted
    #[arg(long)]
    pub service: bool,
}

/// Options for `mirror stats`.
#[derive(ClapArgs, Debug, Default, Clone)]
pub struct StatsArgs {
    /// Catalog database
    #[arg(short, long, value_name = "PATH")]
    pub database: Option<PathBuf>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn run_args(argv: &[&str]) -> RunArgs {
        match Args::try_parse_from(argv).unwrap().command {
            Command::Run(run) => run,
            Command::Stats(_) => panic!("expected run subcommand"),
        }
    }

    #[test]
    fn test_cli_run_defaults_are_unset() {
        let run = run_args(&["mirror", "run"]);
        assert!(run.database.is_none());
        assert!(run.concurrency.is_none());
        assert!(run.request_limit.is_none());
        assert!(!run.service);
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["mirror", "-vv", "run"]).unwrap();
        assert_eq!(args.verbose, 2);

        let args = Args::try_parse_from(["mirror", "run", "--verbose"]).unwrap();
        assert_eq!(args.verbose, 1);
    }

    #[test]
    fn test_cli_quiet_flag_sets_quiet() {
        let args = Args::try_parse_from(["mirror", "stats", "-q"]).unwrap();
        assert!(args.quiet);
    }

    #[test]
    fn test_cli_run_flags() {
        let run = run_args(&[
            "mirror",
            "run",
            "-d",
            "catalog.db",
            "--download-dir",
            "out",
            "-c",
            "5",
            "-l",
            "30",
            "--proxy",
            "http://127.0.0.1:7890",
            "--service",
        ]);
        assert_eq!(run.database, Some(PathBuf::from("catalog.db")));
        assert_eq!(run.download_dir, Some(PathBuf::from("out")));
        assert_eq!(run.concurrency, Some(5));
        assert_eq!(run.request_limit, Some(30));
        assert_eq!(run.proxy.as_deref(), Some("http://127.0.0.1:7890"));
        assert!(run.service);
    }

    #[test]
    fn test_cli_concurrency_zero_rejected() {
        let err = Args::try_parse_from(["mirror", "run", "-c", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_request_limit_over_max_rejected() {
        let err = Args::try_parse_from(["mirror", "run", "-l", "1001"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_subcommand_required() {
        let err = Args::try_parse_from(["mirror"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingSubcommand);
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let err = Args::try_parse_from(["mirror", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_version_flag_shows_version() {
        let err = Args::try_parse_from(["mirror", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_cli_config_path_is_global() {
        let args = Args::try_parse_from(["mirror", "stats", "--config", "alt.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("alt.toml")));
    }
}
