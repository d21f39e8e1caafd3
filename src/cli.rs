//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use harvester_core::{DEFAULT_MAX_ATTEMPTS, DEFAULT_WORKERS};

/// Resilient course-material harvester.
///
/// Walks a course manifest and transfers every lesson material to local
/// storage, optionally mirroring completed courses into a remote folder.
/// Interrupted or crashed runs resume from the last committed lesson.
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(author, version, about)]
pub struct Args {
    /// Destination directory for harvested materials
    #[arg(short = 'd', long = "dir", default_value = "./harvest")]
    pub download_dir: PathBuf,

    /// Course manifest to harvest (produced by a discovery run)
    #[arg(short = 'm', long, default_value = "manifest.json")]
    pub manifest: PathBuf,

    /// Seconds to wait for a manual login when discovery needs one
    #[arg(short = 'w', long = "wait-time", default_value_t = 60)]
    pub wait_time: u64,

    /// Ignore saved progress and start over
    #[arg(short = 'r', long)]
    pub reset: bool,

    /// Run without an interactive display
    #[arg(long)]
    pub headless: bool,

    /// Disable parallel transfers (one worker, drain after every lesson)
    #[arg(long)]
    pub no_parallel: bool,

    /// Maximum concurrent transfers (1-20)
    #[arg(short = 'c', long, default_value_t = DEFAULT_WORKERS as u8, value_parser = clap::value_parser!(u8).range(1..=20))]
    pub concurrency: u8,

    /// Maximum attempts per transfer including the first (1-10)
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS as u8, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub max_retries: u8,

    /// Per-item timeout applied at drain barriers, in seconds
    #[arg(long, default_value_t = 300, value_parser = clap::value_parser!(u64).range(1..=7200))]
    pub item_timeout: u64,

    /// Mirror completed courses into this remote folder
    #[arg(long, value_name = "FOLDER")]
    pub mirror: Option<String>,

    /// Stored credential for the remote store
    #[arg(long, default_value = "token.json")]
    pub token_file: PathBuf,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default_args_parses_successfully() {
        let args = Args::try_parse_from(["harvester"]).unwrap();
        assert_eq!(args.download_dir, PathBuf::from("./harvest"));
        assert_eq!(args.manifest, PathBuf::from("manifest.json"));
        assert_eq!(args.wait_time, 60);
        assert!(!args.reset);
        assert!(!args.headless);
        assert!(!args.no_parallel);
        assert_eq!(args.concurrency, 3); // DEFAULT_WORKERS
        assert_eq!(args.max_retries, 3); // DEFAULT_MAX_ATTEMPTS
        assert_eq!(args.item_timeout, 300);
        assert!(args.mirror.is_none());
        assert_eq!(args.token_file, PathBuf::from("token.json"));
    }

    #[test]
    fn test_cli_dir_short_and_long_flag() {
        let args = Args::try_parse_from(["harvester", "-d", "/tmp/out"]).unwrap();
        assert_eq!(args.download_dir, PathBuf::from("/tmp/out"));

        let args = Args::try_parse_from(["harvester", "--dir", "/tmp/other"]).unwrap();
        assert_eq!(args.download_dir, PathBuf::from("/tmp/other"));
    }

    #[test]
    fn test_cli_reset_flag() {
        let args = Args::try_parse_from(["harvester", "-r"]).unwrap();
        assert!(args.reset);

        let args = Args::try_parse_from(["harvester", "--reset"]).unwrap();
        assert!(args.reset);
    }

    #[test]
    fn test_cli_headless_and_no_parallel_flags() {
        let args = Args::try_parse_from(["harvester", "--headless", "--no-parallel"]).unwrap();
        assert!(args.headless);
        assert!(args.no_parallel);
    }

    #[test]
    fn test_cli_wait_time_flag() {
        let args = Args::try_parse_from(["harvester", "-w", "120"]).unwrap();
        assert_eq!(args.wait_time, 120);
    }

    #[test]
    fn test_cli_concurrency_bounds() {
        let args = Args::try_parse_from(["harvester", "-c", "1"]).unwrap();
        assert_eq!(args.concurrency, 1);

        let args = Args::try_parse_from(["harvester", "-c", "20"]).unwrap();
        assert_eq!(args.concurrency, 20);

        let result = Args::try_parse_from(["harvester", "-c", "0"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::ValueValidation
        );

        let result = Args::try_parse_from(["harvester", "-c", "21"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::ValueValidation
        );
    }

    #[test]
    fn test_cli_max_retries_bounds() {
        let args = Args::try_parse_from(["harvester", "--max-retries", "10"]).unwrap();
        assert_eq!(args.max_retries, 10);

        let result = Args::try_parse_from(["harvester", "--max-retries", "0"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::ValueValidation
        );
    }

    #[test]
    fn test_cli_mirror_and_token_file() {
        let args = Args::try_parse_from([
            "harvester",
            "--mirror",
            "Course Backup",
            "--token-file",
            "/etc/harvester/token.json",
        ])
        .unwrap();
        assert_eq!(args.mirror.as_deref(), Some("Course Backup"));
        assert_eq!(args.token_file, PathBuf::from("/etc/harvester/token.json"));
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["harvester", "-v"]).unwrap();
        assert_eq!(args.verbose, 1);

        let args = Args::try_parse_from(["harvester", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let result = Args::try_parse_from(["harvester", "--help"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::DisplayHelp
        );
    }

    #[test]
    fn test_cli_invalid_flag_returns_error() {
        let result = Args::try_parse_from(["harvester", "--invalid-flag"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::UnknownArgument
        );
    }
}
