use crate::config::RunOverrides;
use crate::core::pipeline::RunOptions;
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "csv-relay")]
#[command(about = "Deliver rows of a delimited file to REST endpoints, with resume support")]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: String,

    /// Input file (overrides file.input_path)
    #[arg(short, long)]
    pub input: Option<String>,

    /// Records per dispatch batch
    #[arg(short, long)]
    pub batch_lines: Option<usize>,

    /// Field delimiter
    #[arg(short, long)]
    pub delimiter: Option<String>,

    /// First data line to process (line 1 is the header)
    #[arg(short, long)]
    pub start_line: Option<u64>,

    /// Stop after this many admitted records
    #[arg(short = 'n', long)]
    pub max_lines: Option<u64>,

    /// Directory for error logs
    #[arg(short = 'l', long)]
    pub log_dir: Option<String>,

    /// Resume (or name) a specific execution
    #[arg(long = "execution-id", visible_alias = "exec-id")]
    pub execution_id: Option<String>,

    /// Send every record to this endpoint
    #[arg(long)]
    pub endpoint_name: Option<String>,

    /// Build payloads without sending requests
    #[arg(long, visible_alias = "test")]
    pub dry_run: bool,

    /// Delete the execution checkpoint before starting
    #[arg(long)]
    pub reset_checkpoint: bool,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Log CPU and memory usage with progress updates
    #[arg(long)]
    pub monitor: bool,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

impl CliArgs {
    pub fn overrides(&self) -> RunOverrides {
        RunOverrides {
            input_path: self.input.clone(),
            batch_lines: self.batch_lines,
            delimiter: self.delimiter.clone(),
            start_line: self.start_line,
            max_lines: self.max_lines,
            log_dir: self.log_dir.clone(),
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            execution_id: self.execution_id.clone(),
            endpoint_override: self.endpoint_name.clone(),
            dry_run: self.dry_run,
            verbose: self.verbose,
            monitor: self.monitor,
            reset_checkpoint: self.reset_checkpoint,
            config_path: Some(PathBuf::from(&self.config)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cli_flags() {
        let args = CliArgs::parse_from([
            "csv-relay",
            "--config",
            "prod.toml",
            "-b",
            "25",
            "-n",
            "100",
            "--exec-id",
            "run-42",
            "--endpoint-name",
            "crm",
            "--test",
        ]);

        assert_eq!(args.config, "prod.toml");
        assert_eq!(args.execution_id.as_deref(), Some("run-42"));
        assert_eq!(args.endpoint_name.as_deref(), Some("crm"));
        assert!(args.dry_run);

        let overrides = args.overrides();
        assert_eq!(overrides.batch_lines, Some(25));
        assert_eq!(overrides.max_lines, Some(100));
        assert!(overrides.input_path.is_none());

        let options = args.run_options();
        assert_eq!(options.endpoint_override.as_deref(), Some("crm"));
        assert!(options.dry_run);
        assert!(!options.reset_checkpoint);
    }
}
