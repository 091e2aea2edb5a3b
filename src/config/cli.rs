use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the pagegate binary.
#[derive(Debug, Parser)]
#[command(name = "pagegate", version, about = "Full-page cache gateway operations")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "PAGEGATE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Probe every backend endpoint with a test write.
    Status,
    /// Remove every cached page.
    Flush,
    /// Remove the cached pages for the given permalinks.
    Purge(PurgeArgs),
}

#[derive(Debug, Args, Clone)]
pub struct PurgeArgs {
    /// Absolute permalinks, e.g. https://shop.example/boots/.
    #[arg(value_name = "URL", required = true)]
    pub urls: Vec<String>,

    /// Number of extra sub-pages (`<url>2/` .. `<url>{N+1}/`) to purge with each URL.
    #[arg(long, default_value_t = 0)]
    pub pages: usize,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the backend engine (memcached|memory).
    #[arg(long = "backend-engine", value_name = "ENGINE")]
    pub backend_engine: Option<String>,

    /// Override the comma-separated memcached server list.
    #[arg(long = "backend-servers", value_name = "LIST")]
    pub backend_servers: Option<String>,

    /// Toggle the memcached binary protocol.
    #[arg(
        long = "backend-binary",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub backend_binary: Option<bool>,
}
