//! CLI definitions using clap

use clap::Parser;
use std::path::PathBuf;

/// Ezio agent - accelerator allocation and resilience control plane
#[derive(Debug, Parser)]
#[command(name = "ezio-agent")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (yaml, toml, json, ini, ron or json5)
    #[arg(short = 'c', long, env = "EZIO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Use two simulated GPUs instead of querying nvidia-smi
    #[arg(long)]
    pub mock_hardware: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Print one health report as JSON and exit
    #[arg(long)]
    pub once: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::parse_from(["ezio-agent", "--config", "plane.toml", "--mock-hardware", "--once"]);
        assert_eq!(cli.config, Some(PathBuf::from("plane.toml")));
        assert!(cli.mock_hardware);
        assert!(cli.once);
        assert!(!cli.verbose);
    }
}
