use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{
    Args,
    Parser,
    Subcommand,
};

#[derive(Parser)]
#[command(name = "sparrow")]
#[command(about = "Sparrow - distributed infrastructure monitoring agent")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the agent.
    Run(RunArgs),
    /// Write the OpenAPI document describing the metrics API.
    GenDocs(GenDocsArgs),
}

#[derive(Args)]
pub struct RunArgs {
    #[arg(
        short = 'c',
        long,
        help = "Path to the startup config file",
        value_name = "PATH"
    )]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Address the API server binds to", value_name = "ADDRESS")]
    pub api_address: Option<SocketAddr>,

    #[arg(long, help = "Global log level", value_name = "LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Args)]
pub struct GenDocsArgs {
    #[arg(
        short = 'o',
        long,
        default_value = "openapi.yaml",
        help = "Where to write the document",
        value_name = "PATH"
    )]
    pub output: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_parses_flags() {
        let cli = Cli::try_parse_from([
            "sparrow",
            "run",
            "--config",
            "/etc/sparrow.yaml",
            "--api-address",
            "127.0.0.1:9090",
        ])
        .unwrap();

        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.config.unwrap().to_str().unwrap(), "/etc/sparrow.yaml");
        assert_eq!(args.api_address.unwrap(), "127.0.0.1:9090".parse().unwrap());
    }

    #[test]
    fn test_gen_docs_default_output() {
        let cli = Cli::try_parse_from(["sparrow", "gen-docs"]).unwrap();
        let Command::GenDocs(args) = cli.command else {
            panic!("expected gen-docs command");
        };
        assert_eq!(args.output.to_str().unwrap(), "openapi.yaml");
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["sparrow"]).is_err());
    }
}
