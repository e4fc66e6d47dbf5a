use anyhow::Result;
use clap::{Parser, Subcommand};
use reshard_phase::logging::{self, LogConfig};
use reshard_phase::ui::StatusMode;
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "reshard-phase")]
#[command(version, about = "Phase execution engine for hash ring resharding")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format: pretty, json
    #[arg(long, default_value = "pretty", global = true)]
    pub log_format: String,

    /// Also write JSON logs to a daily-rolling file in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Configuration file
    #[arg(long, env = "RESHARD_CONFIG", default_value = "reshard.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// View, validate or create the configuration file
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Render a script template for a plan without running it
    Render {
        /// Template name (e.g. remap-vnodes)
        template: String,

        /// Plan file (JSON with uuid, shard, new_shard)
        #[arg(long)]
        plan: PathBuf,

        /// Extra variable, repeatable (NAME=VALUE)
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },
    /// Post a progress message, as a remote script would
    Report {
        /// Progress URL handed to the script
        #[arg(long, env = "STATUS_URL")]
        url: String,

        #[arg(long)]
        message: String,

        #[arg(long, requires = "total")]
        processed: Option<u64>,

        #[arg(long, requires = "processed")]
        total: Option<u64>,

        /// Report successful completion
        #[arg(long, conflicts_with = "error")]
        finished: bool,

        /// Report failure
        #[arg(long)]
        error: bool,
    },
    /// Run a progress server and log every message it receives
    ServeProgress {
        /// Address to bind (overrides config)
        #[arg(long)]
        bind: Option<String>,

        /// Host placed in progress URLs (overrides config)
        #[arg(long)]
        advertise_host: Option<String>,

        /// Status display: terminal, log
        #[arg(long, default_value = "terminal")]
        status: String,
    },
    /// Print the restart window for a fleet of N instances
    Concurrency { instances: usize },
    /// List the phases this engine can run
    Phases,
    /// List the embedded script templates
    Templates,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default configuration file
    Init,
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{}'", s)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let _log_guard = logging::init(&LogConfig {
        verbose: cli.verbose,
        format: cli.log_format.parse()?,
        log_dir: cli.log_dir.clone(),
    })?;

    match &cli.command {
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
        Commands::Render {
            template,
            plan,
            vars,
        } => cmd::cmd_render(&cli.config, template, plan, vars)?,
        Commands::Report {
            url,
            message,
            processed,
            total,
            finished,
            error,
        } => {
            cmd::cmd_report(url, message, processed.zip(*total), *finished, *error).await?;
        }
        Commands::ServeProgress {
            bind,
            advertise_host,
            status,
        } => {
            let mode: StatusMode = status.parse()?;
            cmd::cmd_serve_progress(&cli.config, bind.clone(), advertise_host.clone(), mode)
                .await?;
        }
        Commands::Concurrency { instances } => cmd::cmd_concurrency(*instances),
        Commands::Phases => cmd::cmd_phases(),
        Commands::Templates => cmd::cmd_templates(),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var() {
        assert_eq!(
            parse_var("SHARD=3").unwrap(),
            ("SHARD".to_string(), "3".to_string())
        );
        assert_eq!(
            parse_var("URL=http://x/?a=b").unwrap(),
            ("URL".to_string(), "http://x/?a=b".to_string())
        );
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=x").is_err());
    }

    #[test]
    fn test_cli_parses_report() {
        let cli = Cli::try_parse_from([
            "reshard-phase",
            "report",
            "--url",
            "http://127.0.0.1:1/progress/abc",
            "--message",
            "done",
            "--processed",
            "10",
            "--total",
            "10",
            "--finished",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Report { finished: true, .. }));
    }

    #[test]
    fn test_cli_rejects_finished_and_error() {
        let result = Cli::try_parse_from([
            "reshard-phase",
            "report",
            "--url",
            "http://x",
            "--message",
            "m",
            "--finished",
            "--error",
        ]);
        assert!(result.is_err());
    }
}
