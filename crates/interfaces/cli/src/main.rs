//! `hireling` — the provider daemon CLI.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hireling_config::{AppConfig, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(
    name = "hireling",
    version,
    about = "Rent out metered, sandboxed tool execution to agents"
)]
struct Cli {
    /// Path to the provider configuration file.
    #[arg(long, global = true, default_value = "hireling.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the provider daemon.
    Serve {
        /// Override the configured listen port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the tool whitelist this provider exposes.
    Tools,
    /// Validate the configuration (split percentages, tool whitelist,
    /// argument patterns) and exit.
    Check,
    /// Delete leftover session workspaces under the configured root.
    /// Offline janitor — run it against a stopped daemon.
    Clean {
        /// Actually delete; without this the command only lists.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Serve { port } => {
            let mut config = config;
            if let Some(port) = port {
                config.server.port = port;
            }
            let _log_guard = init_tracing(&config.telemetry)?;
            hireling_server::run(&config).await
        }
        Commands::Tools => print_tools(&config),
        Commands::Check => {
            config.validate()?;
            println!(
                "config ok: provider '{}', {} tool(s), split {}/{}/{}",
                config.provider.id,
                config.tools.len(),
                config.billing.provider_pct,
                config.billing.platform_pct,
                config.billing.reserve_pct,
            );
            Ok(())
        }
        Commands::Clean { yes } => clean_workspaces(&config, yes),
    }
}

fn init_tracing(telemetry: &TelemetryConfig) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(telemetry.log_level.clone()));

    if let Some(dir) = &telemetry.log_dir {
        let appender = tracing_appender::rolling::daily(dir, "hireling.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(None)
    }
}

fn print_tools(config: &AppConfig) -> Result<()> {
    let registry = config.build_registry()?;
    if registry.is_empty() {
        println!("no tools whitelisted — add [[tool]] tables to the config");
        return Ok(());
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "{:<16} {:>8} {:>10}  args", "id", "limit", "price/min")?;
    for tool in registry.list() {
        let args: Vec<String> = tool
            .args
            .iter()
            .map(|a| {
                if a.required {
                    format!("{}:{}", a.name, a.arg_type)
                } else {
                    format!("[{}:{}]", a.name, a.arg_type)
                }
            })
            .collect();
        writeln!(
            out,
            "{:<16} {:>7}s {:>9}¢  {}",
            tool.id,
            tool.max_duration_secs,
            tool.price_per_minute,
            args.join(" "),
        )?;
    }
    Ok(())
}

fn clean_workspaces(config: &AppConfig, yes: bool) -> Result<()> {
    let root = PathBuf::from(&config.workspace.root);
    if !root.exists() {
        println!("workspace root {} does not exist; nothing to clean", root.display());
        return Ok(());
    }

    let entries: Vec<PathBuf> = fs::read_dir(&root)
        .with_context(|| format!("cannot read workspace root {}", root.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();

    if entries.is_empty() {
        println!("no session workspaces under {}", root.display());
        return Ok(());
    }

    if !yes {
        for path in &entries {
            println!("{}", path.display());
        }
        bail!(
            "{} workspace(s) found; re-run with --yes to delete",
            entries.len()
        );
    }

    let mut removed = 0usize;
    for path in &entries {
        fs::remove_dir_all(path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
        removed += 1;
    }
    println!("removed {removed} workspace(s) under {}", root.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_lists_without_yes_and_deletes_with_it() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("sess-a")).unwrap();
        fs::create_dir(root.path().join("sess-b")).unwrap();

        let mut config = AppConfig::default();
        config.workspace.root = root.path().display().to_string();

        // Dry run refuses and leaves everything in place.
        assert!(clean_workspaces(&config, false).is_err());
        assert!(root.path().join("sess-a").exists());

        clean_workspaces(&config, true).unwrap();
        assert!(!root.path().join("sess-a").exists());
        assert!(!root.path().join("sess-b").exists());
    }

    #[test]
    fn clean_of_missing_root_is_a_no_op() {
        let mut config = AppConfig::default();
        config.workspace.root = "/definitely/not/here/hireling-test".into();
        clean_workspaces(&config, true).unwrap();
    }
}
