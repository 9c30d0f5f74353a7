mod callback_cmd;
mod config;
mod handoff;
mod run_cmd;
mod smoke_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use config::{CliOverrides, ProbeConfig};
use handoff::CodeHandoff;

#[derive(Parser)]
#[command(
    name = "actprobe",
    about = "Drive an action-execution service over stdio JSON-RPC and verify its workflow"
)]
struct Cli {
    /// Config file (defaults to $XDG_CONFIG_HOME/actprobe/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Target command line (overrides ACTPROBE_TARGET_COMMAND)
    #[arg(long, global = true)]
    target: Option<String>,

    /// Database URL handed to the target (overrides ACTPROBE_DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an actprobe config file with a fresh master key
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the full workflow against a freshly launched target
    Run {
        /// Repeat the workflow this many times against the same process
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        runs: u32,
        /// Delete the action before registering it
        #[arg(long)]
        fresh: bool,
        /// Print the session as JSON
        #[arg(long)]
        json: bool,
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        action_name: Option<String>,
        /// Path of the action definition the target should load
        #[arg(long)]
        config_path: Option<String>,
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Run the basic liveness checks
    Smoke {
        /// Print the session as JSON
        #[arg(long)]
        json: bool,
    },
    /// Serve the OAuth2 redirect endpoint and capture the authorization code
    Callback {
        /// Listen port (overrides ACTPROBE_CALLBACK_PORT, default 8080)
        #[arg(long)]
        port: Option<u16>,
        /// Handoff file (overrides ACTPROBE_AUTH_CODE_PATH)
        #[arg(long)]
        output: Option<PathBuf>,
        /// Shut down after the first captured code
        #[arg(long)]
        once: bool,
    },
    /// Print the captured authorization code and remove the handoff file
    Code {
        /// Handoff file (overrides ACTPROBE_AUTH_CODE_PATH)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_init(path: &std::path::Path, database_url: Option<&str>, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let master_key = config::generate_master_key();

    let mut cfg = config::ConfigFile::default();
    cfg.target.master_key = Some(master_key.clone());
    if let Some(url) = database_url {
        cfg.target.database_url = url.to_string();
    }

    config::save_config(&cfg, path)?;

    println!("Config written to {}", path.display());
    println!(
        "  target.command = {} {}",
        cfg.target.command,
        cfg.target.args.join(" ")
    );
    println!("  target.database_url = {}", cfg.target.database_url);
    println!("  target.master_key = {}...{}", &master_key[..8], &master_key[56..]);
    println!();
    println!("Next: run `actprobe smoke` to check that the target starts and answers.");

    Ok(())
}

fn cmd_code(output: Option<PathBuf>) -> anyhow::Result<bool> {
    let handoff = CodeHandoff::resolve(output, |name| std::env::var(name).ok());
    match handoff.take()? {
        Some(code) => {
            println!("{code}");
            Ok(true)
        }
        None => {
            eprintln!("No authorization code at {}", handoff.path().display());
            Ok(false)
        }
    }
}

/// Token cancelled on the first Ctrl+C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!("interrupt received, stopping target");
                trigger.cancel();
            }
            Err(e) => tracing::warn!("failed to listen for Ctrl+C: {e}"),
        }
    });
    token
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reports go to stdout; logs stay on stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_file = cli.config.clone().unwrap_or_else(config::config_path);
    let overrides = CliOverrides {
        target: cli.target.clone(),
        database_url: cli.database_url.clone(),
    };

    let passed = match cli.command {
        Commands::Init { force } => {
            cmd_init(&config_file, cli.database_url.as_deref(), force)?;
            true
        }
        Commands::Run {
            runs,
            fresh,
            json,
            tenant,
            provider,
            action_name,
            config_path,
            user_id,
        } => {
            let resolved = ProbeConfig::resolve(&config_file, &overrides)?;
            let workflow = run_cmd::WorkflowOverrides {
                tenant,
                provider,
                action_name,
                config_path,
                user_id,
                fresh,
            };
            run_cmd::run_workflow(resolved, workflow, runs, json, cancel_on_ctrl_c()).await?
        }
        Commands::Smoke { json } => {
            let resolved = ProbeConfig::resolve(&config_file, &overrides)?;
            smoke_cmd::run_smoke(resolved, json, cancel_on_ctrl_c()).await?
        }
        Commands::Callback { port, output, once } => {
            let env = |name: &str| std::env::var(name).ok();
            let port = callback_cmd::resolve_port(port, env)?;
            let handoff = CodeHandoff::resolve(output, env);
            callback_cmd::run_callback(port, handoff, once).await?;
            true
        }
        Commands::Code { output } => cmd_code(output)?,
    };

    if !passed {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod test_util {
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Serialize tests that mutate process environment variables.
    pub fn lock_env() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_rejects_zero_runs() {
        assert!(Cli::try_parse_from(["actprobe", "run", "--runs", "0"]).is_err());
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "actprobe",
            "smoke",
            "--target",
            "./target/debug/openact-stdio",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.target.as_deref(), Some("./target/debug/openact-stdio"));
        assert!(matches!(cli.command, Commands::Smoke { json: true }));
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");

        cmd_init(&path, Some("sqlite:test.db"), false).unwrap();
        let first = config::load_config(&path).unwrap();
        assert_eq!(first.target.database_url, "sqlite:test.db");

        let err = cmd_init(&path, None, false).unwrap_err();
        assert!(err.to_string().contains("already exists"));

        cmd_init(&path, None, true).unwrap();
        let second = config::load_config(&path).unwrap();
        assert_ne!(first.target.master_key, second.target.master_key);
    }
}
