#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use cse_bus::{daemon, Config, ConfigCommands};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// `cse-bus` - AMQP and MQTT request dispatcher for the container service extension.
#[derive(Parser, Debug)]
#[command(name = "cse-bus")]
#[command(version)]
#[command(about = "Consume API requests from AMQP/MQTT and publish the replies.", long_about = None)]
struct Cli {
    /// Directory holding config.toml (default: $CSE_BUS_CONFIG_DIR or ~/.cse-bus)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the configured brokers and serve requests until Ctrl+C
    Run,

    /// Manage the configuration file
    #[command(long_about = "\
Manage the cse-bus configuration file.

Examples:
  cse-bus config init                 # write ~/.cse-bus/config.toml
  cse-bus config check                # validate and summarise
  cse-bus config schema > schema.json")]
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },

    /// Generate shell completion script to stdout
    #[command(long_about = "\
Generate shell completion scripts for `cse-bus`.

The script is printed to stdout so it can be sourced directly:

Examples:
  source <(cse-bus completions bash)
  cse-bus completions zsh > ~/.zfunc/_cse-bus")]
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.as_os_str().is_empty() {
            bail!("--config-dir cannot be empty");
        }
    }

    // Completions must remain stdout-only and should not initialize logging.
    if let Commands::Completions { shell } = &cli.command {
        let mut stdout = std::io::stdout().lock();
        write_shell_completion(*shell, &mut stdout)?;
        return Ok(());
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config_dir = cli.config_dir.as_deref();
    match cli.command {
        Commands::Completions { .. } => Ok(()),
        Commands::Run => {
            let config = Config::load(config_dir).await?;
            daemon::run(config).await
        }
        Commands::Config { config_command } => run_config_command(config_command, config_dir).await,
    }
}

async fn run_config_command(command: ConfigCommands, config_dir: Option<&Path>) -> Result<()> {
    match command {
        ConfigCommands::Check => {
            let config = Config::load(config_dir).await?;
            println!("Config OK: {}", config.config_path.display());
            if let Some(amqp) = &config.amqp {
                println!(
                    "  amqp: {} exchange={} queue={} consumers={}",
                    amqp.redacted_uri(),
                    amqp.exchange_name,
                    amqp.queue(),
                    amqp.consumer_count
                );
            }
            if let Some(mqtt) = &config.mqtt {
                println!(
                    "  mqtt: {} listen={} respond={} verify_ssl={}",
                    mqtt.websocket_url(),
                    mqtt.listen_topic,
                    mqtt.respond_topic,
                    mqtt.verify_ssl
                );
            }
            println!(
                "  workers per connection: {}, dedup capacity: {}",
                config.dispatch.worker_pool_size, config.dispatch.dedup_registry_capacity
            );
            Ok(())
        }
        ConfigCommands::Init { force } => {
            let config = Config::init(config_dir, force).await?;
            println!("Wrote {}", config.config_path.display());
            println!("Edit the [amqp] section (or add [mqtt]) before running `cse-bus run`.");
            Ok(())
        }
        ConfigCommands::Schema => {
            let schema = schemars::schema_for!(Config);
            println!(
                "{}",
                serde_json::to_string_pretty(&schema).context("failed to serialize JSON Schema")?
            );
            Ok(())
        }
    }
}

impl From<CompletionShell> for clap_complete::Shell {
    fn from(shell: CompletionShell) -> Self {
        match shell {
            CompletionShell::Bash => Self::Bash,
            CompletionShell::Fish => Self::Fish,
            CompletionShell::Zsh => Self::Zsh,
            CompletionShell::PowerShell => Self::PowerShell,
            CompletionShell::Elvish => Self::Elvish,
        }
    }
}

/// Completion script for `shell`, written to `out`.
fn write_shell_completion<W: Write>(shell: CompletionShell, out: &mut W) -> Result<()> {
    let mut cli = Cli::command();
    let name = cli.get_name().to_owned();
    clap_complete::generate(clap_complete::Shell::from(shell), &mut cli, name, out);
    out.flush().context("failed to flush completion script")
}
