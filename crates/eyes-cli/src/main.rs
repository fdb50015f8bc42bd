mod config;
mod serve_cmd;

use std::path::Path;

use clap::{Parser, Subcommand};

use eyes_core::ControllerConfig;

use config::{ConfigFile, ControllerSection, EyesConfig, ServeOverrides};

#[derive(Parser)]
#[command(
    name = "eyes",
    about = "Controller for a fleet of remote latency-probe agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an eyes config file
    Init {
        /// Address agents connect to
        #[arg(long, default_value = ControllerConfig::DEFAULT_LISTEN_ADDR)]
        listen: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Accept agent connections and serve the operator HTTP API
    Serve {
        /// Address agents connect to (overrides EYES_LISTEN_ADDR)
        #[arg(long)]
        listen: Option<String>,
        /// HTTP bind address (overrides EYES_HTTP_BIND)
        #[arg(long)]
        http_bind: Option<String>,
        /// HTTP port (overrides EYES_HTTP_PORT)
        #[arg(long)]
        http_port: Option<u16>,
        /// Seconds an HTTP probe waits for its result
        #[arg(long)]
        probe_timeout: Option<u64>,
    },
    /// Print the controller version
    Version,
}

/// Execute the `eyes init` command: write the config file at `path`.
fn cmd_init(path: &Path, listen: &str, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = ConfigFile {
        controller: ControllerSection {
            listen_addr: listen.to_string(),
            ..ControllerSection::default()
        },
        ..ConfigFile::default()
    };
    config::save_config(path, &cfg)?;

    println!("Config written to {}", path.display());
    println!("  controller.listen_addr = {listen}");
    println!("  http.bind = {}:{}", cfg.http.bind, cfg.http.port);
    println!();
    println!("Next: run `eyes serve` to start accepting agents.");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { listen, force } => {
            cmd_init(&config::config_path(), &listen, force)?;
        }
        Commands::Serve {
            listen,
            http_bind,
            http_port,
            probe_timeout,
        } => {
            let resolved = EyesConfig::resolve(&ServeOverrides {
                listen,
                http_bind,
                http_port,
                probe_timeout_secs: probe_timeout,
            })?;
            serve_cmd::run_serve(resolved).await?;
        }
        Commands::Version => {
            let (major, minor, patch) = eyes_core::version();
            println!("eyes {major}.{minor}.{patch}");
        }
    }

    Ok(())
}
