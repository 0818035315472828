//! RemoteFit CLI binary.
//!
//! Remote fit-control server and client.
//!
//! # Commands
//!
//! - `serve` - Run the session server with the built-in DE solver
//! - `echo` - Round-trip an ECHO through a server
//! - `fit` - Upload a model, run a fit and print its progress

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use remotefit::{
    optimizer::{BackgroundOptimizer, DifferentialEvolution},
    protocol::{Message, OptimizerUpdate},
    Config, RemoteClient, ServerConfig, SessionServer, VERSION,
};

#[derive(Parser)]
#[command(name = "remotefit")]
#[command(version = VERSION)]
#[command(about = "RemoteFit - drive a curve-fitting optimizer over TCP", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command
#[derive(Args)]
struct Common {
    /// Host to bind (serve) or connect to
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (serve) or connect to
    #[arg(short, long)]
    port: Option<u16>,

    /// Shared handshake key
    #[arg(short, long)]
    key: Option<String>,

    /// Config file (default: <config dir>/remotefit/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the session server
    Serve {
        #[command(flatten)]
        common: Common,

        /// Bind to all interfaces
        #[arg(long)]
        bind_all: bool,
    },

    /// Send an ECHO and print the reply
    Echo {
        /// Text to echo
        text: String,

        #[command(flatten)]
        common: Common,
    },

    /// Transfer a model, start a fit and stream its updates
    Fit {
        /// Model file (JSON)
        #[arg(short, long)]
        model: PathBuf,

        /// Fit parameter file (JSON); defaults when omitted
        #[arg(long)]
        params: Option<PathBuf>,

        /// Print updates as JSON lines
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        common: Common,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { common, bind_all } => cmd_serve(&common, bind_all),
        Commands::Echo { text, common } => cmd_echo(&common, &text),
        Commands::Fit {
            model,
            params,
            json,
            common,
        } => cmd_fit(&common, model, params, json),
    }
}

fn init_logging(common: &Common) {
    let log_level = if common.verbose { "debug" } else { "info" };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr);

    if common.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// File, then environment, then command-line flags
fn load_config(common: &Common) -> anyhow::Result<Config> {
    let mut config = Config::load(common.config.as_deref()).context("loading config")?;
    if let Some(host) = &common.host {
        config.server.host.clone_from(host);
        config.client.host.clone_from(host);
    }
    if let Some(port) = common.port {
        config.server.port = port;
        config.client.port = port;
    }
    if let Some(key) = &common.key {
        config.auth.key.clone_from(key);
    }
    Ok(config)
}

fn cmd_serve(common: &Common, bind_all: bool) -> anyhow::Result<()> {
    init_logging(common);

    let config = load_config(common)?;
    let mut server_config = ServerConfig::from_config(&config)?;
    if bind_all {
        server_config = server_config.bind_all();
    }

    let optimizer = Arc::new(BackgroundOptimizer::new(DifferentialEvolution::new()));
    let server = SessionServer::new(server_config, optimizer)?;
    tracing::info!("Starting RemoteFit server v{} on {}", VERSION, server.config().addr);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let on_signal = server.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received");
                on_signal.shutdown();
            }
        });

        server.serve().await?;
        Ok::<_, anyhow::Error>(())
    })
}

fn cmd_echo(common: &Common, text: &str) -> anyhow::Result<()> {
    init_logging(common);
    let config = load_config(common)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let mut client = RemoteClient::from_config(&config)
            .await
            .with_context(|| format!("connecting to {}", config.client.server_addr()))?;
        let reply = client.echo(text).await?;
        println!("{reply}");
        client.close().await?;
        Ok::<_, anyhow::Error>(())
    })
}

fn cmd_fit(
    common: &Common,
    model: PathBuf,
    params: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<()> {
    init_logging(common);
    let config = load_config(common)?;

    let model = std::fs::read(&model)
        .with_context(|| format!("reading model {}", model.display()))?;
    let params = match params {
        Some(path) => std::fs::read(&path)
            .with_context(|| format!("reading fit parameters {}", path.display()))?,
        None => Vec::new(),
    };

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let mut client = RemoteClient::from_config(&config)
            .await
            .with_context(|| format!("connecting to {}", config.client.server_addr()))?;
        client
            .transfer_model(Bytes::from(model), Bytes::from(params))
            .await?;
        client.start_fit().await?;

        let interrupt = tokio::signal::ctrl_c();
        tokio::pin!(interrupt);

        loop {
            let next = tokio::select! {
                res = &mut interrupt => {
                    res?;
                    None
                },
                message = client.recv() => Some(message?),
            };

            match next {
                // Interrupted: ask the server to stop and leave
                None => {
                    eprintln!("Interrupted, stopping fit");
                    client.stop_fit().await?;
                    break;
                },
                Some(None) => {
                    eprintln!("Server closed the session");
                    break;
                },
                Some(Some(message)) => {
                    if print_message(&message, json)? {
                        client.stop_fit().await?;
                        // Drain until the server closes
                        let drain = async {
                            while client.recv().await?.is_some() {}
                            Ok::<_, remotefit::RemoteFitError>(())
                        };
                        let _ = tokio::time::timeout(Duration::from_secs(5), drain).await;
                        break;
                    }
                },
            }
        }
        Ok::<_, anyhow::Error>(())
    })
}

/// Print one update. Returns true once the fit has ended.
fn print_message(message: &Message, json: bool) -> anyhow::Result<bool> {
    let Message::OptimizerUpdate(update) = message else {
        if let Message::Text(text) = message {
            println!("{text}");
        }
        return Ok(false);
    };

    if json {
        println!("{}", serde_json::to_string(update)?);
        return Ok(matches!(update, OptimizerUpdate::Result(_)));
    }

    match update {
        OptimizerUpdate::ParameterInfo(info) => {
            println!("Fitting {} parameters: {}", info.names.len(), info.names.join(", "));
        },
        OptimizerUpdate::Progress(progress) => {
            let fom = progress.best_fom().unwrap_or(f64::NAN);
            let marker = if progress.new_best { " *" } else { "" };
            println!("gen {:>5}  fom {:.6e}{}", progress.generation, fom, marker);
        },
        OptimizerUpdate::Result(result) => {
            println!(
                "Fit ended after {} generations: {:?}",
                result.generations, result.termination
            );
            if let Some(fom) = result.fom {
                println!("  fom    {fom:.6e}");
            }
            println!("  values {:?}", result.best_values);
            return Ok(true);
        },
    }
    Ok(false)
}
