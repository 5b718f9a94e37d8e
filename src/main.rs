//! CLI for rabbit-inbound
//!
//! Subcommands:
//! - `run`: consume every configured endpoint (or one of them) until Ctrl-C
//! - `check`: validate the configuration and print the endpoints it defines

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use rabbit_inbound::config::{DEFAULT_CONFIG_FILE, InboundEndpoint, load_config_from};
use rabbit_inbound::connector::AmqpConnector;
use rabbit_inbound::consumer::{ConsumerEngine, InjectHandler, JsonLinesHandler};
use rabbit_inbound::utils::error::{InboundError, Result};
use rabbit_inbound::utils::logging;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "rabbit-inbound", about = "Transactional RabbitMQ inbound consumer")]
struct Cli {
    /// Configuration file, with or without extension
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Overrides the configured log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume the configured endpoints, writing deliveries to stdout as JSON lines
    Run {
        /// Only run the endpoint with this name
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// Validate the configuration and list the endpoints
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let settings = match load_config_from(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            logging::init(cli.log_level.as_deref().unwrap_or("info"));
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(cli.log_level.as_deref().unwrap_or(&settings.logging.level));

    let endpoints = match settings.inbound_endpoints() {
        Ok(endpoints) => endpoints,
        Err(e) => {
            error!("Invalid inbound endpoint configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = match cli.command {
        Command::Check => {
            check(&endpoints);
            Ok(())
        }
        Command::Run { endpoint } => run(endpoints, endpoint.as_deref()).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn check(endpoints: &[InboundEndpoint]) {
    if endpoints.is_empty() {
        warn!("No inbound endpoints configured");
    }
    for endpoint in endpoints {
        let addresses: Vec<String> = endpoint
            .connection
            .addresses
            .iter()
            .map(ToString::to_string)
            .collect();
        println!(
            "{}: queue={} routing_key={} exchange={} brokers={} vhost={} tls={}",
            endpoint.name,
            endpoint.topology.queue,
            endpoint.topology.routing_key,
            endpoint
                .topology
                .exchange
                .as_ref()
                .map_or("-", |e| e.name.as_str()),
            addresses.join(","),
            endpoint.connection.virtual_host,
            endpoint.connection.tls.enabled,
        );
    }
}

async fn run(endpoints: Vec<InboundEndpoint>, only: Option<&str>) -> Result<()> {
    let selected: Vec<InboundEndpoint> = endpoints
        .into_iter()
        .filter(|e| only.is_none_or(|name| e.name == name))
        .collect();
    if selected.is_empty() {
        return Err(InboundError::configuration(match only {
            Some(name) => format!("no inbound endpoint named '{name}'"),
            None => "no inbound endpoints configured".to_string(),
        }));
    }

    let handler: Arc<dyn InjectHandler> = Arc::new(JsonLinesHandler::new(std::io::stdout()));
    let engines = selected
        .iter()
        .map(|endpoint| ConsumerEngine::from_endpoint(endpoint, handler.clone()).map(Arc::new))
        .collect::<Result<Vec<Arc<ConsumerEngine<AmqpConnector>>>>>()?;

    let tasks: Vec<_> = engines
        .iter()
        .map(|engine| {
            let engine = Arc::clone(engine);
            tokio::spawn(async move { engine.run().await })
        })
        .collect();
    info!("Started {} inbound consumer(s)", tasks.len());

    let shutdown = engines.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received. Stopping consumers.");
            for engine in &shutdown {
                engine.request_shutdown();
            }
        }
    });

    let mut failed = 0;
    for (engine, joined) in engines.iter().zip(join_all(tasks).await) {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(inbound = %engine.name(), state = %engine.state(), "Consumer failed: {}", e);
                failed += 1;
            }
            Err(e) => {
                error!(inbound = %engine.name(), "Consumer task panicked: {}", e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(InboundError::connection(format!(
            "{failed} inbound consumer(s) terminated with an error"
        )));
    }
    Ok(())
}
