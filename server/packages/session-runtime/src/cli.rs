use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use session_runtime_error::RuntimeError;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::agent::{AgentCatalog, CatalogAgentFactory, EchoAgent};
use crate::config::{ConfigError, RuntimeConfig, StoreBackend};
use crate::conversation::open_store;
use crate::coordinator::Coordinator;
use crate::router::{build_router, AppState};
use crate::stream::{SseEvent, SubscriberHandle};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2480;

#[derive(Parser, Debug)]
#[command(
    name = "session-runtime",
    bin_name = "session-runtime",
    about = "Warm agent sessions with layered memory, rate limiting and event streaming",
    version
)]
#[command(arg_required_else_help = true)]
pub struct SessionRuntimeCli {
    #[command(subcommand)]
    command: Command,

    /// JSON config file. Environment variables and flags override it.
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the session runtime HTTP server.
    Server(ServerArgs),
    /// Print the effective configuration as JSON.
    PrintConfig,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Disable both the global and the per-user rate limit.
    #[arg(long)]
    no_rate_limit: bool,

    /// Persist conversations as files under this directory.
    #[arg(long)]
    store_dir: Option<PathBuf>,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,
}

impl ServerArgs {
    fn apply(&self, config: &mut RuntimeConfig) {
        if self.no_rate_limit {
            config.rate_limit.enabled = false;
        }
        if let Some(dir) = &self.store_dir {
            config.store.backend = StoreBackend::File;
            config.store.directory = Some(dir.clone());
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_session_runtime() -> Result<(), CliError> {
    let cli = SessionRuntimeCli::parse();
    init_logging();
    let mut config = RuntimeConfig::load(cli.config.as_deref())?;

    match &cli.command {
        Command::Server(args) => {
            args.apply(&mut config);
            run_server(config, args)
        }
        Command::PrintConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_server(config: RuntimeConfig, server: &ServerArgs) -> Result<(), CliError> {
    let cors = build_cors_layer(server)?;
    let addr = format!("{}:{}", server.host, server.port);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let store = open_store(&config.store).await?;
        let catalog = Arc::new(AgentCatalog::new());
        let factory = Arc::new(CatalogAgentFactory::new(
            catalog.clone(),
            Arc::new(EchoAgent::new()),
        ));
        let coordinator = Arc::new(Coordinator::new(&config, store, factory));
        coordinator
            .hub()
            .set_on_connect(Arc::new(|handle: &SubscriberHandle| {
                let _ = handle.try_emit(&SseEvent::typed("connected", handle.client_id()));
            }));

        let router = build_router(AppState::new(coordinator.clone(), catalog)).layer(cors);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(
            addr = %addr,
            rate_limit = config.rate_limit.enabled,
            store = ?config.store.backend,
            "server listening"
        );

        let shutdown = coordinator.clone();
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
                // Ends open event streams so graceful shutdown can finish.
                shutdown.close();
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()));
        coordinator.close();
        served
    })
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if server.cors_allow_origin.is_empty() {
        return Ok(cors);
    }
    let mut origins = Vec::with_capacity(server.cors_allow_origin.len());
    for origin in &server.cors_allow_origin {
        let value: axum::http::HeaderValue = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    cors = cors.allow_origin(origins);
    Ok(cors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_flags_override_config() {
        let cli = SessionRuntimeCli::try_parse_from([
            "session-runtime",
            "server",
            "--no-rate-limit",
            "--store-dir",
            "/tmp/conversations",
            "-p",
            "9000",
        ])
        .expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert_eq!(args.port, 9000);
        assert_eq!(args.host, DEFAULT_HOST);

        let mut config = RuntimeConfig::default();
        args.apply(&mut config);
        assert!(!config.rate_limit.enabled);
        assert_eq!(config.store.backend, StoreBackend::File);
        assert_eq!(
            config.store.directory.as_deref(),
            Some(std::path::Path::new("/tmp/conversations"))
        );
    }

    #[test]
    fn invalid_cors_origin_is_rejected() {
        let cli = SessionRuntimeCli::try_parse_from([
            "session-runtime",
            "server",
            "--cors-allow-origin",
            "bad\norigin",
        ])
        .expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert!(matches!(
            build_cors_layer(&args),
            Err(CliError::InvalidCorsOrigin(_))
        ));
    }

    #[test]
    fn config_flag_is_global() {
        let cli = SessionRuntimeCli::try_parse_from([
            "session-runtime",
            "print-config",
            "--config",
            "runtime.json",
        ])
        .expect("parse");
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("runtime.json")));
        assert!(matches!(cli.command, Command::PrintConfig));
    }
}
