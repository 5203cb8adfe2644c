//! HTTP front end for the run engine: submit goals, steer the live run and
//! poll its status, trace and sources.

mod routes;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread;

use agentrun::agents::command::collaborators_from_config;
use agentrun::coordinator::{Coordinator, RunnerHandle};
use agentrun::io::config::load_config;
use axum::Router;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "agentrun-api")]
#[command(about = "HTTP API for submitting and steering agent runs")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Engine config file
    #[arg(long, default_value = "agentrun.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("agentrun_api=info".parse()?)
                .add_directive("agentrun=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let config = load_config(&args.config)?;
    info!(config = %args.config.display(), runs_dir = %config.runs_dir.display(), "starting agentrun-api");
    let collaborators = collaborators_from_config(&config.commands)?;
    let coordinator = Coordinator::new(config, collaborators)?;
    let handle = coordinator.handle();

    // The run loop blocks on collaborator calls, so it gets its own thread.
    let run_loop = thread::Builder::new()
        .name("run-loop".to_string())
        .spawn(move || coordinator.run_forever())?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_router())
        .layer(cors)
        .with_state(AppState::new(handle.clone()));

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(handle))
        .await?;

    if run_loop.join().is_err() {
        warn!("run loop thread panicked");
    }
    Ok(())
}

async fn shutdown_signal(handle: RunnerHandle) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(err = %err, "failed to listen for ctrl-c");
    }
    info!("shutting down");
    handle.shutdown();
}
