//! Serves the chat endpoint in front of an OpenAI-compatible backend.

#[macro_use]
extern crate tracing;

use anyhow::Context as _;
use chat_relay_openai_model::OpenAIProvider;
use chat_relay_server::config::ServerArgs;
use chat_relay_server::{AppState, app};
use clap::Parser;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chat_relay_server=debug".into()),
        )
        .init();

    let args = ServerArgs::parse();
    let directive = args
        .load_directive()
        .await
        .context("failed to read the directive")?;
    let provider = OpenAIProvider::new(args.openai_config());
    info!("using backend {:?}", provider.config());

    let listener = TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("failed to bind {}", args.addr))?;
    info!("listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app(AppState::new(provider, directive)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
}
