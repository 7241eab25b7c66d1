//! Command line and environment configuration of the server binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use chat_relay_openai_model::{OpenAIConfig, OpenAIConfigBuilder};
use clap::Parser;

use crate::DEFAULT_DIRECTIVE;

/// Streams chat completions from an OpenAI-compatible backend.
#[derive(Clone, Debug, Parser)]
#[command(name = "chat-relay-server", version)]
pub struct ServerArgs {
    /// Address to listen on.
    #[arg(long, env = "CHAT_RELAY_ADDR", default_value = "127.0.0.1:3000")]
    pub addr: SocketAddr,

    /// API key of the model backend.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Base URL of the model backend.
    #[arg(long, env = "OPENAI_BASE_URL")]
    pub base_url: Option<String>,

    /// Model to sample from.
    #[arg(long, env = "OPENAI_MODEL")]
    pub model: Option<String>,

    /// File holding the directive put in front of every conversation.
    #[arg(long, env = "CHAT_RELAY_DIRECTIVE")]
    pub directive: Option<PathBuf>,
}

impl ServerArgs {
    /// Builds the backend configuration.
    pub fn openai_config(&self) -> OpenAIConfig {
        let mut builder = OpenAIConfigBuilder::with_api_key(&self.api_key);
        if let Some(base_url) = &self.base_url {
            builder = builder.with_base_url(base_url);
        }
        if let Some(model) = &self.model {
            builder = builder.with_model(model);
        }
        builder.build()
    }

    /// Reads the configured directive, or returns the built-in one.
    pub async fn load_directive(&self) -> std::io::Result<String> {
        match &self.directive {
            Some(path) => {
                let directive = tokio::fs::read_to_string(path).await?;
                Ok(directive.trim().to_owned())
            }
            None => Ok(DEFAULT_DIRECTIVE.trim().to_owned()),
        }
    }
}
