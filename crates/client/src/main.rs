//! Command line chat against a running `chat-relay-server`.

#[macro_use]
extern crate tracing;

use std::io::Write as _;
use std::pin::pin;
use std::time::Duration;

use chat_relay_client::{
    ChatSessionBuilder, HttpTransport, Message, MessageId, Role, TurnOutcome,
};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use tokio::io::{self, AsyncBufReadExt};
use tokio::select;
use tokio::signal::ctrl_c;
use tokio::sync::mpsc;
use tokio::time::sleep;

const BAR_CHAR: &str = "▎";

/// Chats with a chat-relay endpoint. Ctrl-C stops the current reply.
#[derive(Debug, Parser)]
#[command(name = "chat-relay", version)]
struct Args {
    /// URL of the chat endpoint.
    #[arg(
        long,
        env = "CHAT_RELAY_URL",
        default_value = "http://127.0.0.1:3000/api/chat"
    )]
    url: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    debug!("posting to {}", args.url);

    let (update_tx, mut update_rx) = mpsc::unbounded_channel();
    let session =
        ChatSessionBuilder::with_transport(HttpTransport::new(args.url))
            .on_update(move |msg: &Message| {
                update_tx.send(msg.clone()).ok();
            })
            .build();

    let progress_style = ProgressStyle::with_template("{spinner} {wide_msg}")?
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = select! {
            line = read_line() => line,
            _ = ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut reply = pin!(session.submit(line));
        let mut progress_bar = Some(thinking_spinner(&progress_style));
        let mut printed: Option<(MessageId, usize)> = None;

        let outcome = loop {
            select! {
                biased;

                Some(msg) = update_rx.recv() => {
                    if msg.role() != Role::Assistant {
                        continue;
                    }
                    if let Some(progress_bar) = progress_bar.take() {
                        progress_bar.finish_and_clear();
                        print!("{}🤖 ", BAR_CHAR.bright_cyan());
                    }
                    let offset = match printed {
                        Some((id, len)) if id == msg.id() => len,
                        _ => 0,
                    };
                    print!("{}", (&msg.content()[offset..]).bright_white());
                    std::io::stdout().flush()?;
                    printed = Some((msg.id(), msg.content().len()));
                }
                outcome = &mut reply => {
                    break outcome;
                }
                _ = ctrl_c() => {
                    session.cancel();
                }
                _ = sleep(Duration::from_millis(100)) => {
                    if let Some(progress_bar) = &progress_bar {
                        progress_bar.inc(1);
                    }
                }
            }
        };
        if let Some(progress_bar) = progress_bar.take() {
            progress_bar.finish_and_clear();
        }

        match outcome {
            Ok(TurnOutcome::Completed(_)) => println!(),
            Ok(TurnOutcome::Cancelled { .. }) => {
                println!("\n{}", "(cancelled)".dimmed());
            }
            Ok(TurnOutcome::Failed { error, .. }) => {
                println!(
                    "\n{}⚠️  {}",
                    BAR_CHAR.bright_yellow(),
                    error.bright_red()
                );
            }
            Err(err) => {
                println!("{}⚠️  {}", BAR_CHAR.bright_yellow(), err.bright_red());
            }
        }
        println!();
    }

    Ok(())
}

fn thinking_spinner(style: &ProgressStyle) -> ProgressBar {
    let progress_bar = ProgressBar::new_spinner();
    progress_bar.set_style(style.clone());
    progress_bar.set_message("🤔 Thinking...");
    progress_bar
}

async fn read_line() -> Option<String> {
    let mut stdin = io::BufReader::new(io::stdin());
    let mut line = String::new();

    match stdin.read_line(&mut line).await {
        Ok(0) => None,
        Ok(_) => Some(line),
        Err(err) => {
            error!("error reading input: {err}");
            None
        }
    }
}
