use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::prelude::*;

use chat_realtime::config::{ChatConfig, LinkConfig, TokenSourceConfig};
use chat_realtime::link::websocket::WsLink;
use chat_realtime::token_source::{HttpTokenSource, TokenPoller};
use chat_realtime::{ConversationId, CoordinatorConfig, RealtimeCoordinator};

#[derive(Parser)]
#[command(name = "chat-realtime")]
#[command(about = "Realtime session and unread-count coordinator for the chat client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom config directory (defaults to <config dir>/chat-realtime)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, follow the logged-in identity and report unread counts
    Run(RunArgs),

    /// Print the conversation id shared by two identities
    ConversationId {
        a: String,
        b: String,
    },

    /// Print the resolved configuration as TOML
    Config,
}

#[derive(Parser)]
struct RunArgs {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Seconds between unread summaries in the log
    #[arg(long, default_value = "60")]
    report_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::ConversationId { a, b } => {
            println!("{}", ConversationId::between(&a, &b));
            Ok(())
        }
        Commands::Config => {
            let config = ChatConfig::new(cli.config_dir)?;
            let fc = config.load()?;
            print!("{}", toml::to_string_pretty(&fc).context("Failed to render config")?);
            Ok(())
        }
        Commands::Run(args) => run(args, cli.config_dir).await,
    }
}

async fn run(args: RunArgs, config_dir: Option<PathBuf>) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "chat_realtime=debug,info"
    } else {
        "chat_realtime=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config = ChatConfig::new(config_dir)?;
    let fc = config.load()?;
    let link_config = LinkConfig::from_file(&fc.realtime);
    let token_config = TokenSourceConfig::from_file(&fc.api, link_config.request_timeout);

    info!(url = %link_config.ws_url, "Starting chat realtime coordinator");

    let link = Arc::new(WsLink::new(
        link_config.ws_url.clone(),
        link_config.api_key.clone(),
        link_config.request_timeout,
        link_config.event_buffer,
    ));
    let coordinator =
        RealtimeCoordinator::init(link, CoordinatorConfig::from_file(&fc.calls));

    let _toasts = coordinator.on_new_message(|toast| {
        info!(conversation = %toast.conversation_id, "{}", toast.text);
        Ok(())
    });

    let source = HttpTokenSource::new(
        &token_config.base_url,
        &token_config.cookie_name,
        token_config.session_cookie.as_deref(),
        token_config.request_timeout,
    )?;
    let cancel = CancellationToken::new();
    let poller = TokenPoller::new(
        Arc::new(source),
        coordinator.clone(),
        token_config.poll_interval,
    )
    .spawn(cancel.child_token());

    let mut report = tokio::time::interval(Duration::from_secs(args.report_secs.max(1)));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to install Ctrl+C handler")?;
                info!("Received shutdown signal, cleaning up...");
                break;
            }
            _ = report.tick() => {
                let unread = coordinator.unread();
                info!(
                    total = unread.total(),
                    conversations = unread.entries().len(),
                    identity = %coordinator
                        .current_session()
                        .map(|s| s.identity.id)
                        .unwrap_or_default(),
                    "unread summary"
                );
            }
        }
    }

    cancel.cancel();
    let _ = poller.await;
    coordinator.shutdown().await;
    Ok(())
}
