mod router;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use dingcrust_agents::{AgentRuntime, LlmProvider, MemoryStore, OpenAiProvider};
use dingcrust_channels::{ChannelLifecycle, ChannelSender, DingTalkChannel};
use dingcrust_common::MessageBus;
use dingcrust_config::{AppConfig, ConfigLoader};
use dingcrust_security::RedactingWriter;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dingcrust", version, about = "DingTalk agent gateway")]
struct Cli {
    /// Config file to load instead of ~/.dingcrust/config.{yaml,yml,toml}
    #[arg(short, long, global = true, env = "DINGCRUST_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to DingTalk and serve the agent (default)
    Run,
    /// Load and validate the configuration, then exit
    Check,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(RedactingWriter::stderr());
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => ConfigLoader::load_from(path)?,
        None => ConfigLoader::new()?.load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_config(cli.config.as_ref()).context("failed to load configuration")?;
    match cli.command.unwrap_or(Command::Run) {
        Command::Check => check(&config),
        Command::Run => run(config).await,
    }
}

fn check(config: &AppConfig) -> anyhow::Result<()> {
    match &config.channels.dingtalk {
        Some(dingtalk) if dingtalk.enabled => info!(
            "dingtalk: client {} ok, reply_mode={:?}, {} allowed sender(s)",
            dingtalk.client_id,
            dingtalk.reply_mode,
            dingtalk.allow_from.len()
        ),
        _ => warn!("dingtalk channel is not configured"),
    }
    if config.llm.api_key.is_none() {
        warn!("no LLM api key configured (set DINGCRUST_LLM_API_KEY)");
    }
    info!(
        "agent: model {}, memory window {}, workspace {}",
        config.agent.model,
        config.agent.memory_window,
        config.agent.workspace.display()
    );
    Ok(())
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let Some(dingtalk) = config.channels.dingtalk.clone().filter(|d| d.enabled) else {
        bail!("no enabled dingtalk channel in configuration");
    };
    let api_key = config
        .llm
        .api_key
        .clone()
        .context("llm api key is required (set DINGCRUST_LLM_API_KEY)")?;

    let provider: Arc<dyn LlmProvider> =
        Arc::new(OpenAiProvider::new(api_key, config.llm.base_url.clone()));
    if !provider.health_check().await.unwrap_or(false) {
        warn!("llm provider {} failed its health check", provider.provider_id());
    }

    let memory = MemoryStore::open(&config.agent.workspace)
        .await
        .context("failed to open memory store")?;
    let agent = Arc::new(AgentRuntime::new(provider, memory, config.agent.clone()));

    let bus = Arc::new(MessageBus::new());
    let mut channel = DingTalkChannel::new(dingtalk, Arc::clone(&bus));
    channel.connect().await.context("failed to connect dingtalk")?;
    info!("{}: {}", channel.display_name(), channel.status());

    let stop = CancellationToken::new();
    let sender: Arc<dyn ChannelSender> = Arc::from(channel.create_sender());
    let routing = tokio::spawn(router::route_outbound(
        Arc::clone(&bus),
        sender,
        stop.clone(),
    ));
    let agent_loop = {
        let agent = Arc::clone(&agent);
        let bus = Arc::clone(&bus);
        let stop = stop.clone();
        tokio::spawn(async move { agent.run(bus, stop).await })
    };

    info!("dingcrust running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    stop.cancel();
    channel.disconnect().await?;
    for (name, handle) in [("router", routing), ("agent", agent_loop)] {
        if let Err(e) = handle.await {
            error!("{name} task ended abnormally: {e}");
        }
    }
    Ok(())
}
