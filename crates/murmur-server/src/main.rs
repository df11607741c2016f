use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use murmur_ai::{AnthropicClient, AnthropicConfig};
use murmur_server::{run_webhook_server, AppState, Pipeline, PipelineConfig, TaskSupervisor};
use murmur_slack::{Responder, ResponderConfig, SlackApiClient};
use murmur_store::SqliteMessageStore;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "murmur-server", about = "Slack webhook bot server", version)]
struct Cli {
    #[arg(
        long,
        env = "MURMUR_BIND",
        default_value = "0.0.0.0:8080",
        help = "Address the webhook listener binds to"
    )]
    bind: String,

    #[arg(
        long = "signing-secret",
        env = "MURMUR_SLACK_SIGNING_SECRET",
        help = "Slack app signing secret used to verify webhook signatures"
    )]
    signing_secret: String,

    #[arg(
        long = "bot-token",
        env = "MURMUR_SLACK_BOT_TOKEN",
        help = "Slack bot token used for Web API calls and file downloads"
    )]
    bot_token: String,

    #[arg(
        long = "bot-user-id",
        env = "MURMUR_SLACK_BOT_USER_ID",
        help = "The bot's own Slack user id; its messages are never answered"
    )]
    bot_user_id: String,

    #[arg(
        long = "slack-api-base",
        env = "MURMUR_SLACK_API_BASE",
        default_value = "https://slack.com/api",
        help = "Base URL for the Slack Web API"
    )]
    slack_api_base: String,

    #[arg(
        long = "anthropic-api-key",
        env = "MURMUR_ANTHROPIC_API_KEY",
        help = "API key for the completion provider"
    )]
    anthropic_api_key: String,

    #[arg(
        long = "anthropic-api-base",
        env = "MURMUR_ANTHROPIC_API_BASE",
        default_value = "https://api.anthropic.com/v1",
        help = "Base URL for the completion provider"
    )]
    anthropic_api_base: String,

    #[arg(
        long,
        env = "MURMUR_MODEL",
        default_value = "claude-3-5-sonnet-latest",
        help = "Completion model identifier"
    )]
    model: String,

    #[arg(
        long = "db-path",
        env = "MURMUR_DB_PATH",
        default_value = ".murmur/chat_history.db",
        help = "SQLite database path for the thread message store"
    )]
    db_path: PathBuf,

    #[arg(
        long = "request-timeout-ms",
        env = "MURMUR_REQUEST_TIMEOUT_MS",
        default_value_t = 30_000,
        help = "Outbound HTTP request timeout in milliseconds"
    )]
    request_timeout_ms: u64,

    #[arg(
        long = "max-retries",
        env = "MURMUR_MAX_RETRIES",
        default_value_t = 2,
        help = "Retry budget for retriable completion provider failures"
    )]
    max_retries: usize,
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let store = SqliteMessageStore::new(&cli.db_path).context("failed to open message store")?;

    let completion = AnthropicClient::new(AnthropicConfig {
        api_base: cli.anthropic_api_base,
        api_key: cli.anthropic_api_key,
        model: cli.model,
        max_tokens: 1024,
        request_timeout_ms: cli.request_timeout_ms,
        max_retries: cli.max_retries,
    })
    .context("failed to build completion client")?;

    let slack_client = SlackApiClient::new(
        cli.slack_api_base,
        cli.bot_token,
        cli.request_timeout_ms,
    )
    .context("failed to build Slack API client")?;
    let responder = Responder::new(slack_client, ResponderConfig::default());

    let pipeline = Arc::new(Pipeline::new(
        Arc::new(store),
        Arc::new(completion),
        responder,
        PipelineConfig {
            bot_user_id: cli.bot_user_id,
        },
    ));
    let state = Arc::new(AppState {
        signing_secret: cli.signing_secret,
        pipeline,
        supervisor: Arc::new(TaskSupervisor::new()),
    });

    run_webhook_server(&cli.bind, state).await
}
