use anthropic_bridge::config::config_search_paths;
use anthropic_bridge::providers::Provider;
use anthropic_bridge::{build_router, AppState, ProxyConfig, SharedLogger};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "anthropic-bridge",
    about = "Serve the Anthropic Messages API on top of OpenAI and Gemini backends",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind (overrides config and HOST)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config and PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Provider used for claude-* aliases: openai, gemini or anthropic
    #[arg(long)]
    preferred_provider: Option<String>,

    /// Append structured request logs to this JSONL file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "anthropic_bridge=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = ProxyConfig::find_and_load(cli.config.as_deref())?;
    config.apply_env(std::env::vars())?;

    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(ref name) = cli.preferred_provider {
        config.routing.preferred_provider = Provider::from_name(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown provider '{name}'"))?;
    }
    config.normalize();

    let logger = match cli.log_file {
        Some(ref path) => SharedLogger::new(path)?,
        None => SharedLogger::in_memory(),
    };

    info!("anthropic-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("  Preferred: {}", config.routing.preferred_provider);
    info!("  Big:       {}", config.routing.big_model);
    info!("  Small:     {}", config.routing.small_model);
    for provider in Provider::ALL {
        info!(
            "  {:<10} {} (key {})",
            format!("{}:", provider),
            config.provider_base_url(provider),
            if config.provider_api_key(provider).is_some() { "set" } else { "missing" }
        );
    }
    let mut channels: Vec<_> = config.channels.iter().collect();
    channels.sort_by(|a, b| a.0.cmp(b.0));
    for (name, channel) in channels {
        info!("  Channel {} -> {}", name, channel.base_url);
    }
    if let Some(ref path) = cli.log_file {
        info!("  Log file:  {}", path.display());
    }

    logger.info(
        "startup",
        format!(
            "Starting anthropic-bridge preferred={} big={} small={} channels={}",
            config.routing.preferred_provider,
            config.routing.big_model,
            config.routing.small_model,
            config.channels.len()
        ),
    );

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.params.request_timeout_secs))
        .build()?;

    let state = Arc::new(AppState {
        config: config.clone(),
        client,
        logger: logger.clone(),
    });

    let app = build_router(state);
    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("  ANTHROPIC_BASE_URL=http://localhost:{} claude", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
