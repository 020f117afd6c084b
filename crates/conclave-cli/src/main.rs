use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod config;
mod launch_server;
mod router_client;

use config::{load_config, Config};
use conclave_core::{ConnectionManager, ContactBook, CoordinationEngine, EngineConfig, ModelRoute, RouterClient};
use conclave_executor::{Executor, NativeExecutor};
use conclave_gateway::Gateway;
use conclave_provider::{register_builtin_providers, register_from_configs, ProviderRegistry};
use conclave_schema::{sanitize_name, AgentInfo};
use conclave_store::Store;
use conclave_vector::{EmbeddingProvider, OpenAiEmbeddingProvider, StubEmbeddingProvider};
use router_client::HttpRouterClient;

#[derive(Parser)]
#[command(name = "conclave", version, about = "Multi-agent coordination runtime")]
struct Cli {
    #[arg(long, default_value = "~/.conclave", help = "Data root directory (logs, per-agent stores)")]
    data_root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the Registry/Router service")]
    Router {
        #[arg(long, default_value = "0.0.0.0", help = "Router bind hostname")]
        hostname: String,
        #[arg(long, default_value = "8080", help = "Router bind port")]
        port: u16,
    },
    #[command(about = "Run one agent's Coordination Engine, registering with a Router")]
    Agent {
        #[arg(long, help = "Path to this agent's config.yaml")]
        config: PathBuf,
        #[arg(long, default_value = "3000", help = "Local port this agent's launch_goal server binds")]
        port: u16,
    },
    #[command(about = "Validate a config file without starting anything")]
    Validate {
        #[arg(long, help = "Path to config.yaml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    if cli.data_root.starts_with("~") {
        if let Some(home) = std::env::var_os("HOME") {
            cli.data_root = PathBuf::from(home).join(cli.data_root.strip_prefix("~").unwrap_or(&cli.data_root));
        }
    }

    let log_dir = cli.data_root.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "conclave.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(non_blocking))
        .init();

    match cli.command {
        Commands::Router { hostname, port } => run_router(&cli.data_root, &hostname, port).await,
        Commands::Agent { config, port } => run_agent(&cli.data_root, &config, port).await,
        Commands::Validate { config } => {
            let config = load_config(&config)?;
            println!(
                "Config valid. agent={} max_team_up_attempts={} discussion_only={}",
                config.comm.name, config.comm.max_team_up_attempts, config.comm.discussion_only
            );
            Ok(())
        }
    }
}

async fn run_router(data_root: &std::path::Path, hostname: &str, port: u16) -> Result<()> {
    let data_dir = data_root.join("server");
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(StubEmbeddingProvider::default());
    let state = conclave_server::state::AppState::bootstrap(&data_dir, embedder).context("failed to bootstrap router state")?;
    conclave_server::serve(state, &format!("{hostname}:{port}")).await
}

async fn run_agent(data_root: &std::path::Path, config_path: &std::path::Path, port: u16) -> Result<()> {
    let config = load_config(config_path)?;
    let agent_dir = data_root.join(format!("agent_{}", sanitize_name(&config.comm.name)));
    std::fs::create_dir_all(&agent_dir)?;

    let comm_store = Arc::new(
        Store::open(agent_dir.join("comm.db").to_str().context("non-utf8 data path")?)
            .context("failed to open agent comm.db (comm_bank / task_manager_bank)")?,
    );

    let embedder = build_embedder(&config);
    let contact_book = ContactBook::open(
        agent_dir.join("contacts.db").to_str().context("non-utf8 data path")?,
        &format!("agent_{}", sanitize_name(&config.comm.name)),
        embedder,
    )
    .context("failed to open contact book")?;

    let mut registry = ProviderRegistry::new();
    register_builtin_providers(&mut registry);
    register_from_configs(&mut registry, &config.comm.llm.providers).context("failed to register LLM providers")?;
    let gateway = Arc::new(Gateway::new(
        registry,
        config.comm.llm.aliases.clone(),
        config.comm.llm.global_fallbacks.clone(),
    ));
    let model = ModelRoute {
        primary: config.comm.llm.primary_model.clone(),
        fallbacks: config.comm.llm.fallback_models.clone(),
    };

    let router: Arc<dyn RouterClient> = Arc::new(HttpRouterClient::new(config.router_url.clone()));
    let ws_url = format!(
        "ws://{}/ws/{}",
        config.router_url.trim_start_matches("http://").trim_start_matches("https://"),
        config.comm.name
    );
    let conn = Arc::new(ConnectionManager::new(ws_url));

    let executor: Option<Arc<dyn Executor>> = config.tool_agent.as_ref().map(|tool_agent| {
        let command = tool_agent.command.clone();
        Arc::new(NativeExecutor::new(move |task_content: &str| run_tool_agent_command(&command, task_content))) as Arc<dyn Executor>
    });

    // Only `dummy` ships in this workspace; a real deployment's observation
    // source is an external pluggable callable, not something this crate
    // can name generically.
    let observation: Arc<dyn conclave_core::ObservationAdapter> = Arc::new(conclave_core::observation::DummyObservationAdapter);
    if config.comm.observation_func != "dummy" {
        tracing::warn!(configured = %config.comm.observation_func, "no non-dummy observation adapter is built in, falling back to dummy");
    }

    let engine_config = EngineConfig {
        max_team_up_attempts: config.comm.max_team_up_attempts,
        support_nested_teams: config.comm.support_nested_teams,
        discussion_only: config.comm.discussion_only,
        ..EngineConfig::default()
    };

    let engine = Arc::new(
        CoordinationEngine::new(
            config.comm.name.clone(),
            router.clone(),
            conn.clone(),
            gateway,
            model,
            contact_book,
            executor,
            observation,
            engine_config,
        )
        .with_store(comm_store),
    );

    register_self(&config).await?;

    let receive_loop = {
        let engine = engine.clone();
        let conn = conn.clone();
        tokio::spawn(async move {
            loop {
                match conn.recv().await {
                    Ok(message) => {
                        if let Err(err) = engine.handle_discussion_message(message).await {
                            tracing::warn!(%err, "failed to handle incoming discussion message");
                        }
                    }
                    Err(err) => {
                        tracing::error!(%err, "router connection exhausted, receive loop exiting");
                        break;
                    }
                }
            }
        })
    };

    let app = launch_server::router(engine);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(agent = %config.comm.name, port, "launch_goal server listening");
    tokio::select! {
        result = axum::serve(listener, app) => result.map_err(Into::into),
        _ = receive_loop => Ok(()),
    }
}

async fn register_self(config: &Config) -> Result<()> {
    let info = AgentInfo {
        name: config.comm.name.clone(),
        agent_type: config.comm.r#type.into(),
        desc: config.comm.desc.clone(),
        created_at: chrono::Utc::now(),
    };
    let client = reqwest::Client::new();
    client
        .post(format!("{}/api/register", config.router_url))
        .json(&info)
        .send()
        .await
        .context("failed to reach router for registration")?
        .error_for_status()
        .context("router rejected registration")?;
    Ok(())
}

fn build_embedder(config: &Config) -> Arc<dyn EmbeddingProvider> {
    match config.comm.llm.embedding.provider.as_str() {
        "openai" => {
            let api_key = config.comm.llm.embedding.api_key.clone().unwrap_or_default();
            let mut provider = OpenAiEmbeddingProvider::new(api_key);
            if let Some(base_url) = &config.comm.llm.embedding.base_url {
                provider = provider.with_base_url(base_url.clone());
            }
            if let Some(model) = &config.comm.llm.embedding.model {
                provider = provider.with_model(model.clone());
            }
            Arc::new(provider)
        }
        _ => Arc::new(StubEmbeddingProvider::default()),
    }
}

fn run_tool_agent_command(command: &str, task_content: &str) -> Result<String> {
    use std::io::Write;
    use std::process::{Command, Stdio};

    let mut parts = command.split_whitespace();
    let program = parts.next().context("tool_agent.command is empty")?;
    let args: Vec<&str> = parts.collect();

    let mut child = Command::new(program)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("failed to spawn tool_agent command: {command}"))?;

    child
        .stdin
        .take()
        .context("tool_agent child has no stdin")?
        .write_all(task_content.as_bytes())?;

    let output = child.wait_with_output().context("tool_agent command failed")?;
    if !output.status.success() {
        anyhow::bail!("tool_agent command exited with {}", output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
