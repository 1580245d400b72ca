use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use sandbox_orchestrator::sandbox::{LlmProviderConfig, SandboxInfo};
use sandbox_orchestrator::{Config, ProtocolEvent, SandboxManager, build_manager};

#[derive(Parser)]
#[command(name = "sandbox-orchestrator", about = "Run coding agents in isolated sandboxes")]
enum Cli {
    /// Provision a sandbox, talk to its agent, then tear it down
    Run {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        user: String,
        /// LLM provider, e.g. anthropic
        #[arg(long)]
        provider: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        api_base: Option<String>,
        /// Message to send; repeat for a multi-turn session
        #[arg(long = "message", short = 'm')]
        messages: Vec<String>,
        /// Snapshot the workspace before teardown
        #[arg(long)]
        snapshot: bool,
        /// Restore this snapshot into the fresh workspace first
        #[arg(long)]
        restore: Option<String>,
        /// Keep the sandbox until Ctrl-C
        #[arg(long)]
        keep_alive: bool,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sandbox_orchestrator=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_tree::HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(false),
        )
        .init();

    let config = Config::from_env().context("failed to load configuration")?;

    match cli {
        Cli::Config => {
            config.validate().context("invalid configuration")?;
            println!("{config:#?}");
            Ok(())
        }
        Cli::Run {
            tenant,
            user,
            provider,
            model,
            api_key,
            api_base,
            messages,
            snapshot,
            restore,
            keep_alive,
        } => {
            let manager = build_manager(&config)
                .await
                .context("failed to initialize sandbox manager")?;
            let mut llm = LlmProviderConfig::new(provider, model);
            llm.api_key = api_key;
            llm.api_base = api_base;

            let info = manager
                .provision(&tenant, &user, &llm)
                .await
                .context("failed to provision sandbox")?;
            eprintln!("sandbox {} ready at {}", info.sandbox_id, info.location);

            let session = RunOptions {
                messages,
                snapshot,
                restore,
                keep_alive,
                heartbeat_every: config.idle_timeout / 4,
            };
            let outcome = run_session(&manager, &info, session).await;

            manager
                .teardown(&info.sandbox_id)
                .await
                .context("failed to tear down sandbox")?;
            outcome
        }
    }
}

struct RunOptions {
    messages: Vec<String>,
    snapshot: bool,
    restore: Option<String>,
    keep_alive: bool,
    heartbeat_every: Duration,
}

async fn run_session(manager: &SandboxManager, info: &SandboxInfo, opts: RunOptions) -> Result<()> {
    let id = &info.sandbox_id;

    if let Some(path) = &opts.restore {
        // The workspace was just created; anything in it came from the agent.
        manager
            .restore_snapshot(id, path, true)
            .await
            .with_context(|| format!("failed to restore {path}"))?;
        eprintln!("restored {path}");
    }

    for text in &opts.messages {
        let mut events = manager
            .send_message(id, text)
            .await
            .context("failed to send message")?;
        while let Some(event) = events.next_event().await {
            let event = event.context("agent session failed")?;
            print_event(&event)?;
        }
        manager.mark_idle(id).await?;
    }

    if opts.snapshot {
        let record = manager
            .create_snapshot(id)
            .await
            .context("failed to snapshot workspace")?;
        eprintln!("snapshot {} ({} bytes)", record.storage_path, record.size_bytes);
    }

    if opts.keep_alive {
        eprintln!("sandbox {id} kept alive; press Ctrl-C to tear down");
        let mut ticker = tokio::time::interval(opts.heartbeat_every.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = ticker.tick() => {
                    if !manager.is_alive(id).await? {
                        anyhow::bail!("sandbox {id} stopped unexpectedly");
                    }
                    manager.heartbeat(id).await?;
                }
            }
        }
    }

    Ok(())
}

fn print_event(event: &ProtocolEvent) -> Result<()> {
    let mut out = std::io::stdout().lock();
    match event {
        ProtocolEvent::AgentMessageChunk { text } => write!(out, "{text}")?,
        ProtocolEvent::AgentThoughtChunk { .. } => {}
        ProtocolEvent::ToolCallStart { title, .. } => writeln!(out, "\n[tool] {title}")?,
        ProtocolEvent::ToolCallProgress { tool_call_id, status, .. } => {
            if let Some(status) = status {
                writeln!(out, "[tool {tool_call_id}] {status}")?;
            }
        }
        ProtocolEvent::PlanUpdate { entries } => {
            for entry in entries {
                writeln!(
                    out,
                    "[plan] {} ({})",
                    entry.content,
                    entry.status.as_deref().unwrap_or("pending")
                )?;
            }
        }
        ProtocolEvent::ModeUpdate { mode_id } => writeln!(out, "[mode] {mode_id}")?,
        ProtocolEvent::PromptResponse { stop_reason } => writeln!(out, "\n[done] {stop_reason}")?,
        ProtocolEvent::Error { message, code: Some(code) } => {
            writeln!(out, "\n[error {code}] {message}")?
        }
        ProtocolEvent::Error { message, code: None } => writeln!(out, "\n[error] {message}")?,
    }
    out.flush()?;
    Ok(())
}
