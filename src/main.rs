//! acp-stdio
//!
//! `agent` serves the echo agent on stdin/stdout. `client` spawns an agent,
//! runs one prompt turn against it and prints what comes back.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use acp_stdio::config::{AgentCommand, Config, SupervisorConfig};
use acp_stdio::echo::EchoAgent;
use acp_stdio::schema::{
    text_block, ContentBlock, Implementation, InitializeRequest, NewSessionRequest, PromptRequest,
    RequestPermissionOutcome, RequestPermissionRequest, RequestPermissionResponse,
    SessionNotification, PROTOCOL_VERSION,
};
use acp_stdio::transport::RpcError;
use acp_stdio::{run_agent, with_agent_process, Client};

#[derive(Parser, Debug)]
#[command(name = "acp-stdio")]
#[command(about = "Agent Client Protocol over subprocess stdio")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the echo agent on stdin/stdout
    Agent,

    /// Spawn an agent and send it one prompt
    Client {
        /// JSON config file naming the agent command
        #[arg(long)]
        config: Option<PathBuf>,

        /// Prompt text
        #[arg(long, default_value = "Hello, agent!")]
        prompt: String,

        /// Working directory for the new session
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Agent command and arguments; overrides the config's command
        #[arg(last = true)]
        agent: Vec<String>,
    },
}

/// Prints updates to stdout and declines every permission request.
struct PrintingClient;

#[async_trait]
impl Client for PrintingClient {
    async fn request_permission(
        &self,
        args: RequestPermissionRequest,
    ) -> Result<RequestPermissionResponse, RpcError> {
        warn!(
            session_id = %args.session_id,
            tool_call = %args.tool_call.tool_call_id,
            "Declining permission request"
        );
        Ok(RequestPermissionResponse::new(
            RequestPermissionOutcome::Cancelled,
        ))
    }

    async fn session_update(&self, args: SessionNotification) -> Result<(), RpcError> {
        match args.update.content().and_then(ContentBlock::text) {
            Some(text) => println!("{text}"),
            None => {
                let update = serde_json::to_string(&args.update).map_err(RpcError::internal_error)?;
                println!("{update}");
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for protocol frames)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Agent => {
            run_agent(EchoAgent::new).await;
            Ok(())
        }
        Command::Client {
            config,
            prompt,
            cwd,
            agent,
        } => run_client(config, &prompt, cwd, agent).await,
    }
}

async fn run_client(
    config: Option<PathBuf>,
    prompt: &str,
    cwd: Option<PathBuf>,
    agent: Vec<String>,
) -> Result<()> {
    let config = match config {
        Some(path) => Some(Config::from_file(&path)?),
        None => None,
    };

    let command = match agent.split_first() {
        Some((program, rest)) => AgentCommand::new(program.as_str()).args(rest.iter().cloned()),
        None => config
            .as_ref()
            .map(|c| c.agent.clone())
            .context("No agent command: pass --config or `-- <command> [args...]`")?,
    };
    let supervisor = config
        .as_ref()
        .map_or_else(SupervisorConfig::from_env, Config::supervisor);

    let cwd = match cwd {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };

    // The agent is shut down whether or not the turn succeeds.
    with_agent_process(
        |_| PrintingClient,
        &command,
        &supervisor,
        |agent| async move {
            let init = agent
                .initialize(InitializeRequest {
                    client_info: Some(Implementation {
                        name: env!("CARGO_PKG_NAME").into(),
                        title: None,
                        version: env!("CARGO_PKG_VERSION").into(),
                    }),
                    ..InitializeRequest::new(PROTOCOL_VERSION)
                })
                .await
                .context("initialize failed")?;
            info!(
                protocol_version = init.protocol_version,
                agent = ?init.agent_info.map(|i| i.name),
                "Agent initialized"
            );

            let session = agent
                .new_session(NewSessionRequest::new(cwd))
                .await
                .context("session/new failed")?;
            info!(session_id = %session.session_id, "Session created");

            let response = agent
                .prompt(PromptRequest::new(session.session_id, vec![text_block(prompt)]))
                .await
                .context("session/prompt failed")?;
            info!(stop_reason = ?response.stop_reason, "Turn finished");
            anyhow::Ok(())
        },
    )
    .await
    .context("Agent process failed")?
}
