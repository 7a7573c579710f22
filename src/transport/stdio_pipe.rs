//! Stdin/stdout pipe transport for agent subprocesses.
//!
//! The host side owns the child process: its stdin carries frames to the
//! agent, its stdout carries frames back, and its stderr is forwarded to
//! the host's log. The agent side serves the current process's own
//! stdin/stdout.

use std::future::Future;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{AgentCommand, SupervisorConfig};
use crate::connection::{AgentPeer, AgentSideConnection, ClientPeer, ClientSideConnection};
use crate::error::{AcpError, Result};
use crate::role::{Agent, Client};

use super::MAX_LINE_BYTES;

/// A running agent subprocess and the connection to it.
///
/// The child is spawned with `kill_on_drop`, so dropping this handle (for
/// example when the owning task is cancelled) kills the agent and shuts
/// the connection down. [`shutdown`](Self::shutdown) is the orderly path.
pub struct AgentProcess {
    connection: ClientSideConnection,
    child: Child,
    stderr_task: Option<JoinHandle<()>>,
    shutdown_grace: Duration,
    command: String,
}

impl AgentProcess {
    pub fn connection(&self) -> &ClientSideConnection {
        &self.connection
    }

    /// Cloneable handle for calling the agent from other tasks.
    pub fn agent(&self) -> AgentPeer {
        (*self.connection).clone()
    }

    /// OS process id, or `None` once the child has been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kill the agent immediately and wait for it to be reaped.
    pub async fn kill(&mut self) -> Result<()> {
        warn!(command = %self.command, pid = ?self.child.id(), "Killing agent process");
        self.child.kill().await?;
        Ok(())
    }

    /// Close the connection, give the agent `shutdown_grace` to exit on its
    /// own, then kill it.
    ///
    /// Pending calls are rejected with [`AcpError::ConnectionClosed`].
    #[instrument(skip(self), fields(command = %self.command, pid = ?self.child.id()))]
    pub async fn shutdown(mut self) -> Result<ExitStatus> {
        // Closing the connection drops the write half, so the agent sees EOF
        // on stdin.
        if tokio::time::timeout(self.shutdown_grace, self.connection.close())
            .await
            .is_err()
        {
            warn!(grace = ?self.shutdown_grace, "Connection did not close within grace period");
        }

        let status = match tokio::time::timeout(self.shutdown_grace, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    grace = ?self.shutdown_grace,
                    "Agent did not exit within grace period, killing"
                );
                self.child.kill().await?;
                self.child.wait().await?
            }
        };

        if let Some(task) = self.stderr_task.take() {
            if let Err(e) = task.await {
                debug!(error = %e, "Stderr forwarder ended abnormally");
            }
        }

        info!(%status, "Agent process exited");
        Ok(status)
    }
}

/// Spawn `command` as an agent and connect to it, serving the client
/// produced by `make_client`.
///
/// Fails with [`AcpError::Spawn`] if the process cannot be started; no
/// child or connection is left behind in that case. Must be called from
/// within a tokio runtime.
#[instrument(skip_all, fields(command = %command.command))]
pub fn spawn_agent_process<C, F>(
    make_client: F,
    command: &AgentCommand,
    config: &SupervisorConfig,
) -> Result<AgentProcess>
where
    C: Client,
    F: FnOnce(AgentPeer) -> C,
{
    let mut cmd = Command::new(&command.command);
    cmd.args(&command.args)
        .envs(&command.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &command.cwd {
        cmd.current_dir(dir);
    }

    let spawn_error = |source: io::Error| AcpError::Spawn {
        command: command.command.clone(),
        source,
    };

    let mut child = cmd.spawn().map_err(spawn_error)?;

    // On any early return below the child is killed on drop.
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_error(io::Error::other("agent stdin was not captured")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_error(io::Error::other("agent stdout was not captured")))?;
    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| forward_stderr(stderr, command.command.clone()));

    info!(pid = ?child.id(), args = ?command.args, "Spawned agent process");

    let connection =
        ClientSideConnection::with_max_line_bytes(make_client, stdout, stdin, config.max_line_bytes);

    Ok(AgentProcess {
        connection,
        child,
        stderr_task,
        shutdown_grace: config.shutdown_grace,
        command: command.command.clone(),
    })
}

/// Run `body` against a freshly spawned agent, then shut the agent down.
///
/// Shutdown happens whether `body` succeeds or fails. If the returned
/// future is dropped before completion the agent is killed.
pub async fn with_agent_process<C, F, B, Fut, T>(
    make_client: F,
    command: &AgentCommand,
    config: &SupervisorConfig,
    body: B,
) -> Result<T>
where
    C: Client,
    F: FnOnce(AgentPeer) -> C,
    B: FnOnce(AgentPeer) -> Fut,
    Fut: Future<Output = T>,
{
    let process = spawn_agent_process(make_client, command, config)?;
    let output = body(process.agent()).await;
    process.shutdown().await?;
    Ok(output)
}

fn forward_stderr(stderr: ChildStderr, command: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(target: "acp_stdio::agent", agent = %command, "{line}"),
                Ok(None) => break,
                Err(e) => {
                    debug!(agent = %command, error = %e, "Stopped reading agent stderr");
                    break;
                }
            }
        }
    })
}

/// Serve the agent produced by `make_agent` on this process's stdin and
/// stdout until the host closes the stream.
pub async fn run_agent<A, F>(make_agent: F)
where
    A: Agent,
    F: FnOnce(ClientPeer) -> A,
{
    serve_stdio(make_agent, MAX_LINE_BYTES).await;
}

/// [`run_agent`] with an explicit inbound line limit.
pub async fn serve_stdio<A, F>(make_agent: F, max_line_bytes: usize)
where
    A: Agent,
    F: FnOnce(ClientPeer) -> A,
{
    let connection = AgentSideConnection::with_max_line_bytes(
        make_agent,
        tokio::io::stdin(),
        tokio::io::stdout(),
        max_line_bytes,
    );
    info!("Serving agent on stdio");
    connection.closed().await;
    connection.close().await;
}
