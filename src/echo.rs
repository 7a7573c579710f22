//! Reference agent that echoes prompts back as message chunks.
//!
//! Used by the `acp-stdio agent` subcommand and by tests that need a real
//! agent on the other end of a pipe.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::connection::ClientPeer;
use crate::role::Agent;
use crate::schema::{
    update_agent_message, AgentCapabilities, CancelNotification, Implementation,
    InitializeRequest, InitializeResponse, Meta, NewSessionRequest, NewSessionResponse,
    PromptCapabilities, PromptRequest, PromptResponse, SessionId, SessionNotification, StopReason,
};
use crate::transport::protocol::RpcError;

/// Label put in the `source` field of every update this agent sends.
pub const ECHO_SOURCE: &str = "echo_agent";

pub struct EchoAgent {
    client: ClientPeer,
    sessions: Mutex<HashSet<SessionId>>,
}

impl EchoAgent {
    pub fn new(client: ClientPeer) -> Self {
        Self {
            client,
            sessions: Mutex::new(HashSet::new()),
        }
    }

    fn knows(&self, session_id: &SessionId) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(session_id)
    }
}

fn echo_meta() -> Meta {
    let mut meta = Meta::new();
    meta.insert("echo".into(), json!(true));
    meta
}

#[async_trait]
impl Agent for EchoAgent {
    async fn initialize(&self, args: InitializeRequest) -> Result<InitializeResponse, RpcError> {
        info!(protocol_version = args.protocol_version, "Initialize");
        Ok(InitializeResponse {
            agent_capabilities: AgentCapabilities {
                prompt_capabilities: PromptCapabilities {
                    embedded_context: true,
                    ..PromptCapabilities::default()
                },
                ..AgentCapabilities::default()
            },
            agent_info: Some(Implementation {
                name: env!("CARGO_PKG_NAME").into(),
                title: Some("Echo agent".into()),
                version: env!("CARGO_PKG_VERSION").into(),
            }),
            ..InitializeResponse::new(args.protocol_version)
        })
    }

    async fn new_session(&self, args: NewSessionRequest) -> Result<NewSessionResponse, RpcError> {
        let session_id = SessionId::new(uuid::Uuid::new_v4().to_string());
        info!(%session_id, cwd = %args.cwd.display(), "New session");
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.clone());
        Ok(NewSessionResponse {
            session_id,
            meta: None,
        })
    }

    async fn prompt(&self, args: PromptRequest) -> Result<PromptResponse, RpcError> {
        if !self.knows(&args.session_id) {
            return Err(RpcError::invalid_params(format!(
                "unknown session {}",
                args.session_id
            )));
        }

        for block in args.prompt {
            let update = SessionNotification {
                session_id: args.session_id.clone(),
                update: update_agent_message(block.with_meta(echo_meta())).with_meta(echo_meta()),
                source: Some(ECHO_SOURCE.into()),
                meta: None,
            };
            self.client
                .session_update(update)
                .await
                .map_err(RpcError::internal_error)?;
        }

        debug!(session_id = %args.session_id, "Turn complete");
        Ok(PromptResponse::new(StopReason::EndTurn))
    }

    async fn cancel(&self, args: CancelNotification) -> Result<(), RpcError> {
        if self.knows(&args.session_id) {
            info!(session_id = %args.session_id, "Cancel requested, nothing in flight");
        } else {
            debug!(session_id = %args.session_id, "Cancel for unknown session");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{
        AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
    };

    use super::*;
    use crate::connection::AgentSideConnection;
    use crate::schema::{agent_methods, client_methods};
    use serde_json::Value;

    /// Raw host end, so the exact wire output of the agent is visible.
    struct Host {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        write: WriteHalf<DuplexStream>,
        _agent: AgentSideConnection,
    }

    impl Host {
        fn start() -> Self {
            let (host, agent) = tokio::io::duplex(64 * 1024);
            let (agent_read, agent_write) = tokio::io::split(agent);
            let agent = AgentSideConnection::new(EchoAgent::new, agent_read, agent_write);
            let (read, write) = tokio::io::split(host);
            Self {
                lines: BufReader::new(read).lines(),
                write,
                _agent: agent,
            }
        }

        async fn send(&mut self, frame: Value) {
            let line = format!("{frame}\n");
            self.write.write_all(line.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn new_session(&mut self, id: u64) -> String {
            self.send(json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": agent_methods::SESSION_NEW,
                "params": {"cwd": "/tmp"}
            }))
            .await;
            let created = self.recv().await;
            assert_eq!(created["id"], id);
            created["result"]["sessionId"].as_str().unwrap().to_string()
        }
    }

    #[tokio::test]
    async fn initialize_advertises_agent_info() {
        let mut host = Host::start();
        host.send(json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": agent_methods::INITIALIZE,
            "params": {"protocolVersion": 1}
        }))
        .await;
        let resp = host.recv().await;
        assert_eq!(resp["result"]["protocolVersion"], 1);
        assert_eq!(resp["result"]["agentInfo"]["name"], env!("CARGO_PKG_NAME"));
        assert_eq!(
            resp["result"]["agentCapabilities"]["promptCapabilities"]["embeddedContext"],
            true
        );
    }

    #[tokio::test]
    async fn prompt_emits_tagged_chunks_then_end_turn() {
        let mut host = Host::start();
        let session_id = host.new_session(0).await;

        host.send(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": agent_methods::SESSION_PROMPT,
            "params": {
                "sessionId": session_id,
                "prompt": [
                    {"type": "text", "text": "one"},
                    {"type": "text", "text": "two"}
                ]
            }
        }))
        .await;

        for text in ["one", "two"] {
            let frame = host.recv().await;
            assert_eq!(frame["method"], client_methods::SESSION_UPDATE);
            assert!(frame.get("id").is_none());
            let params = &frame["params"];
            assert_eq!(params["sessionId"], session_id.as_str());
            assert_eq!(params["source"], ECHO_SOURCE);
            assert_eq!(params["update"]["sessionUpdate"], "agent_message_chunk");
            assert_eq!(params["update"]["content"]["text"], text);
            assert_eq!(params["update"]["_meta"]["echo"], true);
            assert_eq!(params["update"]["content"]["_meta"]["echo"], true);
        }
        let done = host.recv().await;
        assert_eq!(done["id"], 1);
        assert_eq!(done["result"]["stopReason"], "end_turn");
    }

    #[tokio::test]
    async fn cancel_gets_no_reply_and_connection_stays_up() {
        let mut host = Host::start();
        let session_id = host.new_session(0).await;

        host.send(json!({
            "jsonrpc": "2.0",
            "method": agent_methods::SESSION_CANCEL,
            "params": {"sessionId": session_id}
        }))
        .await;
        host.send(json!({
            "jsonrpc": "2.0",
            "method": agent_methods::SESSION_CANCEL,
            "params": {"sessionId": "never-created"}
        }))
        .await;

        // The next frame out is the reply to this request, not anything
        // caused by the cancels.
        let second = host.new_session(1).await;
        assert_ne!(second, session_id);
    }

    #[tokio::test]
    async fn prompt_for_unknown_session_is_invalid_params() {
        let mut host = Host::start();
        host.send(json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": agent_methods::SESSION_PROMPT,
            "params": {"sessionId": "nope", "prompt": []}
        }))
        .await;
        let resp = host.recv().await;
        assert_eq!(resp["id"], 7);
        assert_eq!(resp["error"]["code"], RpcError::INVALID_PARAMS);
        assert!(resp["error"]["message"].as_str().unwrap().contains("nope"));
    }
}
