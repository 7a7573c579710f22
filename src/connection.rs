//! Typed ACP connections.
//!
//! [`ClientSideConnection`] is what a host holds: it serves a [`Client`]
//! and calls the agent through an [`AgentPeer`]. [`AgentSideConnection`]
//! is the mirror image for the agent process. Both deref to their peer, so
//! `conn.prompt(...)` reads the way the protocol does.

use std::ops::Deref;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::role::{agent_router, client_router, Agent, Client};
use crate::rpc::{Peer, RpcConnection};
use crate::schema::{
    agent_methods, client_methods, CancelNotification, InitializeRequest, InitializeResponse,
    NewSessionRequest, NewSessionResponse, PromptRequest, PromptResponse,
    RequestPermissionRequest, RequestPermissionResponse, SessionId, SessionNotification,
};
use crate::transport::MAX_LINE_BYTES;

/// Calls a client can make on an agent.
#[derive(Clone)]
pub struct AgentPeer {
    peer: Peer,
}

impl AgentPeer {
    pub async fn initialize(&self, args: InitializeRequest) -> Result<InitializeResponse> {
        self.peer.request(agent_methods::INITIALIZE, &args).await
    }

    pub async fn new_session(&self, args: NewSessionRequest) -> Result<NewSessionResponse> {
        self.peer.request(agent_methods::SESSION_NEW, &args).await
    }

    pub async fn prompt(&self, args: PromptRequest) -> Result<PromptResponse> {
        self.peer.request(agent_methods::SESSION_PROMPT, &args).await
    }

    /// Ask the agent to stop the session's current turn.
    pub async fn cancel(&self, session_id: SessionId) -> Result<()> {
        let args = CancelNotification {
            session_id,
            meta: None,
        };
        self.peer.notify(agent_methods::SESSION_CANCEL, &args).await
    }

    /// Untyped access for extension methods.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }
}

/// Calls an agent can make on a client.
#[derive(Clone)]
pub struct ClientPeer {
    peer: Peer,
}

impl ClientPeer {
    /// Stream a progress update. Returns once the frame is written.
    pub async fn session_update(&self, args: SessionNotification) -> Result<()> {
        self.peer.notify(client_methods::SESSION_UPDATE, &args).await
    }

    pub async fn request_permission(
        &self,
        args: RequestPermissionRequest,
    ) -> Result<RequestPermissionResponse> {
        self.peer
            .request(client_methods::SESSION_REQUEST_PERMISSION, &args)
            .await
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }
}

/// Host end of a connection: serves a [`Client`], talks to an agent.
pub struct ClientSideConnection {
    agent: AgentPeer,
    rpc: RpcConnection,
}

impl ClientSideConnection {
    /// `make_client` receives a handle to the agent so the client can call
    /// back into it (e.g. to cancel a turn).
    pub fn new<C, F, R, W>(make_client: F, reader: R, writer: W) -> Self
    where
        C: Client,
        F: FnOnce(AgentPeer) -> C,
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self::with_max_line_bytes(make_client, reader, writer, MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes<C, F, R, W>(
        make_client: F,
        reader: R,
        writer: W,
        max_line_bytes: usize,
    ) -> Self
    where
        C: Client,
        F: FnOnce(AgentPeer) -> C,
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let rpc = RpcConnection::build("client", reader, writer, max_line_bytes, |peer| {
            client_router(Arc::new(make_client(AgentPeer { peer })))
        });
        let agent = AgentPeer {
            peer: rpc.peer().clone(),
        };
        Self { agent, rpc }
    }

    pub async fn close(&self) {
        self.rpc.close().await;
    }

    pub async fn closed(&self) {
        self.rpc.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.rpc.peer().is_closed()
    }
}

impl Deref for ClientSideConnection {
    type Target = AgentPeer;

    fn deref(&self) -> &AgentPeer {
        &self.agent
    }
}

/// Agent end of a connection: serves an [`Agent`], talks to a client.
pub struct AgentSideConnection {
    client: ClientPeer,
    rpc: RpcConnection,
}

impl AgentSideConnection {
    /// `make_agent` receives the handle it uses for `session/update` and
    /// `session/request_permission`.
    pub fn new<A, F, R, W>(make_agent: F, reader: R, writer: W) -> Self
    where
        A: Agent,
        F: FnOnce(ClientPeer) -> A,
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self::with_max_line_bytes(make_agent, reader, writer, MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes<A, F, R, W>(
        make_agent: F,
        reader: R,
        writer: W,
        max_line_bytes: usize,
    ) -> Self
    where
        A: Agent,
        F: FnOnce(ClientPeer) -> A,
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let rpc = RpcConnection::build("agent", reader, writer, max_line_bytes, |peer| {
            agent_router(Arc::new(make_agent(ClientPeer { peer })))
        });
        let client = ClientPeer {
            peer: rpc.peer().clone(),
        };
        Self { client, rpc }
    }

    pub async fn close(&self) {
        self.rpc.close().await;
    }

    pub async fn closed(&self) {
        self.rpc.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.rpc.peer().is_closed()
    }
}

impl Deref for AgentSideConnection {
    type Target = ClientPeer;

    fn deref(&self) -> &ClientPeer {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::echo::EchoAgent;
    use crate::error::AcpError;
    use crate::schema::{
        text_block, PermissionOption, PermissionOptionKind, RequestPermissionOutcome,
        SessionUpdate, StopReason, ToolCallUpdate, PROTOCOL_VERSION,
    };
    use crate::transport::protocol::RpcError;

    /// Client that records every update it sees.
    #[derive(Default, Clone)]
    struct RecordingClient {
        updates: Arc<Mutex<Vec<SessionNotification>>>,
    }

    #[async_trait]
    impl Client for RecordingClient {
        async fn request_permission(
            &self,
            args: RequestPermissionRequest,
        ) -> std::result::Result<RequestPermissionResponse, RpcError> {
            let option_id = args.options[0].option_id.clone();
            Ok(RequestPermissionResponse::new(
                RequestPermissionOutcome::Selected { option_id },
            ))
        }

        async fn session_update(
            &self,
            args: SessionNotification,
        ) -> std::result::Result<(), RpcError> {
            self.updates.lock().unwrap().push(args);
            Ok(())
        }
    }

    fn connect<A, F>(
        make_agent: F,
        client: RecordingClient,
    ) -> (AgentSideConnection, ClientSideConnection)
    where
        A: Agent,
        F: FnOnce(ClientPeer) -> A,
    {
        let (host, agent) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host);
        let (agent_read, agent_write) = tokio::io::split(agent);
        (
            AgentSideConnection::new(make_agent, agent_read, agent_write),
            ClientSideConnection::new(move |_| client, host_read, host_write),
        )
    }

    #[tokio::test]
    async fn initialize_echoes_protocol_version() {
        let (_agent, conn) = connect(EchoAgent::new, RecordingClient::default());
        let resp = conn
            .initialize(InitializeRequest::new(PROTOCOL_VERSION))
            .await
            .unwrap();
        assert_eq!(resp.protocol_version, 1);
    }

    #[tokio::test]
    async fn session_ids_are_unique() {
        let (_agent, conn) = connect(EchoAgent::new, RecordingClient::default());
        let a = conn.new_session(NewSessionRequest::new("/tmp")).await.unwrap();
        let b = conn.new_session(NewSessionRequest::new("/tmp")).await.unwrap();
        assert!(!a.session_id.as_str().is_empty());
        assert_ne!(a.session_id, b.session_id);
    }

    #[tokio::test]
    async fn updates_arrive_before_prompt_resolves() {
        let client = RecordingClient::default();
        let (_agent, conn) = connect(EchoAgent::new, client.clone());
        let session = conn.new_session(NewSessionRequest::new("/tmp")).await.unwrap();

        let resp = conn
            .prompt(PromptRequest::new(
                session.session_id.clone(),
                vec![text_block("hello")],
            ))
            .await
            .unwrap();
        assert_eq!(resp.stop_reason, StopReason::EndTurn);

        let updates = client.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].session_id, session.session_id);
        assert_eq!(updates[0].source.as_deref(), Some("echo_agent"));
        let SessionUpdate::AgentMessageChunk(chunk) = &updates[0].update else {
            panic!("expected agent message chunk");
        };
        assert_eq!(chunk.content.text(), Some("hello"));
    }

    #[tokio::test]
    async fn prompt_for_unknown_session_is_remote_error() {
        let (_agent, conn) = connect(EchoAgent::new, RecordingClient::default());
        let err = conn
            .prompt(PromptRequest::new(SessionId::new("nope"), vec![text_block("x")]))
            .await
            .unwrap_err();
        assert!(matches!(err, AcpError::Remote(e) if e.code == RpcError::INVALID_PARAMS));
    }

    /// Agent that asks for permission in the middle of a turn.
    struct CautiousAgent {
        client: ClientPeer,
    }

    #[async_trait]
    impl Agent for CautiousAgent {
        async fn initialize(
            &self,
            args: InitializeRequest,
        ) -> std::result::Result<InitializeResponse, RpcError> {
            Ok(InitializeResponse::new(args.protocol_version))
        }

        async fn new_session(
            &self,
            _args: NewSessionRequest,
        ) -> std::result::Result<NewSessionResponse, RpcError> {
            Ok(NewSessionResponse {
                session_id: SessionId::new("s1"),
                meta: None,
            })
        }

        async fn prompt(
            &self,
            args: PromptRequest,
        ) -> std::result::Result<PromptResponse, RpcError> {
            let answer = self
                .client
                .request_permission(RequestPermissionRequest {
                    session_id: args.session_id,
                    tool_call: ToolCallUpdate {
                        tool_call_id: "call-1".into(),
                        title: Some("rm -rf build".into()),
                        ..ToolCallUpdate::default()
                    },
                    options: vec![PermissionOption {
                        option_id: "allow".into(),
                        name: "Allow".into(),
                        kind: PermissionOptionKind::AllowOnce,
                        meta: None,
                    }],
                    meta: None,
                })
                .await
                .map_err(RpcError::internal_error)?;
            match answer.outcome {
                RequestPermissionOutcome::Selected { option_id } if option_id == "allow" => {
                    Ok(PromptResponse::new(StopReason::EndTurn))
                }
                _ => Ok(PromptResponse::new(StopReason::Refusal)),
            }
        }
    }

    #[tokio::test]
    async fn nested_call_back_to_client_during_prompt() {
        let (_agent, conn) = connect(
            |client| CautiousAgent { client },
            RecordingClient::default(),
        );
        let resp = tokio::time::timeout(
            Duration::from_secs(5),
            conn.prompt(PromptRequest::new(SessionId::new("s1"), vec![text_block("go")])),
        )
        .await
        .expect("nested permission request must not deadlock")
        .unwrap();
        assert_eq!(resp.stop_reason, StopReason::EndTurn);
    }

    #[tokio::test]
    async fn closing_host_side_ends_agent_side() {
        let (agent, conn) = connect(EchoAgent::new, RecordingClient::default());
        conn.close().await;
        assert!(conn.is_closed());
        tokio::time::timeout(Duration::from_secs(5), agent.closed())
            .await
            .unwrap();

        let err = conn
            .initialize(InitializeRequest::new(PROTOCOL_VERSION))
            .await
            .unwrap_err();
        assert!(matches!(err, AcpError::ConnectionClosed));
    }
}
