//! Role traits for the two ends of an ACP connection.
//!
//! An endpoint plays exactly one role. The host process implements
//! [`Client`] to answer the agent's calls; the agent process implements
//! [`Agent`] to answer the host's. Domain logic (model calls, permission
//! policy) plugs in here and nowhere else, so implementations are
//! swappable without touching the connection machinery.

use std::sync::Arc;

use async_trait::async_trait;

use crate::rpc::Router;
use crate::schema::{
    agent_methods, client_methods, CancelNotification, InitializeRequest, InitializeResponse,
    NewSessionRequest, NewSessionResponse, PromptRequest, PromptResponse,
    RequestPermissionRequest, RequestPermissionResponse, SessionNotification,
};
use crate::transport::protocol::RpcError;

/// Calls an agent answers.
///
/// Errors returned from these methods travel back to the caller as a
/// structured JSON-RPC error.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// Negotiate the protocol version and exchange capabilities.
    async fn initialize(&self, args: InitializeRequest) -> Result<InitializeResponse, RpcError>;

    /// Create a session rooted at `args.cwd` and return its id.
    async fn new_session(&self, args: NewSessionRequest)
        -> Result<NewSessionResponse, RpcError>;

    /// Process one user turn.
    ///
    /// Progress is reported to the client with `session/update`
    /// notifications before this returns.
    async fn prompt(&self, args: PromptRequest) -> Result<PromptResponse, RpcError>;

    /// Stop work on a session's current turn. There is no reply.
    async fn cancel(&self, _args: CancelNotification) -> Result<(), RpcError> {
        Ok(())
    }
}

/// Calls a client answers.
#[async_trait]
pub trait Client: Send + Sync + 'static {
    /// Ask the user whether a tool call may proceed.
    async fn request_permission(
        &self,
        args: RequestPermissionRequest,
    ) -> Result<RequestPermissionResponse, RpcError>;

    /// Receive a progress update. There is no reply; an error is only logged.
    async fn session_update(&self, args: SessionNotification) -> Result<(), RpcError>;
}

/// Dispatch table serving `agent` to a client.
pub fn agent_router<A: Agent>(agent: Arc<A>) -> Router {
    let mut router = Router::new();

    let a = Arc::clone(&agent);
    router.on_request(agent_methods::INITIALIZE, move |args: InitializeRequest| {
        let a = Arc::clone(&a);
        async move { a.initialize(args).await }
    });

    let a = Arc::clone(&agent);
    router.on_request(agent_methods::SESSION_NEW, move |args: NewSessionRequest| {
        let a = Arc::clone(&a);
        async move { a.new_session(args).await }
    });

    let a = Arc::clone(&agent);
    router.on_request(agent_methods::SESSION_PROMPT, move |args: PromptRequest| {
        let a = Arc::clone(&a);
        async move { a.prompt(args).await }
    });

    router.on_notification(
        agent_methods::SESSION_CANCEL,
        move |args: CancelNotification| {
            let a = Arc::clone(&agent);
            async move { a.cancel(args).await }
        },
    );

    router
}

/// Dispatch table serving `client` to an agent.
pub fn client_router<C: Client>(client: Arc<C>) -> Router {
    let mut router = Router::new();

    let c = Arc::clone(&client);
    router.on_request(
        client_methods::SESSION_REQUEST_PERMISSION,
        move |args: RequestPermissionRequest| {
            let c = Arc::clone(&c);
            async move { c.request_permission(args).await }
        },
    );

    router.on_notification(
        client_methods::SESSION_UPDATE,
        move |args: SessionNotification| {
            let c = Arc::clone(&client);
            async move { c.session_update(args).await }
        },
    );

    router
}
