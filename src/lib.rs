//! acp-stdio library
//!
//! Agent Client Protocol connections over the stdin/stdout pipes of a
//! subprocess:
//! - Newline-delimited JSON-RPC framing and message types
//! - Request/response correlation and method dispatch
//! - Typed client and agent connections with role traits
//! - Spawning and supervising agent processes

pub mod config;
pub mod connection;
pub mod echo;
pub mod error;
pub mod role;
pub mod rpc;
pub mod schema;
pub mod transport;

pub use connection::{AgentPeer, AgentSideConnection, ClientPeer, ClientSideConnection};
pub use error::{AcpError, Result};
pub use role::{Agent, Client};
pub use transport::stdio_pipe::with_agent_process;
pub use transport::{run_agent, serve_stdio, spawn_agent_process, AgentProcess};
