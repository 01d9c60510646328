pub mod auth;
pub mod callback;
pub mod config;
pub mod confirm;
pub mod graph;
pub mod mcp;

pub use auth::{AuthError, AuthProvider, Token, TokenStore};
pub use callback::{CallbackServer, ServerStatus};
pub use config::{AuthMode, Config};
pub use confirm::ConfirmationCoordinator;
pub use graph::{ApiError, ErrorKind, GraphClient};
#[cfg(feature = "stdio-mcp")]
pub use mcp::MetaAdsMcpServer;
pub use mcp::ToolResult;
