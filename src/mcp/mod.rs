pub mod result;
#[cfg(feature = "stdio-mcp")]
pub mod server;

pub use result::ToolResult;
#[cfg(feature = "stdio-mcp")]
pub use server::MetaAdsMcpServer;
