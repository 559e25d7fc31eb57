//! MCP (Model Context Protocol) tool surface over the session service.

pub mod tools;

pub use tools::ToolRouter;
