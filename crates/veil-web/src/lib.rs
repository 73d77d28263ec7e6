//! # Veil Web
//!
//! 网关的HTTP面：研究状态查询、归档下载、生命周期事件历史与SSE实时流。

pub mod handlers;
pub mod server;
pub mod sse;

pub use handlers::AppContext;
pub use server::WebServer;
