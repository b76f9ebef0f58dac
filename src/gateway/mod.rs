//! 连接网关模块
//!
//! 浏览器通过 WebSocket 连接，收发会话协议消息。

pub mod auth;
pub mod connection;
pub mod events;
pub mod protocol;
pub mod server;

pub use auth::KeyAuth;
pub use connection::Connection;
pub use events::{EventReceiver, EventSender};
pub use protocol::{ClientMessage, ServerEvent};
pub use server::{build_router, serve, AppState};
