//! 工具模块
//!
//! 提供错误类型和会话状态管理。

pub mod error;
pub mod state;

pub use error::TerminalError;
pub use state::{SessionStateManager, StateTransitionResult};
