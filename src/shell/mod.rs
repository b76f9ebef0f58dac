//! Shell 集成模块
//!
//! 负责 Shell 检测。

pub mod detect;

pub use detect::{detect_default_shell, resolve_shell};
