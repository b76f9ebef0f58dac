//! glterm 库
//!
//! 浏览器终端会话复用：伪终端会话的创建、输入输出转发和按连接清理。

pub mod config;
pub mod gateway;
pub mod pty;
pub mod shell;
pub mod utils;
