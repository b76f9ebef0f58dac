//! 错误类型定义
//!
//! 定义终端会话复用器的错误类型，提供描述性错误消息。
//!
//! ## 功能
//! - 定义 TerminalError 枚举，覆盖 spawn / write / 上限 / 认证等错误
//! - 区分"已经结束"（可忽略）与真正意外的失败
//! - 转换为发往客户端的 `error` 事件文本

use std::io;

use thiserror::Error;

/// 终端错误类型
#[derive(Debug, Error)]
pub enum TerminalError {
    /// PTY 或子进程创建失败（找不到 shell、pty 资源耗尽、权限不足）
    #[error("PTY 创建失败: {0}")]
    SpawnFailed(String),

    /// 会话已关闭（写入已经结束的 pty）
    #[error("会话已关闭: {0}")]
    SessionClosed(String),

    /// 超出每个连接的会话数量上限
    #[error("会话数量已达上限: {limit}")]
    SessionLimitReached { limit: usize },

    /// 无效的请求
    #[error("无效的请求: {0}")]
    InvalidRequest(String),

    /// 认证失败
    #[error("认证失败: {0}")]
    AuthenticationFailed(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    IoError(#[from] io::Error),
}

impl TerminalError {
    /// 获取错误类型名称
    pub fn error_type(&self) -> &'static str {
        match self {
            TerminalError::SpawnFailed(_) => "spawn_failed",
            TerminalError::SessionClosed(_) => "session_closed",
            TerminalError::SessionLimitReached { .. } => "session_limit_reached",
            TerminalError::InvalidRequest(_) => "invalid_request",
            TerminalError::AuthenticationFailed(_) => "authentication_failed",
            TerminalError::IoError(_) => "io_error",
        }
    }

    /// 目标已经结束（进程退出或描述符已关闭），调用方可以直接忽略
    pub fn is_already_gone(&self) -> bool {
        matches!(self, TerminalError::SessionClosed(_))
    }

    /// 对 pty 写入失败进行分类
    ///
    /// 对端已经关闭的情况（EPIPE / EIO / EBADF）归为 `SessionClosed`，
    /// 其余保留为 `IoError`。
    pub fn write_failed(err: io::Error) -> Self {
        if is_closed_descriptor(&err) {
            TerminalError::SessionClosed(err.to_string())
        } else {
            TerminalError::IoError(err)
        }
    }

    /// 创建 spawn 失败错误（包含 shell 信息）
    pub fn spawn_failed(shell: &str, reason: impl std::fmt::Display) -> Self {
        TerminalError::SpawnFailed(format!("无法启动 {}: {}", shell, reason))
    }

    /// 创建会话关闭错误
    pub fn session_closed(session_id: impl std::fmt::Display) -> Self {
        TerminalError::SessionClosed(session_id.to_string())
    }

    /// 发往客户端的错误文本
    ///
    /// IO 细节只写日志，不回传给浏览器。
    pub fn client_message(&self) -> String {
        match self {
            TerminalError::IoError(_) => "内部错误".to_string(),
            _ => self.to_string(),
        }
    }
}

/// 判断 IO 错误是否表示描述符已经失效
fn is_closed_descriptor(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected | io::ErrorKind::UnexpectedEof
    ) {
        return true;
    }

    #[cfg(unix)]
    {
        // EIO: 从端已关闭; EBADF: 描述符已释放
        if let Some(code) = err.raw_os_error() {
            return code == nix::libc::EIO || code == nix::libc::EBADF;
        }
    }

    #[cfg(windows)]
    {
        // ERROR_BROKEN_PIPE (109) / ERROR_NO_DATA (232)
        if let Some(code) = err.raw_os_error() {
            return code == 109 || code == 232;
        }
    }

    false
}
