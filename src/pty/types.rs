//! 会话数据类型定义
//!
//! 会话 ID、连接 ID、终端尺寸、会话状态和会话信息。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 会话 ID
///
/// 创建时生成的不透明令牌，永不复用。
/// 反序列化接受任意字符串，格式错误的 ID 只会查找失败。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// 生成新的会话 ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 线程名中使用的短形式
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 连接 ID
///
/// 每个 WebSocket 连接一个，仅用作会话归属的键。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// 生成新的连接 ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// 日志中使用的短形式
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 终端尺寸
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TermSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl TermSize {
    /// 客户端可能发来 0，取最小 1x1
    pub fn clamped(rows: u16, cols: u16) -> Self {
        Self {
            rows: rows.max(1),
            cols: cols.max(1),
        }
    }
}

/// 会话状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// 已创建，输出泵尚未启动
    Starting,
    /// 运行中
    Running,
    /// 正在关闭（已请求终止，等待输出泵退出）
    Closing,
    /// 已关闭，资源已释放
    Closed,
}

/// 会话信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub shell: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_term_size_default() {
        let size = TermSize::default();
        assert_eq!(size.rows, 24);
        assert_eq!(size.cols, 80);
    }

    #[test]
    fn test_term_size_clamped() {
        assert_eq!(TermSize::clamped(0, 0), TermSize { rows: 1, cols: 1 });
        assert_eq!(TermSize::clamped(40, 120), TermSize { rows: 40, cols: 120 });
    }

    #[test]
    fn test_session_id_is_transparent_string() {
        let id = SessionId::from("abc123");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc123\"");

        let parsed: SessionId = serde_json::from_str("\"not-a-uuid\"").unwrap();
        assert_eq!(parsed.as_str(), "not-a-uuid");
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let ids: HashSet<_> = (0..1000).map(|_| SessionId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_connection_id_short() {
        let id = ConnectionId::from("0123456789abcdef");
        assert_eq!(id.short(), "01234567");
        assert_eq!(ConnectionId::from("ab").short(), "ab");
    }

    #[test]
    fn test_session_state_serialization() {
        assert_eq!(
            serde_json::to_string(&SessionState::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&SessionState::Closing).unwrap(),
            "\"closing\""
        );
    }
}
