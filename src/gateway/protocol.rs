//! 会话协议消息
//!
//! WebSocket 文本帧承载 JSON，以 `type` 字段区分消息种类。

use serde::{Deserialize, Serialize};

use crate::pty::output::OutputEncoding;
use crate::pty::types::{SessionId, SessionInfo};

/// 客户端 -> 服务端
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// 新建会话，可带初始尺寸
    NewSession {
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
    /// 键盘输入
    Input { id: SessionId, data: String },
    /// 调整终端尺寸
    Resize { id: SessionId, cols: u16, rows: u16 },
    /// 关闭会话
    CloseSession { id: SessionId },
    /// 列出本连接的会话
    ListSessions,
}

impl ClientMessage {
    /// 解析一个文本帧
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// 服务端 -> 客户端
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    SessionCreated {
        id: SessionId,
    },
    SessionClosed {
        id: SessionId,
    },
    /// 输出泵推送的数据
    Output {
        id: SessionId,
        data: String,
        encoding: OutputEncoding,
    },
    /// 子进程自行结束（EOF 或读取错误）
    SessionEnded {
        id: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    SessionList {
        sessions: Vec<SessionInfo>,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    /// 序列化为文本帧
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
