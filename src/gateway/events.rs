//! 连接事件发送器
//!
//! 每个连接一个无界队列，输出泵线程和命令处理都通过它推送事件，
//! 由连接的写任务按入队顺序发送。连接断开后发送静默失败。

use tokio::sync::mpsc;

use super::protocol::ServerEvent;
use crate::pty::output::OutputEncoding;
use crate::pty::types::{SessionId, SessionInfo};

/// 事件发送器
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<ServerEvent>,
}

pub type EventReceiver = mpsc::UnboundedReceiver<ServerEvent>;

/// 连接已断开
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

impl EventSender {
    /// 创建一对发送器和接收器
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// 发送事件
    pub fn send(&self, event: ServerEvent) -> Result<(), Disconnected> {
        self.tx.send(event).map_err(|_| Disconnected)
    }

    /// 接收端是否已经关闭
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// 发送终端输出
    pub fn send_output(
        &self,
        id: &SessionId,
        data: String,
        encoding: OutputEncoding,
    ) -> Result<(), Disconnected> {
        self.send(ServerEvent::Output {
            id: id.clone(),
            data,
            encoding,
        })
    }

    pub fn send_created(&self, id: &SessionId) -> Result<(), Disconnected> {
        self.send(ServerEvent::SessionCreated { id: id.clone() })
    }

    pub fn send_closed(&self, id: &SessionId) -> Result<(), Disconnected> {
        self.send(ServerEvent::SessionClosed { id: id.clone() })
    }

    /// 发送会话结束通知
    pub fn send_ended(&self, id: &SessionId, exit_code: Option<i32>) -> Result<(), Disconnected> {
        self.send(ServerEvent::SessionEnded {
            id: id.clone(),
            exit_code,
        })
    }

    pub fn send_list(&self, sessions: Vec<SessionInfo>) -> Result<(), Disconnected> {
        self.send(ServerEvent::SessionList { sessions })
    }

    /// 发送错误通知
    pub fn send_error(&self, message: impl Into<String>) -> Result<(), Disconnected> {
        self.send(ServerEvent::Error {
            message: message.into(),
        })
    }
}
