//! 连接网关
//!
//! 每个 WebSocket 连接一个 [`Connection`]：把协议命令分发到注册表，
//! 所有权检查使用连接自身的 ID。断开时的清理只执行一次。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::events::EventSender;
use super::protocol::ClientMessage;
use crate::pty::registry::SessionRegistry;
use crate::pty::types::{ConnectionId, SessionId, TermSize};
use crate::utils::error::TerminalError;

/// 连接
pub struct Connection {
    id: ConnectionId,
    registry: Arc<SessionRegistry>,
    events: EventSender,
    disconnected: AtomicBool,
}

impl Connection {
    pub fn new(registry: Arc<SessionRegistry>, events: EventSender) -> Self {
        let id = ConnectionId::generate();
        tracing::info!("连接建立: {}", id.short());
        Self {
            id,
            registry,
            events,
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// 处理一个文本帧
    ///
    /// 无法解析的帧回复 `error`，不影响连接。
    pub async fn handle_text(&self, text: &str) {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                tracing::debug!("无法解析的消息 ({}): {}", self.id.short(), e);
                let err = TerminalError::InvalidRequest(e.to_string());
                let _ = self.events.send_error(err.client_message());
            }
        }
    }

    /// 分发一条命令
    pub async fn handle(&self, message: ClientMessage) {
        match message {
            ClientMessage::NewSession { cols, rows } => {
                let size = match (cols, rows) {
                    (Some(cols), Some(rows)) => Some(TermSize::clamped(rows, cols)),
                    _ => None,
                };
                self.new_session(size).await;
            }
            ClientMessage::Input { id, data } => self.input(&id, data.as_bytes()),
            ClientMessage::Resize { id, cols, rows } => {
                self.resize(&id, TermSize::clamped(rows, cols))
            }
            ClientMessage::CloseSession { id } => self.close_session(&id),
            ClientMessage::ListSessions => {
                let _ = self.events.send_list(self.registry.sessions_owned_by(&self.id));
            }
        }
    }

    async fn new_session(&self, size: Option<TermSize>) {
        if self.disconnected.load(Ordering::SeqCst) {
            return;
        }

        // spawn 可能阻塞，放到阻塞线程池
        let registry = self.registry.clone();
        let owner = self.id.clone();
        let events = self.events.clone();
        let result =
            tokio::task::spawn_blocking(move || registry.create(&owner, events, size)).await;

        match result {
            Ok(Ok(session)) => {
                // 创建期间连接已断开：不能留下孤儿会话
                if self.disconnected.load(Ordering::SeqCst) {
                    self.registry.close(session.id());
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(kind = e.error_type(), "创建会话失败 ({}): {}", self.id.short(), e);
                let _ = self.events.send_error(e.client_message());
            }
            Err(e) => {
                tracing::error!("创建会话任务异常 ({}): {}", self.id.short(), e);
                let _ = self.events.send_error("创建会话失败");
            }
        }
    }

    fn input(&self, id: &SessionId, data: &[u8]) {
        let Some(session) = self.registry.lookup(id, &self.id) else {
            tracing::debug!("丢弃输入: 会话 {} 不属于连接 {}", id, self.id.short());
            return;
        };

        match session.write(data) {
            Ok(()) => tracing::trace!("发送输入到会话 {}: {} bytes", id, data.len()),
            Err(e) if e.is_already_gone() => {
                tracing::debug!("会话正在关闭，丢弃输入: {}", id);
            }
            Err(e) => tracing::warn!("写入会话失败: {} ({})", id, e),
        }
    }

    fn resize(&self, id: &SessionId, size: TermSize) {
        let Some(session) = self.registry.lookup(id, &self.id) else {
            tracing::debug!("丢弃调整大小: 会话 {} 不属于连接 {}", id, self.id.short());
            return;
        };

        match session.resize(size) {
            Ok(()) => tracing::debug!("调整会话大小: {} -> {}x{}", id, size.cols, size.rows),
            Err(e) if e.is_already_gone() => {}
            Err(e) => tracing::warn!("调整会话大小失败: {} ({})", id, e),
        }
    }

    /// 关闭会话，无论是否存在都回复 `session_closed`
    fn close_session(&self, id: &SessionId) {
        if !self.registry.close_owned(id, &self.id) {
            tracing::debug!("关闭请求无效: 会话 {} 不属于连接 {}", id, self.id.short());
        }
        let _ = self.events.send_closed(id);
    }

    /// 断开连接，关闭本连接的全部会话
    ///
    /// 只有第一次调用生效，返回关闭的会话数。
    pub fn disconnect(&self) -> usize {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let closed = self.registry.close_all_owned_by(&self.id);
        tracing::info!("连接断开: {} (关闭 {} 个会话)", self.id.short(), closed);
        closed
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::events::EventReceiver;
    use crate::gateway::protocol::ServerEvent;
    use crate::pty::backend::ShellCommand;
    use crate::pty::registry::RegistryConfig;
    use crate::pty::testing::{wait_until, FakeBackend};
    use crate::pty::types::SessionState;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn setup(max: usize) -> (Arc<FakeBackend>, Arc<SessionRegistry>) {
        let backend = FakeBackend::new();
        let mut config = RegistryConfig::new(ShellCommand::new("/bin/sh"));
        config.max_sessions_per_owner = max;
        config.close_grace = Duration::from_millis(100);
        let registry = SessionRegistry::new(backend.clone(), config);
        (backend, registry)
    }

    fn connect(registry: &Arc<SessionRegistry>) -> (Connection, EventReceiver) {
        let (events, rx) = EventSender::channel();
        (Connection::new(registry.clone(), events), rx)
    }

    async fn next_event(rx: &mut EventReceiver) -> ServerEvent {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn create(conn: &Connection, rx: &mut EventReceiver) -> SessionId {
        conn.handle_text(r#"{"type":"new_session"}"#).await;
        match next_event(rx).await {
            ServerEvent::SessionCreated { id } => id,
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_input_routed_only_to_owner() {
        let (backend, registry) = setup(0);
        let (conn_a, mut rx_a) = connect(&registry);
        let (conn_b, _rx_b) = connect(&registry);

        let s1 = create(&conn_a, &mut rx_a).await;
        let probe = backend.last_probe().unwrap();

        let payload = format!(r#"{{"type":"input","id":"{}","data":"ls\n"}}"#, s1);
        conn_b.handle_text(&payload).await;
        assert!(probe.input().is_empty());

        conn_a.handle_text(&payload).await;
        assert!(wait_until(WAIT, || probe.input() == b"ls\n"));
    }

    #[tokio::test]
    async fn test_input_to_unknown_session_is_ignored() {
        let (_backend, registry) = setup(0);
        let (conn, mut rx) = connect(&registry);

        conn.handle_text(r#"{"type":"input","id":"no-such-session","data":"x"}"#)
            .await;
        conn.handle_text(r#"{"type":"resize","id":"no-such-session","cols":80,"rows":24}"#)
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_echoed_output_reaches_owner() {
        let (_backend, registry) = setup(0);
        let (conn, mut rx) = connect(&registry);
        let id = create(&conn, &mut rx).await;

        conn.handle(ClientMessage::Input {
            id: id.clone(),
            data: "echo hi\n".to_string(),
        })
        .await;

        match next_event(&mut rx).await {
            ServerEvent::Output { id: out_id, data, .. } => {
                assert_eq!(out_id, id);
                assert_eq!(data, "echo hi\n");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resize_with_owner_check() {
        let (backend, registry) = setup(0);
        let (conn_a, mut rx_a) = connect(&registry);
        let (conn_b, _rx_b) = connect(&registry);
        let id = create(&conn_a, &mut rx_a).await;
        let probe = backend.last_probe().unwrap();

        conn_b
            .handle(ClientMessage::Resize {
                id: id.clone(),
                cols: 10,
                rows: 10,
            })
            .await;
        assert_eq!(probe.size(), Some(TermSize::default()));

        conn_a
            .handle(ClientMessage::Resize {
                id,
                cols: 0,
                rows: 30,
            })
            .await;
        assert_eq!(probe.size(), Some(TermSize { rows: 30, cols: 1 }));
    }

    #[tokio::test]
    async fn test_close_session_always_replies_closed() {
        let (backend, registry) = setup(0);
        let (conn_a, mut rx_a) = connect(&registry);
        let (conn_b, mut rx_b) = connect(&registry);
        let id = create(&conn_a, &mut rx_a).await;

        // 其他连接的关闭请求不生效，但回复形状相同
        conn_b
            .handle(ClientMessage::CloseSession { id: id.clone() })
            .await;
        assert!(matches!(next_event(&mut rx_b).await, ServerEvent::SessionClosed { .. }));
        assert_eq!(registry.len(), 1);

        conn_a
            .handle(ClientMessage::CloseSession { id: id.clone() })
            .await;
        match next_event(&mut rx_a).await {
            ServerEvent::SessionClosed { id: closed } => assert_eq!(closed, id),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(registry.is_empty());
        assert!(wait_until(WAIT, || backend.live_handles() == 0));
    }

    #[tokio::test]
    async fn test_list_sessions_only_own() {
        let (_backend, registry) = setup(0);
        let (conn_a, mut rx_a) = connect(&registry);
        let (conn_b, mut rx_b) = connect(&registry);

        let mine = create(&conn_a, &mut rx_a).await;
        create(&conn_b, &mut rx_b).await;

        conn_a.handle(ClientMessage::ListSessions).await;
        match next_event(&mut rx_a).await {
            ServerEvent::SessionList { sessions } => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(sessions[0].id, mine);
                assert_eq!(sessions[0].state, SessionState::Running);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_limit_and_spawn_failure_reported_as_error() {
        let (backend, registry) = setup(1);
        let (conn, mut rx) = connect(&registry);
        create(&conn, &mut rx).await;

        conn.handle_text(r#"{"type":"new_session"}"#).await;
        assert!(matches!(next_event(&mut rx).await, ServerEvent::Error { .. }));

        let (conn_b, mut rx_b) = connect(&registry);
        backend.set_fail_spawn(true);
        conn_b.handle_text(r#"{"type":"new_session"}"#).await;
        match next_event(&mut rx_b).await {
            ServerEvent::Error { message } => assert!(message.contains("/bin/sh")),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_reports_error() {
        let (_backend, registry) = setup(0);
        let (conn, mut rx) = connect(&registry);

        conn.handle_text("{not json").await;
        assert!(matches!(next_event(&mut rx).await, ServerEvent::Error { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_closes_all_owned_once() {
        let (backend, registry) = setup(0);
        let (conn_a, mut rx_a) = connect(&registry);
        let (conn_b, mut rx_b) = connect(&registry);

        for _ in 0..3 {
            create(&conn_a, &mut rx_a).await;
        }
        create(&conn_b, &mut rx_b).await;

        assert_eq!(conn_a.disconnect(), 3);
        assert_eq!(conn_a.disconnect(), 0);
        drop(conn_a);
        drop(rx_a);

        assert_eq!(registry.len(), 1);
        assert!(wait_until(WAIT, || backend.live_handles() == 3));

        drop(conn_b);
        assert!(registry.is_empty());
        assert!(wait_until(WAIT, || backend.live_handles() == 0));
    }
}
