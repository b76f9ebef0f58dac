//! 会话注册表
//!
//! 进程内唯一的会话表：哪些会话存在、归谁所有。
//! 所有修改都在一把互斥锁下完成；后端调用（spawn / terminate）一律在锁外进行。

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::backend::{PtyBackend, ShellCommand, SpawnedPty};
use super::input::start_input_writer;
use super::output::{start_output_pump, OutputPumpConfig, PumpExit};
use super::session::TerminalSession;
use super::types::{ConnectionId, SessionId, SessionInfo, TermSize};
use crate::gateway::events::EventSender;
use crate::utils::error::TerminalError;

/// 每个连接默认允许的会话数
pub const DEFAULT_MAX_SESSIONS: usize = 8;

/// 关闭后等待进程退出的默认时间
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(3);

/// 注册表配置
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// 新会话启动的 shell
    pub shell: ShellCommand,
    /// 每个连接的会话上限，0 表示不限制
    pub max_sessions_per_owner: usize,
    /// 输出泵配置
    pub pump: OutputPumpConfig,
    /// 终止请求之后、强制结束之前的等待时间
    pub close_grace: Duration,
}

impl RegistryConfig {
    pub fn new(shell: ShellCommand) -> Self {
        Self {
            shell,
            max_sessions_per_owner: DEFAULT_MAX_SESSIONS,
            pump: OutputPumpConfig::default(),
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

/// 会话注册表
pub struct SessionRegistry {
    backend: Arc<dyn PtyBackend>,
    config: RegistryConfig,
    sessions: Mutex<HashMap<SessionId, Arc<TerminalSession>>>,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn PtyBackend>, config: RegistryConfig) -> Arc<Self> {
        tracing::info!(
            "会话注册表已创建: 后端 {}, shell {}, 每连接上限 {}",
            backend.name(),
            config.shell.program,
            config.max_sessions_per_owner
        );
        Arc::new(Self {
            backend,
            config,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// 创建会话
    ///
    /// 生成新 ID、启动 shell、登记会话，然后启动输入写入线程和输出泵。
    /// 成功时 `session_created` 已经先于任何输出事件进入 `events`。
    pub fn create(
        self: &Arc<Self>,
        owner: &ConnectionId,
        events: EventSender,
        size: Option<TermSize>,
    ) -> Result<Arc<TerminalSession>, TerminalError> {
        self.check_limit(owner, &self.sessions.lock())?;

        let command = match size {
            Some(size) => self.config.shell.with_size(size),
            None => self.config.shell.clone(),
        };
        let SpawnedPty {
            process,
            writer,
            reader,
        } = self.backend.spawn(&command)?;

        let session = {
            let mut sessions = self.sessions.lock();

            // spawn 期间同一连接可能已经创建了其他会话
            if let Err(e) = self.check_limit(owner, &sessions) {
                drop(sessions);
                drop(writer);
                drop(reader);
                let session = TerminalSession::new(
                    SessionId::generate(),
                    owner.clone(),
                    &command.program,
                    process,
                );
                session.request_close("超出会话上限");
                session.finish(Duration::ZERO);
                return Err(e);
            }

            let id = loop {
                let id = SessionId::generate();
                if !sessions.contains_key(&id) {
                    break id;
                }
            };

            let session = Arc::new(TerminalSession::new(
                id.clone(),
                owner.clone(),
                &command.program,
                process,
            ));
            sessions.insert(id, session.clone());
            session
        };

        let id = session.id().clone();

        match start_input_writer(&id, writer) {
            Ok(input) => session.attach_input(input),
            Err(e) => {
                tracing::error!("启动输入写入线程失败: {} ({})", id, e);
                self.deregister(&id);
                session.request_close("输入写入线程启动失败");
                session.finish(Duration::ZERO);
                return Err(TerminalError::spawn_failed(&command.program, e));
            }
        }

        let _ = events.send_created(&id);

        let pump_session = session.clone();
        let pump_events = events.clone();
        let registry = Arc::downgrade(self);
        let grace = self.config.close_grace;

        let started = start_output_pump(
            id.clone(),
            reader,
            events.clone(),
            self.config.pump.clone(),
            move |exit| on_pump_exit(registry, pump_session, pump_events, grace, exit),
        );

        match started {
            Ok(handle) => {
                session.attach_pump(handle);
                tracing::info!(
                    "创建会话: {} (owner {}, pid {:?})",
                    id,
                    owner.short(),
                    session.info().pid
                );
                Ok(session)
            }
            Err(e) => {
                tracing::error!("启动输出泵失败: {} ({})", id, e);
                self.deregister(&id);
                session.request_close("输出泵启动失败");
                session.finish(Duration::ZERO);
                let _ = events.send_closed(&id);
                Err(TerminalError::spawn_failed(&command.program, e))
            }
        }
    }

    fn check_limit(
        &self,
        owner: &ConnectionId,
        sessions: &HashMap<SessionId, Arc<TerminalSession>>,
    ) -> Result<(), TerminalError> {
        let limit = self.config.max_sessions_per_owner;
        if limit == 0 {
            return Ok(());
        }
        let owned = sessions.values().filter(|s| s.is_owned_by(owner)).count();
        if owned >= limit {
            tracing::info!("连接 {} 的会话数量已达上限 {}", owner.short(), limit);
            return Err(TerminalError::SessionLimitReached { limit });
        }
        Ok(())
    }

    /// 查找属于 `owner` 的会话
    ///
    /// 会话不存在与属于其他连接的结果相同。
    pub fn lookup(&self, id: &SessionId, owner: &ConnectionId) -> Option<Arc<TerminalSession>> {
        self.sessions
            .lock()
            .get(id)
            .filter(|s| s.is_owned_by(owner))
            .cloned()
    }

    /// 关闭会话
    ///
    /// 从表中移除后请求进程退出并停止输出泵；未知 ID 是无操作，返回 false。
    pub fn close(&self, id: &SessionId) -> bool {
        let removed = self.sessions.lock().remove(id);
        match removed {
            Some(session) => {
                tracing::info!("关闭会话: {} (owner {})", id, session.owner().short());
                session.request_close("已请求关闭");
                true
            }
            None => false,
        }
    }

    /// 仅当会话属于 `owner` 时关闭
    pub fn close_owned(&self, id: &SessionId, owner: &ConnectionId) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock();
            let owned = sessions.get(id).is_some_and(|s| s.is_owned_by(owner));
            if owned {
                sessions.remove(id)
            } else {
                None
            }
        };
        match removed {
            Some(session) => {
                tracing::info!("关闭会话: {} (owner {})", id, owner.short());
                session.request_close("已请求关闭");
                true
            }
            None => false,
        }
    }

    /// 关闭某个连接的全部会话
    ///
    /// 不等待进程退出；各会话的输出泵负责最终回收。
    pub fn close_all_owned_by(&self, owner: &ConnectionId) -> usize {
        let removed: Vec<Arc<TerminalSession>> = {
            let mut sessions = self.sessions.lock();
            let ids: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, s)| s.is_owned_by(owner))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for session in &removed {
            session.request_close("连接已断开");
        }

        if !removed.is_empty() {
            tracing::info!("连接 {} 断开，关闭 {} 个会话", owner.short(), removed.len());
        }
        removed.len()
    }

    /// 关闭全部会话（服务退出时使用）
    ///
    /// 返回被关闭的会话，调用方可以等待它们进入 Closed。
    pub fn close_all(&self) -> Vec<Arc<TerminalSession>> {
        let removed: Vec<Arc<TerminalSession>> =
            self.sessions.lock().drain().map(|(_, s)| s).collect();

        for session in &removed {
            session.request_close("服务关闭");
        }
        if !removed.is_empty() {
            tracing::info!("服务关闭，关闭 {} 个会话", removed.len());
        }
        removed
    }

    /// 某个连接的会话列表，按创建时间排序
    pub fn sessions_owned_by(&self, owner: &ConnectionId) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .lock()
            .values()
            .filter(|s| s.is_owned_by(owner))
            .map(|s| s.info())
            .collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// 从表中移除（不触发关闭）
    fn deregister(&self, id: &SessionId) -> bool {
        self.sessions.lock().remove(id).is_some()
    }
}

/// 输出泵退出后的清理
///
/// 由泵自身发起的关闭（EOF 或读取错误）会通知所属连接 `session_ended`；
/// 显式关闭已经回复过 `session_closed`，不再重复通知。
fn on_pump_exit(
    registry: Weak<SessionRegistry>,
    session: Arc<TerminalSession>,
    events: EventSender,
    grace: Duration,
    exit: PumpExit,
) {
    let initiated = session.request_close(exit.reason());

    if let Some(registry) = registry.upgrade() {
        registry.deregister(session.id());
    }

    let exit_code = session.finish(grace);

    tracing::info!(
        "会话结束: {} (owner {}, exit code {:?}, {})",
        session.id(),
        session.owner().short(),
        exit_code,
        exit.reason()
    );

    if initiated {
        let _ = events.send_ended(session.id(), exit_code);
    }
}
