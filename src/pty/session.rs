//! 终端会话
//!
//! 一个 shell 子进程、它的 pty 句柄、所属连接和会话 ID 的聚合。
//! 进程句柄由会话独占；状态机决定哪些操作仍然允许。
//! 输入经由专用写入线程送达，进程锁从不在写入期间持有。

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::backend::{PtyProcess, Termination};
use super::input::InputWriter;
use super::output::OutputPumpHandle;
use super::types::{ConnectionId, SessionId, SessionInfo, SessionState, TermSize};
use crate::utils::error::TerminalError;
use crate::utils::state::SessionStateManager;

/// 回收子进程时的轮询间隔
const REAP_INTERVAL: Duration = Duration::from_millis(20);

/// 终端会话
pub struct TerminalSession {
    id: SessionId,
    owner: ConnectionId,
    shell: String,
    pid: Option<u32>,
    created_at: DateTime<Utc>,
    state: Mutex<SessionStateManager>,
    /// 回收后为 None
    process: Mutex<Option<Box<dyn PtyProcess>>>,
    input: Mutex<Option<InputWriter>>,
    pump: Mutex<Option<OutputPumpHandle>>,
}

impl fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TerminalSession {
    pub fn new(
        id: SessionId,
        owner: ConnectionId,
        shell: impl Into<String>,
        process: Box<dyn PtyProcess>,
    ) -> Self {
        Self {
            state: Mutex::new(SessionStateManager::new(id.as_str())),
            pid: process.process_id(),
            id,
            owner,
            shell: shell.into(),
            created_at: Utc::now(),
            process: Mutex::new(Some(process)),
            input: Mutex::new(None),
            pump: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn owner(&self) -> &ConnectionId {
        &self.owner
    }

    pub fn is_owned_by(&self, owner: &ConnectionId) -> bool {
        &self.owner == owner
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().state()
    }

    /// 会话信息快照
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            shell: self.shell.clone(),
            state: self.state(),
            pid: self.pid,
            created_at: self.created_at,
        }
    }

    /// 挂上输出泵并进入 Running
    ///
    /// 会话在此之前已经开始关闭时，立即向泵发出停止信号。
    pub fn attach_pump(&self, handle: OutputPumpHandle) {
        let mut state = self.state.lock();
        if state.is_closing() {
            handle.stop();
        } else {
            state.transition_to(SessionState::Running);
        }
        *self.pump.lock() = Some(handle);
    }

    /// 挂上输入写入线程
    pub fn attach_input(&self, input: InputWriter) {
        *self.input.lock() = Some(input);
    }

    /// 排队输入，不等待写入完成
    ///
    /// 会话已开始关闭或写入线程已退出时返回 `SessionClosed`。
    pub fn write(&self, data: &[u8]) -> Result<(), TerminalError> {
        self.ensure_accepts_input()?;
        match self.input.lock().as_ref() {
            Some(input) => input.send(data),
            None => Err(TerminalError::session_closed(&self.id)),
        }
    }

    /// 调整终端尺寸
    pub fn resize(&self, size: TermSize) -> Result<(), TerminalError> {
        self.ensure_accepts_input()?;
        match self.process.lock().as_mut() {
            Some(process) => process.resize(size),
            None => Err(TerminalError::session_closed(&self.id)),
        }
    }

    fn ensure_accepts_input(&self) -> Result<(), TerminalError> {
        if self.state.lock().accepts_input() {
            Ok(())
        } else {
            Err(TerminalError::session_closed(&self.id))
        }
    }

    /// 请求关闭：进入 Closing，通知输出泵停止，并请求进程退出
    ///
    /// 只有第一次调用生效并返回 true，之后的调用都是无操作。
    /// 不等待进程退出，最终回收由 [`finish`](Self::finish) 完成。
    pub fn request_close(&self, reason: &str) -> bool {
        if !self.state.lock().begin_closing(reason).is_success() {
            return false;
        }

        if let Some(pump) = self.pump.lock().as_ref() {
            pump.stop();
        }
        // 关闭输入通道；卡在写入中的线程在进程退出后报错退出
        drop(self.input.lock().take());

        let mut process = self.process.lock();
        let Some(process) = process.as_mut() else {
            return true;
        };

        match process.terminate() {
            Ok(Termination::Requested) => {
                tracing::debug!("已请求会话进程退出: {} ({})", self.id, reason);
            }
            Ok(Termination::AlreadyExited) => {
                tracing::debug!("会话进程已经退出: {}", self.id);
            }
            Err(e) => {
                tracing::warn!("终止会话进程失败，改为强制结束: {} ({})", self.id, e);
                if let Err(e) = process.kill() {
                    tracing::warn!("强制结束会话进程失败: {} ({})", self.id, e);
                }
            }
        }
        true
    }

    /// 回收子进程并释放 pty 资源，进入 Closed
    ///
    /// 进程在 `grace` 内没有退出时强制结束。重复调用返回 None。
    pub fn finish(&self, grace: Duration) -> Option<i32> {
        let deadline = Instant::now() + grace;

        let exit_code = loop {
            let status = match self.process.lock().as_mut() {
                Some(process) => process.try_wait(),
                None => return None,
            };

            match status {
                Ok(Some(code)) => break Some(code),
                Ok(None) if Instant::now() < deadline => thread::sleep(REAP_INTERVAL),
                Ok(None) => {
                    tracing::info!("会话进程未在 {:?} 内退出，强制结束: {}", grace, self.id);
                    break self.force_kill();
                }
                Err(e) => {
                    tracing::warn!("检查会话进程状态失败: {} ({})", self.id, e);
                    break self.force_kill();
                }
            }
        };

        // 释放进程句柄和 pty
        drop(self.process.lock().take());
        drop(self.input.lock().take());
        self.pump.lock().take();

        let mut state = self.state.lock();
        state.begin_closing("回收");
        state.transition_to(SessionState::Closed);

        exit_code
    }

    fn force_kill(&self) -> Option<i32> {
        let mut process = self.process.lock();
        let process = process.as_mut()?;

        if let Err(e) = process.kill() {
            tracing::warn!("强制结束会话进程失败: {} ({})", self.id, e);
        }
        match process.wait() {
            Ok(code) => Some(code),
            Err(e) => {
                tracing::warn!("回收会话进程失败: {} ({})", self.id, e);
                None
            }
        }
    }
}
