//! PTY 后端抽象
//!
//! 统一的能力集合：spawn / read / write / resize / terminate。
//! 两个实现：
//! - [`PosixPtyBackend`](super::posix::PosixPtyBackend)：pty + fork/exec（Unix）
//! - [`ConPtyBackend`](super::conpty::ConPtyBackend)：Windows 伪控制台
//!
//! 平台在启动时通过 [`native_backend`] 选定，上层代码不按平台分支。

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use super::types::TermSize;
use crate::utils::error::TerminalError;

/// 要在 pty 中启动的 shell 命令
#[derive(Debug, Clone, PartialEq)]
pub struct ShellCommand {
    /// shell 可执行文件
    pub program: String,
    /// 参数
    pub args: Vec<String>,
    /// 工作目录
    pub cwd: Option<String>,
    /// 额外的环境变量
    pub env: HashMap<String, String>,
    /// 初始终端尺寸
    pub size: TermSize,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            size: TermSize::default(),
        }
    }

    /// 以指定尺寸复制一份命令
    pub fn with_size(&self, size: TermSize) -> Self {
        Self {
            size,
            ..self.clone()
        }
    }
}

/// 终止请求的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// 已发出终止请求，进程可能还未退出
    Requested,
    /// 进程在请求之前已经退出
    AlreadyExited,
}

/// 已启动的子进程及其 pty 控制句柄
///
/// 会话独占该句柄；调整大小和终止经由它完成。写入端单独交出，
/// 因此终止和回收不会等待一次卡住的写入。
pub trait PtyProcess: Send {
    /// 调整 pty 大小
    fn resize(&mut self, size: TermSize) -> Result<(), TerminalError>;

    /// 请求进程正常退出
    ///
    /// 进程已退出时返回 `Termination::AlreadyExited`，不视为错误。
    fn terminate(&mut self) -> Result<Termination, TerminalError>;

    /// 强制结束进程
    fn kill(&mut self) -> Result<Termination, TerminalError>;

    /// 非阻塞地检查进程是否已退出，返回退出码
    fn try_wait(&mut self) -> Result<Option<i32>, TerminalError>;

    /// 阻塞等待进程退出（仅在 `kill` 之后调用）
    fn wait(&mut self) -> Result<i32, TerminalError>;

    /// 子进程 PID
    fn process_id(&self) -> Option<u32>;
}

/// spawn 的结果
pub struct SpawnedPty {
    /// 进程与 pty 控制句柄
    pub process: Box<dyn PtyProcess>,
    /// pty 输入写端，只交给输入写入线程
    ///
    /// 子进程不读取输入时写入可能阻塞；描述符关闭后写入报错。
    pub writer: Box<dyn Write + Send>,
    /// pty 输出读取端，只交给输出泵
    ///
    /// 读取可能阻塞，也可能在短轮询超时后返回 `WouldBlock`。
    /// 返回 0 表示子进程已退出或描述符已关闭。
    pub reader: Box<dyn Read + Send>,
}

/// PTY 后端
pub trait PtyBackend: Send + Sync {
    /// 后端名称（用于日志）
    fn name(&self) -> &'static str;

    /// 分配 pty 并在其中启动 shell
    fn spawn(&self, command: &ShellCommand) -> Result<SpawnedPty, TerminalError>;
}

/// 读取端的短轮询间隔（仅对支持轮询的平台生效）
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 当前平台的后端
#[cfg(unix)]
pub fn native_backend() -> Arc<dyn PtyBackend> {
    Arc::new(super::posix::PosixPtyBackend::new(DEFAULT_POLL_INTERVAL))
}

/// 当前平台的后端
#[cfg(windows)]
pub fn native_backend() -> Arc<dyn PtyBackend> {
    Arc::new(super::conpty::ConPtyBackend::new())
}
