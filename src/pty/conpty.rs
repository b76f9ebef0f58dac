//! Windows ConPTY 后端
//!
//! 使用系统伪控制台启动 shell，读取端为阻塞读。
//! 伪控制台在子进程退出后不会自行关闭输出管道，
//! 因此每个会话带一个退出监视线程，进程退出后关闭伪控制台，读取端随之收到 EOF。

use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use portable_pty::win::conpty::ConPtySystem;

use super::backend::{PtyBackend, PtyProcess, ShellCommand, SpawnedPty, Termination};
use super::local::LocalPty;
use super::types::TermSize;
use crate::utils::error::TerminalError;

/// 退出监视的轮询间隔
const EXIT_WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// ConPTY 后端
#[derive(Debug, Clone, Default)]
pub struct ConPtyBackend;

impl ConPtyBackend {
    pub fn new() -> Self {
        Self
    }
}

impl PtyBackend for ConPtyBackend {
    fn name(&self) -> &'static str {
        "conpty"
    }

    fn spawn(&self, command: &ShellCommand) -> Result<SpawnedPty, TerminalError> {
        let system = ConPtySystem::default();
        let mut pty = LocalPty::open(&system, command)?;

        let handles = pty
            .try_clone_reader()
            .map_err(|e| TerminalError::spawn_failed(&command.program, e))
            .and_then(|reader| Ok((reader, pty.take_writer()?)));
        let (reader, writer) = match handles {
            Ok(handles) => handles,
            Err(e) => {
                let _ = pty.kill();
                let _ = pty.wait();
                return Err(e);
            }
        };

        let pid = pty.process_id();
        let pty = Arc::new(Mutex::new(pty));
        spawn_exit_watcher(Arc::downgrade(&pty), pid);

        tracing::debug!("ConPTY 已启动: {} (pid {:?})", command.program, pid);

        Ok(SpawnedPty {
            process: Box::new(ConPtyProcess { pty, pid }),
            writer,
            reader,
        })
    }
}

/// 进程退出后关闭伪控制台
///
/// 只持有弱引用；会话释放后线程自行退出。
fn spawn_exit_watcher(pty: Weak<Mutex<LocalPty>>, pid: Option<u32>) {
    let result = thread::Builder::new()
        .name(format!("conpty-watch-{}", pid.unwrap_or_default()))
        .spawn(move || loop {
            thread::sleep(EXIT_WATCH_INTERVAL);

            let Some(pty) = pty.upgrade() else {
                break;
            };
            let mut pty = pty.lock();
            match pty.try_wait() {
                Ok(Some(code)) => {
                    tracing::debug!("ConPTY 子进程已退出 (code {}), 关闭伪控制台", code);
                    pty.close_master();
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("检查 ConPTY 子进程状态失败: {}", e);
                    pty.close_master();
                    break;
                }
            }
        });

    if let Err(e) = result {
        tracing::error!("无法启动 ConPTY 退出监视线程: {}", e);
    }
}

/// ConPTY 子进程句柄
struct ConPtyProcess {
    pty: Arc<Mutex<LocalPty>>,
    pid: Option<u32>,
}

impl PtyProcess for ConPtyProcess {
    fn resize(&mut self, size: TermSize) -> Result<(), TerminalError> {
        self.pty.lock().resize(size)
    }

    /// Windows 没有挂断信号，直接结束进程
    fn terminate(&mut self) -> Result<Termination, TerminalError> {
        self.pty.lock().kill()
    }

    fn kill(&mut self) -> Result<Termination, TerminalError> {
        self.pty.lock().kill()
    }

    fn try_wait(&mut self) -> Result<Option<i32>, TerminalError> {
        self.pty.lock().try_wait()
    }

    fn wait(&mut self) -> Result<i32, TerminalError> {
        // 不能持锁阻塞，否则退出监视线程无法关闭伪控制台
        loop {
            if let Some(code) = self.pty.lock().try_wait()? {
                return Ok(code);
            }
            thread::sleep(EXIT_WATCH_INTERVAL);
        }
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }
}
