//! POSIX PTY 后端
//!
//! pty 分配 + fork/exec 子进程，标准流重定向到 slave 端。
//! 终止使用 SIGHUP（与终端挂断语义一致），读取端使用短轮询，
//! 输出泵因此可以在两次轮询之间响应停止信号。

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::unix::UnixPtySystem;

use super::backend::{PtyBackend, PtyProcess, ShellCommand, SpawnedPty, Termination};
use super::local::LocalPty;
use super::types::TermSize;
use crate::utils::error::TerminalError;

/// POSIX 后端
#[derive(Debug, Clone)]
pub struct PosixPtyBackend {
    poll_interval: Duration,
}

impl PosixPtyBackend {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl PtyBackend for PosixPtyBackend {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn spawn(&self, command: &ShellCommand) -> Result<SpawnedPty, TerminalError> {
        let system = UnixPtySystem::default();
        let mut pty = LocalPty::open(&system, command)?;

        let handles = PollingReader::from_pty(&pty, self.poll_interval)
            .map_err(|e| TerminalError::spawn_failed(&command.program, e))
            .and_then(|reader| Ok((reader, pty.take_writer()?)));
        let (reader, writer) = match handles {
            Ok(handles) => handles,
            Err(e) => {
                // 读写端建立失败时不能留下子进程
                let _ = pty.kill();
                let _ = pty.wait();
                return Err(e);
            }
        };

        tracing::debug!(
            "POSIX pty 已启动: {} (pid {:?})",
            command.program,
            pty.process_id()
        );

        Ok(SpawnedPty {
            process: Box::new(PosixProcess { pty }),
            writer,
            reader: Box::new(reader),
        })
    }
}

/// POSIX 子进程句柄
struct PosixProcess {
    pty: LocalPty,
}

impl PtyProcess for PosixProcess {
    fn resize(&mut self, size: TermSize) -> Result<(), TerminalError> {
        self.pty.resize(size)
    }

    fn terminate(&mut self) -> Result<Termination, TerminalError> {
        if self.pty.try_wait()?.is_some() {
            return Ok(Termination::AlreadyExited);
        }

        let Some(pid) = self.pty.process_id() else {
            return self.pty.kill();
        };

        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGHUP) {
            Ok(()) => Ok(Termination::Requested),
            Err(Errno::ESRCH) => Ok(Termination::AlreadyExited),
            Err(e) => Err(TerminalError::IoError(io::Error::from(e))),
        }
    }

    fn kill(&mut self) -> Result<Termination, TerminalError> {
        self.pty.kill()
    }

    fn try_wait(&mut self) -> Result<Option<i32>, TerminalError> {
        self.pty.try_wait()
    }

    fn wait(&mut self) -> Result<i32, TerminalError> {
        self.pty.wait()
    }

    fn process_id(&self) -> Option<u32> {
        self.pty.process_id()
    }
}

/// 短轮询读取器
///
/// 持有 master 描述符的独立副本；超时返回 `WouldBlock`，
/// slave 端全部关闭后（Linux 上表现为 EIO）返回 0。
pub struct PollingReader {
    file: File,
    poll_interval: Duration,
}

impl PollingReader {
    fn from_pty(pty: &LocalPty, poll_interval: Duration) -> io::Result<Self> {
        let fd = pty
            .master_fd()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "pty master 没有可用的描述符"))?;

        // SAFETY: fd 属于 pty 持有的 master，在本函数返回前一直有效；
        // try_clone_to_owned 会 dup 出独立的描述符。
        let owned = unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned()?;

        Ok(Self {
            file: File::from(owned),
            poll_interval,
        })
    }

    fn poll_timeout(&self) -> PollTimeout {
        let millis = u16::try_from(self.poll_interval.as_millis()).unwrap_or(u16::MAX);
        PollTimeout::from(millis)
    }
}

impl Read for PollingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, self.poll_timeout()) {
                Ok(0) => return Err(io::ErrorKind::WouldBlock.into()),
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            }

            match self.file.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => return Ok(0),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
