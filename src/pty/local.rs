//! 本地 PTY 实现
//!
//! 使用 portable-pty 打开 pty 对并启动 shell，供 POSIX 与 ConPTY 两个后端共用。

use portable_pty::{CommandBuilder, MasterPty, PtySize, PtySystem};
use std::io::{Read, Write};

use super::backend::{ShellCommand, Termination};
use super::types::TermSize;
use crate::utils::error::TerminalError;

/// 本地 PTY 实例
pub struct LocalPty {
    /// PTY master（关闭后为 None）
    master: Option<Box<dyn MasterPty + Send>>,
    /// PTY writer（交给输入写入线程后为 None）
    writer: Option<Box<dyn Write + Send>>,
    /// 子进程
    child: Box<dyn portable_pty::Child + Send + Sync>,
    /// 已回收的退出码
    exit_code: Option<i32>,
}

impl LocalPty {
    /// 在给定的 pty 系统上创建 pty 并启动命令
    pub fn open(system: &dyn PtySystem, command: &ShellCommand) -> Result<Self, TerminalError> {
        let shell = command.program.as_str();

        // 创建 PTY pair
        let pair = system
            .openpty(to_pty_size(command.size))
            .map_err(|e| TerminalError::spawn_failed(shell, e))?;

        // 构建命令
        let mut cmd = CommandBuilder::new(shell);
        cmd.args(&command.args);

        if let Some(dir) = &command.cwd {
            cmd.cwd(dir);
        }

        // 设置 TERM 环境变量
        cmd.env("TERM", "xterm-256color");

        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        // 启动子进程
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TerminalError::spawn_failed(shell, e))?;

        // 父进程不再持有 slave，子进程退出后读取端才能收到 EOF
        drop(pair.slave);

        let writer = match pair.master.take_writer() {
            Ok(writer) => writer,
            Err(e) => {
                let mut child = child;
                let _ = child.kill();
                let _ = child.wait();
                return Err(TerminalError::spawn_failed(shell, e));
            }
        };

        Ok(Self {
            master: Some(pair.master),
            writer: Some(writer),
            child,
            exit_code: None,
        })
    }

    /// 获取 PTY reader
    pub fn try_clone_reader(&self) -> Result<Box<dyn Read + Send>, TerminalError> {
        self.master()?
            .try_clone_reader()
            .map_err(|e| TerminalError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
    }

    /// master 端的原始描述符
    #[cfg(unix)]
    pub fn master_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.master.as_ref().and_then(|m| m.as_raw_fd())
    }

    /// 关闭 master 端
    ///
    /// ConPTY 只有在伪控制台关闭后读取端才会收到 EOF。
    pub fn close_master(&mut self) {
        self.master = None;
    }

    fn master(&self) -> Result<&(dyn MasterPty + Send), TerminalError> {
        self.master
            .as_deref()
            .ok_or_else(|| TerminalError::session_closed("pty master 已关闭"))
    }

    /// 交出 PTY writer，只能取一次
    pub fn take_writer(&mut self) -> Result<Box<dyn Write + Send>, TerminalError> {
        self.writer
            .take()
            .ok_or_else(|| TerminalError::session_closed("pty writer 已被取走"))
    }

    /// 调整 PTY 大小
    pub fn resize(&self, term_size: TermSize) -> Result<(), TerminalError> {
        self.master()?
            .resize(to_pty_size(term_size))
            .map_err(|e| TerminalError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
    }

    /// 检查子进程是否已退出
    pub fn try_wait(&mut self) -> Result<Option<i32>, TerminalError> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }
        let status = self.child.try_wait()?;
        self.exit_code = status.map(|s| s.exit_code() as i32);
        Ok(self.exit_code)
    }

    /// 等待子进程退出
    pub fn wait(&mut self) -> Result<i32, TerminalError> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let status = self.child.wait()?;
        let code = status.exit_code() as i32;
        self.exit_code = Some(code);
        Ok(code)
    }

    /// 强制终止子进程
    ///
    /// 进程已经退出时返回 `AlreadyExited`。
    pub fn kill(&mut self) -> Result<Termination, TerminalError> {
        if self.try_wait()?.is_some() {
            return Ok(Termination::AlreadyExited);
        }

        match self.child.kill() {
            Ok(()) => Ok(Termination::Requested),
            // kill 与自然退出竞争：以退出状态为准
            Err(e) => match self.try_wait()? {
                Some(_) => Ok(Termination::AlreadyExited),
                None => Err(TerminalError::IoError(e)),
            },
        }
    }

    /// 子进程 PID
    pub fn process_id(&self) -> Option<u32> {
        self.child.process_id()
    }
}

fn to_pty_size(size: TermSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
