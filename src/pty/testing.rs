//! 测试用的脚本化后端
//!
//! 内存中模拟子进程：输入回显为输出，可以由测试主动推送输出或让进程退出。
//! 进程句柄、写入端和读取端都计入存活句柄数，用于检查资源泄漏。

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::backend::{PtyBackend, PtyProcess, ShellCommand, SpawnedPty, Termination};
use super::types::TermSize;
use crate::utils::error::TerminalError;

/// 等待条件成立
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[derive(Debug, Default)]
struct FakeChild {
    input: Vec<u8>,
    exit_code: Option<i32>,
    terminate_calls: usize,
    kill_calls: usize,
    ignore_terminate: bool,
    block_input: bool,
    size: Option<TermSize>,
    output: Option<Sender<Vec<u8>>>,
}

impl FakeChild {
    fn exit(&mut self, code: i32) {
        if self.exit_code.is_none() {
            self.exit_code = Some(code);
        }
        // 丢弃输出端，读取端随之 EOF
        self.output = None;
    }
}

/// 测试侧对模拟进程的控制句柄
#[derive(Clone)]
pub struct FakeProbe {
    child: Arc<Mutex<FakeChild>>,
}

impl FakeProbe {
    /// 模拟子进程输出
    pub fn emit(&self, data: &[u8]) {
        if let Some(tx) = &self.child.lock().output {
            let _ = tx.send(data.to_vec());
        }
    }

    /// 模拟子进程自行退出
    pub fn exit(&self, code: i32) {
        self.child.lock().exit(code);
    }

    /// 子进程收到的全部输入
    pub fn input(&self) -> Vec<u8> {
        self.child.lock().input.clone()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.child.lock().exit_code
    }

    pub fn terminate_calls(&self) -> usize {
        self.child.lock().terminate_calls
    }

    pub fn kill_calls(&self) -> usize {
        self.child.lock().kill_calls
    }

    pub fn size(&self) -> Option<TermSize> {
        self.child.lock().size
    }
}

/// 脚本化后端
#[derive(Default)]
pub struct FakeBackend {
    live: Arc<AtomicUsize>,
    fail_spawn: AtomicBool,
    ignore_terminate: AtomicBool,
    block_input: AtomicBool,
    probes: Mutex<Vec<FakeProbe>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 尚未释放的进程句柄、写入端与读取端数量
    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn spawn_count(&self) -> usize {
        self.probes.lock().len()
    }

    /// 之后的 spawn 全部失败
    pub fn set_fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    /// 之后启动的进程忽略正常终止请求
    pub fn set_ignore_terminate(&self, ignore: bool) {
        self.ignore_terminate.store(ignore, Ordering::SeqCst);
    }

    /// 之后启动的进程不读取输入：写入一直阻塞到进程退出
    pub fn set_block_input(&self, block: bool) {
        self.block_input.store(block, Ordering::SeqCst);
    }

    pub fn last_probe(&self) -> Option<FakeProbe> {
        self.probes.lock().last().cloned()
    }
}

impl PtyBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn spawn(&self, command: &ShellCommand) -> Result<SpawnedPty, TerminalError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(TerminalError::spawn_failed(&command.program, "scripted failure"));
        }

        let (tx, rx) = mpsc::channel();
        let child = Arc::new(Mutex::new(FakeChild {
            ignore_terminate: self.ignore_terminate.load(Ordering::SeqCst),
            block_input: self.block_input.load(Ordering::SeqCst),
            size: Some(command.size),
            output: Some(tx),
            ..FakeChild::default()
        }));
        self.probes.lock().push(FakeProbe {
            child: child.clone(),
        });

        self.live.fetch_add(3, Ordering::SeqCst);
        Ok(SpawnedPty {
            process: Box::new(FakeProcess {
                child: child.clone(),
                live: self.live.clone(),
            }),
            writer: Box::new(FakeWriter {
                child,
                live: self.live.clone(),
            }),
            reader: Box::new(FakeReader {
                rx,
                pending: Vec::new(),
                live: self.live.clone(),
            }),
        })
    }
}

struct FakeProcess {
    child: Arc<Mutex<FakeChild>>,
    live: Arc<AtomicUsize>,
}

impl PtyProcess for FakeProcess {
    fn resize(&mut self, size: TermSize) -> Result<(), TerminalError> {
        self.child.lock().size = Some(size);
        Ok(())
    }

    fn terminate(&mut self) -> Result<Termination, TerminalError> {
        let mut child = self.child.lock();
        if child.exit_code.is_some() {
            return Ok(Termination::AlreadyExited);
        }
        child.terminate_calls += 1;
        if !child.ignore_terminate {
            child.exit(129);
        }
        Ok(Termination::Requested)
    }

    fn kill(&mut self) -> Result<Termination, TerminalError> {
        let mut child = self.child.lock();
        if child.exit_code.is_some() {
            return Ok(Termination::AlreadyExited);
        }
        child.kill_calls += 1;
        child.exit(137);
        Ok(Termination::Requested)
    }

    fn try_wait(&mut self) -> Result<Option<i32>, TerminalError> {
        Ok(self.child.lock().exit_code)
    }

    fn wait(&mut self) -> Result<i32, TerminalError> {
        loop {
            if let Some(code) = self.child.lock().exit_code {
                return Ok(code);
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn process_id(&self) -> Option<u32> {
        None
    }
}

impl Drop for FakeProcess {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 输入写入端
///
/// 进程退出后写入返回 EPIPE，和 slave 已关闭的 pty 一样。
struct FakeWriter {
    child: Arc<Mutex<FakeChild>>,
    live: Arc<AtomicUsize>,
}

impl Write for FakeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let mut child = self.child.lock();
            if child.exit_code.is_some() {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            if child.block_input {
                // 输入缓冲区已满，等进程退出
                drop(child);
                thread::sleep(Duration::from_millis(5));
                continue;
            }
            child.input.extend_from_slice(buf);
            // 终端回显
            if let Some(tx) = &child.output {
                let _ = tx.send(buf.to_vec());
            }
            return Ok(buf.len());
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for FakeWriter {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 以短超时轮询的读取端
struct FakeReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    live: Arc<AtomicUsize>,
}

impl Read for FakeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(Duration::from_millis(20)) {
                Ok(data) if data.is_empty() => return Err(io::ErrorKind::WouldBlock.into()),
                Ok(data) => self.pending = data,
                Err(RecvTimeoutError::Timeout) => return Err(io::ErrorKind::WouldBlock.into()),
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

impl Drop for FakeReader {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
