//! PTY 输出泵
//!
//! 每个会话一个专用线程，持续读取 pty 输出并推送给所属连接。
//! 读取到 EOF 或出错时退出并交给退出回调完成清理，泵不会重启。
//! 外部通过 [`OutputPumpHandle::stop`] 发出停止信号。

use std::io::{self, Read};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use super::types::SessionId;
use crate::gateway::events::EventSender;

/// 输出编码
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum OutputEncoding {
    /// 按 UTF-8 解码，非法字节替换为 U+FFFD
    #[default]
    Utf8,
    /// 原始字节的 base64
    Base64,
}

/// 输出泵配置
#[derive(Debug, Clone)]
pub struct OutputPumpConfig {
    /// 读取缓冲区大小
    pub buffer_size: usize,
    /// 输出编码
    pub encoding: OutputEncoding,
}

impl Default for OutputPumpConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            encoding: OutputEncoding::Utf8,
        }
    }
}

/// 流式 UTF-8 解码器
///
/// 跨读取边界被截断的多字节字符保留到下一次解码，
/// 非法序列替换为 U+FFFD，不会失败。
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解码一段输出
    pub fn decode(&mut self, data: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(data);

        let mut out = String::with_capacity(input.len());
        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + len..];
                        }
                        None => {
                            // 末尾是不完整的字符，等待后续字节
                            self.pending = rest[valid..].to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// 流结束时输出剩余字节
    pub fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }
}

/// 按配置编码输出块
#[derive(Debug)]
enum OutputEncoder {
    Utf8(Utf8Decoder),
    Base64,
}

impl OutputEncoder {
    fn new(encoding: OutputEncoding) -> Self {
        match encoding {
            OutputEncoding::Utf8 => OutputEncoder::Utf8(Utf8Decoder::new()),
            OutputEncoding::Base64 => OutputEncoder::Base64,
        }
    }

    fn encode(&mut self, data: &[u8]) -> Option<String> {
        let encoded = match self {
            OutputEncoder::Utf8(decoder) => decoder.decode(data),
            OutputEncoder::Base64 => base64::engine::general_purpose::STANDARD.encode(data),
        };
        (!encoded.is_empty()).then_some(encoded)
    }

    fn finish(&mut self) -> Option<String> {
        match self {
            OutputEncoder::Utf8(decoder) => Some(decoder.finish()).filter(|s| !s.is_empty()),
            OutputEncoder::Base64 => None,
        }
    }
}

/// 输出泵退出原因
#[derive(Debug)]
pub enum PumpExit {
    /// 子进程退出或描述符已关闭
    Eof,
    /// 读取失败
    Failed(io::Error),
    /// 收到停止信号
    Stopped,
}

impl PumpExit {
    pub fn reason(&self) -> &'static str {
        match self {
            PumpExit::Eof => "进程已退出",
            PumpExit::Failed(_) => "读取输出失败",
            PumpExit::Stopped => "已请求关闭",
        }
    }
}

/// 输出泵句柄
pub struct OutputPumpHandle {
    /// 停止信号发送器
    stop_tx: mpsc::Sender<()>,
    /// 线程句柄
    thread: JoinHandle<()>,
}

impl OutputPumpHandle {
    /// 发出停止信号，不等待线程退出
    ///
    /// 阻塞读取的平台上，泵要等到读取返回才能看到信号。
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// 检查线程是否已退出
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// 等待线程退出
    pub fn join(self) -> thread::Result<()> {
        self.thread.join()
    }
}

/// 启动输出泵
///
/// 在专用线程中读取 `reader`，数据以 `output` 事件推送给 `events`。
/// 连接已断开时推送被静默丢弃。循环结束后先释放读取端，再调用 `on_exit`。
pub fn start_output_pump<F>(
    session_id: SessionId,
    reader: Box<dyn Read + Send>,
    events: EventSender,
    config: OutputPumpConfig,
    on_exit: F,
) -> io::Result<OutputPumpHandle>
where
    F: FnOnce(PumpExit) + Send + 'static,
{
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let name = format!("pty-pump-{}", session_id.short());

    let thread = thread::Builder::new().name(name).spawn(move || {
        let exit = run_pump(&session_id, reader, &events, &config, &mut stop_rx);
        match &exit {
            PumpExit::Failed(e) => tracing::warn!("读取 PTY 输出错误: {} ({})", session_id, e),
            other => tracing::debug!("输出泵退出: {} ({})", session_id, other.reason()),
        }
        on_exit(exit);
    })?;

    Ok(OutputPumpHandle { stop_tx, thread })
}

fn run_pump(
    session_id: &SessionId,
    mut reader: Box<dyn Read + Send>,
    events: &EventSender,
    config: &OutputPumpConfig,
    stop_rx: &mut mpsc::Receiver<()>,
) -> PumpExit {
    let mut buffer = vec![0u8; config.buffer_size.max(1)];
    let mut encoder = OutputEncoder::new(config.encoding);

    let forward = |data: String| {
        if events.send_output(session_id, data, config.encoding).is_err() {
            tracing::trace!("连接已断开，丢弃输出: {}", session_id);
        }
    };

    let exit = loop {
        // 检查是否收到停止信号（句柄被丢弃同样视为停止）
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break PumpExit::Stopped,
            Err(TryRecvError::Empty) => {}
        }

        match reader.read(&mut buffer) {
            Ok(0) => break PumpExit::Eof,
            Ok(n) => {
                tracing::trace!("读取 PTY 输出: {} {} bytes", session_id, n);
                if let Some(data) = encoder.encode(&buffer[..n]) {
                    forward(data);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break PumpExit::Failed(e),
        }
    };

    if !matches!(exit, PumpExit::Stopped) {
        if let Some(tail) = encoder.finish() {
            forward(tail);
        }
    }

    exit
}
