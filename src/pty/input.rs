//! 输入写入线程
//!
//! 每个会话一个专用线程，按接收顺序把输入写进 pty。
//! 子进程不读 stdin 时 pty 输入缓冲区会被写满，写入随之阻塞；
//! 阻塞只发生在这个线程里，连接处理和关闭流程都不会被卡住。
//! 子进程退出后写入报错，线程自行结束。

use std::io::{self, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use super::types::SessionId;
use crate::utils::error::TerminalError;

/// 单次写入的最大块大小
const WRITE_CHUNK_SIZE: usize = 512;

/// 输入写入线程的句柄
///
/// 丢弃句柄即关闭输入通道；线程写完手上的数据（或写入失败）后退出。
pub struct InputWriter {
    tx: Sender<Vec<u8>>,
    thread: JoinHandle<()>,
}

impl InputWriter {
    /// 排队一段输入，不等待写入完成
    ///
    /// 写入线程已经退出时返回 `SessionClosed`。
    pub fn send(&self, data: &[u8]) -> Result<(), TerminalError> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| TerminalError::session_closed("pty 输入已关闭"))
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// 启动会话的输入写入线程
pub fn start_input_writer(
    session_id: &SessionId,
    writer: Box<dyn Write + Send>,
) -> io::Result<InputWriter> {
    let (tx, rx) = mpsc::channel();
    let id = session_id.clone();
    let thread = thread::Builder::new()
        .name(format!("pty-input-{}", session_id.short()))
        .spawn(move || write_loop(id, writer, rx))?;

    Ok(InputWriter { tx, thread })
}

fn write_loop(session_id: SessionId, mut writer: Box<dyn Write + Send>, rx: Receiver<Vec<u8>>) {
    let mut total = 0usize;

    while let Ok(data) = rx.recv() {
        for chunk in data.chunks(WRITE_CHUNK_SIZE) {
            if let Err(e) = writer.write_all(chunk).and_then(|_| writer.flush()) {
                let err = TerminalError::write_failed(e);
                if err.is_already_gone() {
                    tracing::debug!("会话 {} 的 pty 已关闭，停止写入输入", session_id);
                } else {
                    tracing::warn!("写入会话输入失败: {} ({})", session_id, err);
                }
                return;
            }
        }
        total += data.len();
        tracing::trace!("会话 {} 写入输入: {} bytes", session_id, data.len());
    }

    tracing::debug!("会话 {} 输入通道已关闭，共写入 {} bytes", session_id, total);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::testing::wait_until;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    /// 把写入记录到共享缓冲区，可以设置为第 n 次写入起失败
    struct RecordingWriter {
        written: Arc<Mutex<Vec<u8>>>,
        writes: Arc<Mutex<Vec<usize>>>,
        fail_after: Option<usize>,
    }

    impl Write for RecordingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut writes = self.writes.lock();
            if self.fail_after.is_some_and(|n| writes.len() >= n) {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            writes.push(buf.len());
            self.written.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn recording(fail_after: Option<usize>) -> (RecordingWriter, Arc<Mutex<Vec<u8>>>, Arc<Mutex<Vec<usize>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let writes = Arc::new(Mutex::new(Vec::new()));
        let writer = RecordingWriter {
            written: written.clone(),
            writes: writes.clone(),
            fail_after,
        };
        (writer, written, writes)
    }

    #[test]
    fn test_input_written_in_order() {
        let (writer, written, _) = recording(None);
        let input = start_input_writer(&SessionId::from("s1"), Box::new(writer)).unwrap();

        for part in ["echo ", "hello", "\n"] {
            input.send(part.as_bytes()).unwrap();
        }
        assert!(wait_until(WAIT, || written.lock().as_slice() == b"echo hello\n"));
    }

    #[test]
    fn test_large_input_split_into_chunks() {
        let (writer, written, writes) = recording(None);
        let input = start_input_writer(&SessionId::from("s1"), Box::new(writer)).unwrap();

        let payload = vec![b'x'; WRITE_CHUNK_SIZE * 3 + 7];
        input.send(&payload).unwrap();

        assert!(wait_until(WAIT, || written.lock().len() == payload.len()));
        assert!(writes.lock().iter().all(|&n| n <= WRITE_CHUNK_SIZE));
    }

    #[test]
    fn test_write_failure_stops_thread_and_rejects_input() {
        let (writer, _, _) = recording(Some(0));
        let input = start_input_writer(&SessionId::from("s1"), Box::new(writer)).unwrap();

        input.send(b"ls\n").unwrap();
        assert!(wait_until(WAIT, || input.is_finished()));

        let err = input.send(b"more").unwrap_err();
        assert!(err.is_already_gone());
    }
}
