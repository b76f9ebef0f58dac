//! PTY 会话复用模块
//!
//! 负责伪终端的创建、会话登记、输出转发和关闭。
//!
//! - `backend`：平台无关的后端接口，`posix` / `conpty` 为两个实现
//! - `session`：单个终端会话
//! - `registry`：会话注册表
//! - `input`：每个会话一个的输入写入线程
//! - `output`：每个会话一个的输出泵

pub mod backend;
#[cfg(windows)]
pub mod conpty;
pub mod input;
pub mod local;
pub mod output;
#[cfg(unix)]
pub mod posix;
pub mod registry;
pub mod session;
#[cfg(test)]
pub mod testing;
pub mod types;

pub use backend::{native_backend, PtyBackend, PtyProcess, ShellCommand, SpawnedPty, Termination};
pub use input::{start_input_writer, InputWriter};
pub use output::{start_output_pump, OutputEncoding, OutputPumpConfig, OutputPumpHandle, PumpExit};
pub use registry::{RegistryConfig, SessionRegistry};
pub use session::TerminalSession;
pub use types::{ConnectionId, SessionId, SessionInfo, SessionState, TermSize};
