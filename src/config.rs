//! 命令行与环境变量配置

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::pty::backend::ShellCommand;
use crate::pty::output::{OutputEncoding, OutputPumpConfig};
use crate::pty::registry::RegistryConfig;
use crate::shell::resolve_shell;

/// glterm 配置
#[derive(Debug, Clone, Parser)]
#[command(name = "glterm", version, about = "浏览器终端会话复用服务")]
pub struct Config {
    /// 监听地址
    #[arg(long, env = "GLTERM_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// 监听端口
    #[arg(long, env = "GLTERM_PORT", default_value_t = 8080)]
    pub port: u16,

    /// 新会话启动的 shell（默认取 SHELL / COMSPEC）
    #[arg(long, env = "GLTERM_SHELL")]
    pub shell: Option<String>,

    /// 登录密钥文件（默认 <配置目录>/glterm/key.file）
    #[arg(long, env = "GLTERM_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// 密钥文件不存在时使用的登录密钥
    #[arg(long, env = "GLTERM_KEY", hide_env_values = true)]
    pub key: Option<String>,

    /// 每个连接的会话上限，0 表示不限制
    #[arg(long, env = "GLTERM_MAX_SESSIONS", default_value_t = 8)]
    pub max_sessions: usize,

    /// 输出编码
    #[arg(long, env = "GLTERM_OUTPUT_ENCODING", value_enum, default_value_t = OutputEncoding::Utf8)]
    pub output_encoding: OutputEncoding,

    /// 关闭会话后等待 shell 退出的毫秒数，超时强制结束
    #[arg(long, env = "GLTERM_CLOSE_GRACE_MS", default_value_t = 3000)]
    pub close_grace_ms: u64,

    /// 输出读取缓冲区大小
    #[arg(long, env = "GLTERM_READ_BUFFER", default_value_t = 4096)]
    pub read_buffer: usize,
}

impl Config {
    /// 监听地址
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 密钥文件路径
    pub fn key_file_path(&self) -> Option<PathBuf> {
        self.key_file
            .clone()
            .or_else(|| dirs::config_dir().map(|dir| dir.join("glterm").join("key.file")))
    }

    /// 新会话的 shell 命令
    pub fn shell_command(&self) -> ShellCommand {
        ShellCommand::new(resolve_shell(self.shell.as_deref()))
    }

    /// 注册表配置
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            shell: self.shell_command(),
            max_sessions_per_owner: self.max_sessions,
            pump: OutputPumpConfig {
                buffer_size: self.read_buffer.max(1),
                encoding: self.output_encoding,
            },
            close_grace: Duration::from_millis(self.close_grace_ms),
        }
    }
}
