//! Shell 检测
//!
//! 根据配置和环境变量确定要启动的 shell。

use std::env;

/// 检测系统默认 shell
pub fn detect_default_shell() -> String {
    #[cfg(unix)]
    {
        // Unix: 使用 SHELL 环境变量
        env::var("SHELL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }

    #[cfg(windows)]
    {
        // Windows: 使用 COMSPEC 环境变量
        env::var("COMSPEC")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "cmd.exe".to_string())
    }
}

/// 解析最终使用的 shell
///
/// 显式配置优先，空字符串视为未配置。
pub fn resolve_shell(configured: Option<&str>) -> String {
    configured
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(detect_default_shell)
}
