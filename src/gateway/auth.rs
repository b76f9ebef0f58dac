//! 登录密钥认证
//!
//! 密钥来自密钥文件（去掉首尾空白），文件不存在或为空时使用环境变量提供的值。
//! 没有密钥时认证关闭，所有连接都被接受。
//! 登录成功后发放随机令牌，通过 HttpOnly cookie 携带。

use std::collections::HashSet;
use std::io;
use std::path::Path;

use axum::http::header::COOKIE;
use axum::http::HeaderMap;
use parking_lot::RwLock;
use subtle::ConstantTimeEq;

use crate::utils::error::TerminalError;

/// 会话 cookie 名称
pub const SESSION_COOKIE: &str = "glterm_session";

/// 密钥认证
#[derive(Default)]
pub struct KeyAuth {
    key: Option<Vec<u8>>,
    tokens: RwLock<HashSet<String>>,
}

impl KeyAuth {
    /// 关闭认证
    pub fn disabled() -> Self {
        Self::default()
    }

    /// 使用给定密钥，空密钥等同于关闭认证
    pub fn with_key(key: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        Self {
            key: (!key.is_empty()).then_some(key),
            tokens: RwLock::new(HashSet::new()),
        }
    }

    /// 从密钥文件或备用值加载
    pub fn load(key_file: Option<&Path>, fallback: Option<&str>) -> Result<Self, TerminalError> {
        if let Some(path) = key_file {
            match std::fs::read(path) {
                Ok(bytes) => {
                    let key = bytes.trim_ascii().to_vec();
                    if !key.is_empty() {
                        tracing::info!("已从密钥文件加载登录密钥: {}", path.display());
                        return Ok(Self::with_key(key));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(TerminalError::IoError(e)),
            }
        }

        Ok(match fallback.filter(|k| !k.is_empty()) {
            Some(key) => Self::with_key(key.as_bytes()),
            None => Self::disabled(),
        })
    }

    /// 是否启用认证
    pub fn enabled(&self) -> bool {
        self.key.is_some()
    }

    /// 校验密钥，成功时返回新令牌
    pub fn login(&self, candidate: &str) -> Result<String, TerminalError> {
        let Some(key) = &self.key else {
            return Ok(self.issue_token());
        };

        let matches: bool = key.as_slice().ct_eq(candidate.as_bytes()).into();
        if !matches {
            tracing::warn!("登录失败: 密钥不匹配");
            return Err(TerminalError::AuthenticationFailed("密钥无效".to_string()));
        }

        tracing::info!("登录成功");
        Ok(self.issue_token())
    }

    fn issue_token(&self) -> String {
        let token = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        self.tokens.write().insert(token.clone());
        token
    }

    /// 请求是否已认证
    pub fn is_authenticated(&self, headers: &HeaderMap) -> bool {
        if !self.enabled() {
            return true;
        }
        match session_token(headers) {
            Some(token) => self.tokens.read().contains(&token),
            None => false,
        }
    }

    /// 注销请求携带的令牌
    pub fn logout(&self, headers: &HeaderMap) {
        if let Some(token) = session_token(headers) {
            self.tokens.write().remove(&token);
        }
    }

    /// 设置 cookie 的响应头值
    pub fn cookie_header(token: &str) -> String {
        format!("{}={}; Path=/; HttpOnly; SameSite=Lax", SESSION_COOKIE, token)
    }

    /// 清除 cookie 的响应头值
    pub fn clear_cookie_header() -> String {
        format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", SESSION_COOKIE)
    }
}

/// 从 Cookie 头中取出会话令牌
fn session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}
