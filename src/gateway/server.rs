//! HTTP / WebSocket 服务
//!
//! 组装注册表、认证和路由，并在退出时关闭全部会话。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Form, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use super::auth::KeyAuth;
use super::connection::Connection;
use super::events::EventSender;
use crate::config::Config;
use crate::pty::backend::native_backend;
use crate::pty::registry::SessionRegistry;
use crate::pty::types::SessionState;

const TERMINAL_PAGE: &str = include_str!("../../static/index.html");
const LOGIN_PAGE: &str = include_str!("../../static/login.html");
const LOGIN_ERROR_MARKER: &str = "<!--error-->";

/// 路由共享状态
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub auth: Arc<KeyAuth>,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>, auth: KeyAuth) -> Self {
        Self {
            registry,
            auth: Arc::new(auth),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    #[serde(default)]
    key: String,
}

/// 构建路由
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/terminal", get(terminal_handler))
        .route("/login", get(login_page).post(login_handler))
        .route("/logout", get(logout_handler))
        .route("/health", get(health))
        .route("/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn login_response(status: StatusCode, error: Option<&str>) -> Response {
    let marker = error
        .map(|e| format!(r#"<p class="error">{}</p>"#, e))
        .unwrap_or_default();
    (status, Html(LOGIN_PAGE.replace(LOGIN_ERROR_MARKER, &marker))).into_response()
}

async fn index_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if state.auth.is_authenticated(&headers) {
        Html(TERMINAL_PAGE).into_response()
    } else {
        login_response(StatusCode::OK, None)
    }
}

async fn terminal_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if state.auth.is_authenticated(&headers) {
        Html(TERMINAL_PAGE).into_response()
    } else {
        Redirect::to("/").into_response()
    }
}

async fn login_page() -> Response {
    login_response(StatusCode::OK, None)
}

async fn login_handler(State(state): State<AppState>, Form(form): Form<LoginForm>) -> Response {
    match state.auth.login(&form.key) {
        Ok(token) => (
            [(header::SET_COOKIE, KeyAuth::cookie_header(&token))],
            Redirect::to("/terminal"),
        )
            .into_response(),
        Err(_) => login_response(StatusCode::UNAUTHORIZED, Some("Invalid key")),
    }
}

async fn logout_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    state.auth.logout(&headers);
    (
        [(header::SET_COOKIE, KeyAuth::clear_cookie_header())],
        Redirect::to("/"),
    )
        .into_response()
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.registry.len(),
        "auth": state.auth.enabled(),
    }))
}

/// 连接网关入口
///
/// 认证在升级之前检查，未认证返回 403。
async fn websocket_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !state.auth.is_authenticated(&headers) {
        tracing::warn!("拒绝未认证的 WebSocket 连接");
        return StatusCode::FORBIDDEN.into_response();
    }

    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| handle_socket(socket, state.registry))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, registry: Arc<SessionRegistry>) {
    let (mut sender, mut receiver) = socket.split();
    let (events, mut event_rx) = EventSender::channel();
    let connection = Connection::new(registry, events);
    let conn_id = connection.id().short().to_string();

    // 按入队顺序转发事件
    let send_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let json = match event.to_json() {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("序列化事件失败: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => connection.handle_text(&text).await,
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => connection.handle_text(text).await,
                Err(_) => tracing::debug!("忽略非 UTF-8 二进制帧 ({})", conn_id),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("WebSocket 接收错误 ({}): {}", conn_id, e);
                break;
            }
        }
    }

    connection.disconnect();
    drop(connection);
    send_task.abort();
}

/// 等待 Ctrl+C 或 SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("无法监听 Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("无法监听 SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("收到 Ctrl+C"),
        _ = terminate => tracing::info!("收到 SIGTERM"),
    }
}

/// 在给定监听器上运行服务，`shutdown` 完成后停止接受连接并关闭全部会话
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = state.registry.clone();

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP 服务错误")?;

    let timeout = registry.config().close_grace + Duration::from_secs(1);
    close_all_sessions(&registry, timeout).await;
    Ok(())
}

/// 关闭全部会话并等待回收完成
pub async fn close_all_sessions(registry: &SessionRegistry, timeout: Duration) {
    let sessions = registry.close_all();
    if sessions.is_empty() {
        return;
    }

    let waited = tokio::time::timeout(timeout, async {
        while sessions.iter().any(|s| s.state() != SessionState::Closed) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    if waited.is_err() {
        tracing::warn!("等待会话回收超时");
    }
}

/// 按配置启动服务
pub async fn run(config: Config) -> anyhow::Result<()> {
    let auth = KeyAuth::load(config.key_file_path().as_deref(), config.key.as_deref())
        .context("加载登录密钥失败")?;
    if !auth.enabled() {
        tracing::warn!("认证已关闭: 没有找到登录密钥 (密钥文件或 GLTERM_KEY)");
    }

    let registry = SessionRegistry::new(native_backend(), config.registry_config());
    let state = AppState::new(registry, auth);

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("无法绑定地址 {}", addr))?;
    tracing::info!("glterm 已启动: http://{}", addr);

    serve(listener, state, shutdown_signal()).await?;

    tracing::info!("glterm 已退出");
    Ok(())
}
