//! # cacheadmin
//!
//! キャッシュ管理ダッシュボードのブートストラップ層。
//! monoio (io_uring) 上の HTTP/1.1 サーバーとして動作し、
//! 以下を担当します。
//!
//! - **設定読み込み**: `config.toml` + 環境変数上書き
//! - **キャッシュ抑止**: 全応答への Expires / Cache-Control ヘッダー付与
//! - **認証ゲート**: HTTP Basic 認証とログアウトフロー（`auth` モジュール）
//! - **値変換レジストリ**: 圧縮コーデックとフォーマッタ（`transform` モジュール）
//! - **描画の委譲**: ゲート通過後のページ生成は `Renderer` シームへ委譲
//!
//! ## リクエストの流れ
//!
//! ```text
//! accept → HTTP パース → 認証ゲート ──(Allow)──→ レンダラー → 200
//!                              │
//!                              └─(それ以外)──→ 302 / 401 で終端
//! ```
//!
//! 認証はステートレスで、ワーカースレッド間で共有される可変状態は
//! シャットダウンフラグのみです。

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod auth;
mod config;
mod render;
mod transform;

use httparse::{Request, Status};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::{TcpListener, TcpStream};
use monoio::time::timeout;
use monoio::RuntimeBuilder;
use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ftlog::{error, info, warn};
use time::OffsetDateTime;

use auth::{AuthStrategy, GateDecision, RequestContext};
use config::AdminConfig;
use render::{DashboardIndex, Renderer};
use transform::TransformRegistry;

// ====================
// 定数定義
// ====================

/// 設定ファイルパスを上書きする環境変数名
const ENV_CONFIG_PATH: &str = "CACHEADMIN_CONFIG";

/// デフォルトの設定ファイルパス
const DEFAULT_CONFIG_PATH: &str = "config.toml";

// キャッシュ抑止ヘッダー（全応答に付与）
static HEADER_EXPIRES: &str = "Expires: Wed, 11 Jan 1984 05:00:00 GMT";
static HEADER_CACHE_CONTROL: &str =
    "Cache-Control: no-cache, must-revalidate, max-age=0, no-store, private";

// エラーレスポンス用静的バッファ
static ERR_MSG_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nExpires: Wed, 11 Jan 1984 05:00:00 GMT\r\nCache-Control: no-cache, must-revalidate, max-age=0, no-store, private\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
static ERR_MSG_REQUEST_TOO_LARGE: &[u8] = b"HTTP/1.1 413 Request Entity Too Large\r\nExpires: Wed, 11 Jan 1984 05:00:00 GMT\r\nCache-Control: no-cache, must-revalidate, max-age=0, no-store, private\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

// バッファサイズ
const BUF_SIZE: usize = 65536;

// セキュリティ制限
const MAX_HEADER_SIZE: usize = 8192;     // 8KB - ヘッダーサイズ上限
const MAX_BODY_SIZE: usize = 10485760;   // 10MB - ボディサイズ上限

// タイムアウト設定
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

// ====================
// Graceful Shutdown フラグ
// ====================

static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

// ====================
// バッファプール
// ====================
//
// monoio の read はバッファの所有権を取るため、スレッドローカルな
// プールでアロケーションコストを削減します。返却時はゼロ初期化し、
// 前回のリクエストデータが残らないようにします。
// ====================

thread_local! {
    static BUF_POOL: RefCell<Vec<Vec<u8>>> = RefCell::new(
        (0..8).map(|_| vec![0u8; BUF_SIZE]).collect()
    );
}

/// バッファ取得ヘルパー
#[inline(always)]
fn buf_get() -> Vec<u8> {
    BUF_POOL.with(|p| p.borrow_mut().pop().unwrap_or_else(|| vec![0u8; BUF_SIZE]))
}

/// バッファ返却ヘルパー
#[inline(always)]
fn buf_put(mut buf: Vec<u8>) {
    BUF_POOL.with(|p| {
        let mut pool = p.borrow_mut();
        if pool.len() < 32 {
            buf.clear();
            buf.resize(BUF_SIZE, 0);
            pool.push(buf);
        }
    });
}

// ====================
// アプリケーションコンテキスト
// ====================

/// 起動時に構築され、以降は読み取り専用で全ワーカーに共有される状態
struct AppContext {
    config: AdminConfig,
    strategy: AuthStrategy,
    registry: TransformRegistry,
    renderer: Box<dyn Renderer>,
}

// ====================
// メイン関数
// ====================

fn main() {
    let _guard = ftlog::Builder::new().try_init().unwrap();

    let config_path =
        std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let config = match AdminConfig::load(Path::new(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config load error ({}): {}", config_path, e);
            return;
        }
    };

    if let Err(e) = config.ensure_tmpdir() {
        warn!("Failed to create tmpdir {}: {}", config.tmpdir.display(), e);
    }

    let listen_addr = match config.server.listen.parse::<SocketAddr>() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Invalid listen address '{}': {}", config.server.listen, e);
            return;
        }
    };

    let strategy = AuthStrategy::from_config(&config);
    let registry = TransformRegistry::with_defaults();

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    info!("============================================");
    info!("cacheadmin - Cache Administration Dashboard");
    info!("Hostname: {}", hostname);
    info!("Listen Address: {}", listen_addr);
    info!("Threads: {}", num_cpus::get());
    info!("Auth: {}", if strategy.is_enabled() { "basic" } else { "disabled" });
    info!("Dashboards: {}", config.dashboards.join(", "));
    info!(
        "Transforms: {}",
        registry.transform_names().collect::<Vec<_>>().join(", ")
    );
    info!("Tmpdir: {}", config.tmpdir.display());
    info!("============================================");

    // Graceful Shutdown用のシグナルハンドラを設定
    setup_signal_handler();

    let context = Arc::new(AppContext {
        config,
        strategy,
        registry,
        renderer: Box::new(DashboardIndex),
    });

    let num_threads = num_cpus::get();
    let mut handles = Vec::with_capacity(num_threads);

    for thread_id in 0..num_threads {
        let context = context.clone();
        let addr = listen_addr;

        let handle = thread::spawn(move || {
            let mut rt = RuntimeBuilder::<monoio::IoUringDriver>::new()
                .enable_timer()
                .build()
                .expect("Failed to create runtime");
            rt.block_on(async move {
                let listener = match create_listener(addr) {
                    Ok(l) => l,
                    Err(e) => {
                        error!("[Thread {}] Bind error: {}", thread_id, e);
                        return;
                    }
                };

                info!("[Thread {}] Worker started", thread_id);

                loop {
                    // Shutdown チェック
                    if SHUTDOWN_FLAG.load(Ordering::Relaxed) {
                        info!("[Thread {}] Shutting down...", thread_id);
                        break;
                    }

                    // タイムアウト付きaccept（Graceful Shutdown対応）
                    let accept_result = timeout(Duration::from_secs(1), listener.accept()).await;

                    let (stream, _peer_addr) = match accept_result {
                        Ok(Ok(s)) => s,
                        Ok(Err(e)) => {
                            error!("[Thread {}] Accept error: {}", thread_id, e);
                            continue;
                        }
                        Err(_) => {
                            // タイムアウト - ループを継続してshutdownチェック
                            continue;
                        }
                    };

                    let _ = stream.set_nodelay(true);

                    let context = context.clone();
                    monoio::spawn(async move {
                        handle_connection(stream, context).await;
                    });
                }

                info!("[Thread {}] Worker stopped", thread_id);
            });
        });
        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }

    info!("Server shutdown complete");
}

/// シグナルハンドラのセットアップ
fn setup_signal_handler() {
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, initiating graceful shutdown...");
        SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
    })
    .expect("Failed to set signal handler");
}

fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let config = monoio::net::ListenerConfig::default()
        .reuse_port(true)
        .backlog(1024);
    TcpListener::bind_with_config(addr, &config)
}

// ====================
// 接続処理
// ====================

/// ヘッダーから抽出したリクエスト情報（所有版）
struct ParsedRequest {
    path: String,
    host: String,
    https: bool,
    authorization: Option<Box<[u8]>>,
    cookie: Option<Box<[u8]>>,
    content_length: usize,
    is_chunked: bool,
    wants_close: bool,
}

async fn handle_connection(mut stream: TcpStream, context: Arc<AppContext>) {
    let mut accumulated = Vec::with_capacity(BUF_SIZE);

    loop {
        // 読み込み（アイドルタイムアウト付き）
        let read_buf = buf_get();
        let read_result = timeout(IDLE_TIMEOUT, stream.read(read_buf)).await;

        let (res, returned_buf) = match read_result {
            Ok(result) => result,
            Err(_) => {
                // アイドルタイムアウト - 接続を閉じる
                return;
            }
        };

        let n = match res {
            Ok(0) => {
                buf_put(returned_buf);
                return;
            }
            Ok(n) => n,
            Err(_) => {
                buf_put(returned_buf);
                return;
            }
        };

        accumulated.extend_from_slice(&returned_buf[..n]);
        buf_put(returned_buf);

        // ヘッダーサイズ制限チェック
        if accumulated.len() > MAX_HEADER_SIZE {
            let _ = timeout(WRITE_TIMEOUT, stream.write_all(ERR_MSG_REQUEST_TOO_LARGE.to_vec()))
                .await;
            return;
        }

        // HTTPリクエストをパース
        let mut headers_storage = [httparse::EMPTY_HEADER; 64];
        let mut req = Request::new(&mut headers_storage);

        match req.parse(&accumulated) {
            Ok(Status::Complete(header_len)) => {
                let parsed = extract_request(&req);
                drop(req);

                // チャンク転送の管理画面リクエストは想定外
                if parsed.is_chunked || parsed.content_length > MAX_BODY_SIZE {
                    let _ =
                        timeout(WRITE_TIMEOUT, stream.write_all(ERR_MSG_BAD_REQUEST.to_vec()))
                            .await;
                    return;
                }

                // ボディを読み捨てる（Keep-Alive 維持のため）
                let body_in_buffer = accumulated.len() - header_len;
                let mut remaining = parsed.content_length.saturating_sub(body_in_buffer);
                while remaining > 0 {
                    let buf = buf_get();
                    let (res, buf) = match timeout(READ_TIMEOUT, stream.read(buf)).await {
                        Ok(r) => r,
                        Err(_) => return,
                    };
                    match res {
                        Ok(0) | Err(_) => {
                            buf_put(buf);
                            return;
                        }
                        Ok(n) => remaining = remaining.saturating_sub(n),
                    }
                    buf_put(buf);
                }
                accumulated.clear();

                let start_time = OffsetDateTime::now_utc();
                let keep_alive = !parsed.wants_close;

                let response = respond(&context, &parsed, keep_alive);
                let status = response.status;
                let response_bytes = response.bytes;
                let response_size = response_bytes.len();

                let write_result =
                    timeout(WRITE_TIMEOUT, stream.write_all(response_bytes)).await;

                log_access(&parsed.path, status, response_size, start_time);

                match write_result {
                    Ok((Ok(_), _)) if keep_alive => {
                        // Keep-Alive: ループを継続して次のリクエストを待機
                    }
                    _ => return,
                }
            }
            Ok(Status::Partial) => {
                // データ不足、次の読み込みを待つ
                continue;
            }
            Err(_) => {
                let _ = timeout(WRITE_TIMEOUT, stream.write_all(ERR_MSG_BAD_REQUEST.to_vec()))
                    .await;
                return;
            }
        }
    }
}

/// httparse の結果から所有版のリクエスト情報を抽出する
fn extract_request(req: &Request<'_, '_>) -> ParsedRequest {
    let path = req.path.unwrap_or("/").to_string();

    let mut host = String::new();
    let mut https = false;
    let mut authorization = None;
    let mut cookie = None;
    let mut content_length = 0usize;
    let mut is_chunked = false;
    let mut wants_close = false;

    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("host") {
            host = String::from_utf8_lossy(header.value).into_owned();
        } else if header.name.eq_ignore_ascii_case("x-forwarded-proto") {
            https = header.value.eq_ignore_ascii_case(b"https");
        } else if header.name.eq_ignore_ascii_case("authorization") {
            authorization = Some(Box::from(header.value));
        } else if header.name.eq_ignore_ascii_case("cookie") {
            cookie = Some(Box::from(header.value));
        } else if header.name.eq_ignore_ascii_case("content-length") {
            content_length = std::str::from_utf8(header.value)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            is_chunked = header
                .value
                .split(|&b| b == b',')
                .any(|part| part.trim_ascii().eq_ignore_ascii_case(b"chunked"));
        } else if header.name.eq_ignore_ascii_case("connection") {
            wants_close = header.value.eq_ignore_ascii_case(b"close");
        }
    }

    ParsedRequest {
        path,
        host,
        https,
        authorization,
        cookie,
        content_length,
        is_chunked,
        wants_close,
    }
}

// ====================
// 応答生成
// ====================

/// 生成済み応答
struct HttpResponse {
    status: u16,
    bytes: Vec<u8>,
}

/// ゲート評価から応答バイト列までを組み立てる
fn respond(context: &AppContext, parsed: &ParsedRequest, keep_alive: bool) -> HttpResponse {
    let (path, query) = split_target(&parsed.path);

    let ctx = RequestContext {
        path,
        query,
        host: &parsed.host,
        https: parsed.https,
        authorization: parsed.authorization.as_deref(),
        cookie: parsed.cookie.as_deref(),
    };

    let decision = auth::evaluate(&context.strategy, &ctx);

    match auth::response_for(&decision, &context.config.auth.realm) {
        Some(gate) => {
            let extra: Vec<(&str, &str)> =
                gate.headers.iter().map(|(k, v)| (*k, v.as_str())).collect();
            let content_type = if gate.body.is_empty() {
                None
            } else {
                Some("text/plain; charset=utf-8")
            };
            HttpResponse {
                status: gate.status,
                bytes: build_response(
                    gate.status,
                    gate.reason,
                    &extra,
                    content_type,
                    gate.body,
                    keep_alive,
                ),
            }
        }
        None => {
            debug_assert_eq!(decision, GateDecision::Allow);
            let page = context.renderer.render(&context.config, &context.registry);
            HttpResponse {
                status: 200,
                bytes: build_response(
                    200,
                    "OK",
                    &[],
                    Some(page.content_type),
                    &page.body,
                    keep_alive,
                ),
            }
        }
    }
}

/// リクエストターゲットをパスとクエリに分割する
fn split_target(target: &str) -> (&str, Option<&str>) {
    match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    }
}

/// HTTP/1.1 応答を組み立てる
///
/// キャッシュ抑止ヘッダーは全応答に付与される
fn build_response(
    status: u16,
    reason: &str,
    extra_headers: &[(&str, &str)],
    content_type: Option<&str>,
    body: &[u8],
    keep_alive: bool,
) -> Vec<u8> {
    let mut response = Vec::with_capacity(256 + body.len());

    response.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", status, reason).as_bytes());
    response.extend_from_slice(HEADER_EXPIRES.as_bytes());
    response.extend_from_slice(b"\r\n");
    response.extend_from_slice(HEADER_CACHE_CONTROL.as_bytes());
    response.extend_from_slice(b"\r\n");

    for (name, value) in extra_headers {
        response.extend_from_slice(name.as_bytes());
        response.extend_from_slice(b": ");
        response.extend_from_slice(value.as_bytes());
        response.extend_from_slice(b"\r\n");
    }

    if let Some(content_type) = content_type {
        response.extend_from_slice(b"Content-Type: ");
        response.extend_from_slice(content_type.as_bytes());
        response.extend_from_slice(b"\r\n");
    }

    response.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    response.extend_from_slice(if keep_alive {
        b"Connection: keep-alive\r\n" as &[u8]
    } else {
        b"Connection: close\r\n" as &[u8]
    });
    response.extend_from_slice(b"\r\n");
    response.extend_from_slice(body);

    response
}

/// アクセスログ出力
fn log_access(path: &str, status: u16, response_size: usize, start_time: OffsetDateTime) {
    let elapsed = OffsetDateTime::now_utc() - start_time;
    info!(
        "{} {} {}B {:.3}ms",
        status,
        path,
        response_size,
        elapsed.as_seconds_f64() * 1000.0
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use auth::{Credentials, GateDecision};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    fn test_context() -> AppContext {
        let config = AdminConfig::default();
        let strategy = AuthStrategy::from_config(&config);
        AppContext {
            config,
            strategy,
            registry: TransformRegistry::with_defaults(),
            renderer: Box::new(DashboardIndex),
        }
    }

    fn parsed_request(path: &str) -> ParsedRequest {
        ParsedRequest {
            path: path.to_string(),
            host: "localhost:8080".to_string(),
            https: false,
            authorization: None,
            cookie: None,
            content_length: 0,
            is_chunked: false,
            wants_close: false,
        }
    }

    fn response_text(response: &HttpResponse) -> String {
        String::from_utf8_lossy(&response.bytes).into_owned()
    }

    #[test]
    fn test_split_target() {
        assert_eq!(split_target("/"), ("/", None));
        assert_eq!(split_target("/?logout=1"), ("/", Some("logout=1")));
        assert_eq!(split_target("/admin/keys?a=b&c=d"), ("/admin/keys", Some("a=b&c=d")));
    }

    #[test]
    fn test_every_response_disables_caching() {
        let bytes = build_response(200, "OK", &[], Some("text/plain"), b"x", true);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Expires: Wed, 11 Jan 1984 05:00:00 GMT\r\n"));
        assert!(text.contains("Cache-Control: no-cache, must-revalidate, max-age=0, no-store, private\r\n"));
        assert!(text.contains("Content-Length: 1\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
    }

    #[test]
    fn test_missing_credentials_get_challenge() {
        let context = test_context();
        let response = respond(&context, &parsed_request("/"), true);
        assert_eq!(response.status, 401);

        let text = response_text(&response);
        assert!(text.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
        assert!(text.contains("WWW-Authenticate: Basic realm=\"Cache Admin Login\"\r\n"));
        assert!(text.ends_with("Incorrect username or password!"));
    }

    #[test]
    fn test_correct_credentials_render_page() {
        let context = test_context();
        let mut parsed = parsed_request("/");
        let header = format!("Basic {}", BASE64.encode("admin:password")).into_bytes();
        parsed.authorization = Some(header.into_boxed_slice());

        let response = respond(&context, &parsed, true);
        assert_eq!(response.status, 200);

        let text = response_text(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        // ゲート固有のヘッダーは付かない
        assert!(!text.contains("WWW-Authenticate"));
        assert!(!text.contains("Set-Cookie"));
        // 本文はレンダラーが生成したもの
        assert!(text.contains("cacheadmin"));
    }

    #[test]
    fn test_logout_request_redirects() {
        let context = test_context();
        let response = respond(&context, &parsed_request("/?logout=1"), true);
        assert_eq!(response.status, 302);

        let text = response_text(&response);
        assert!(text.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(text.contains("Location: http://localhost:8080/\r\n"));
        assert!(text.contains("Set-Cookie: auth_reset=1; Max-Age=60; Path=/\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn test_logged_out_marker_clears_cookie() {
        let context = test_context();
        let mut parsed = parsed_request("/");
        parsed.cookie = Some(Box::from(b"auth_reset=1" as &[u8]));

        let response = respond(&context, &parsed, true);
        assert_eq!(response.status, 401);

        let text = response_text(&response);
        assert!(text.contains("Set-Cookie: auth_reset=; Max-Age=0; Path=/\r\n"));
        assert!(text.ends_with("You have been logged out."));
    }

    #[test]
    fn test_disabled_auth_always_renders() {
        let config: AdminConfig = toml::from_str("[auth]\nstrategy = \"none\"").unwrap();
        let strategy = AuthStrategy::from_config(&config);
        let context = AppContext {
            config,
            strategy,
            registry: TransformRegistry::with_defaults(),
            renderer: Box::new(DashboardIndex),
        };
        let response = respond(&context, &parsed_request("/"), true);
        assert_eq!(response.status, 200);
    }

    #[test]
    fn test_custom_strategy_is_dispatched() {
        let mut context = test_context();
        context.strategy = AuthStrategy::Custom(Box::new(|_| GateDecision::Denied));
        let mut parsed = parsed_request("/");
        let header = format!("Basic {}", BASE64.encode("admin:password")).into_bytes();
        parsed.authorization = Some(header.into_boxed_slice());

        // 正しい Basic 資格情報でもカスタムストラテジの判定が優先される
        let response = respond(&context, &parsed, true);
        assert_eq!(response.status, 401);
    }

    #[test]
    fn test_extract_request_headers() {
        let raw = b"GET /?logout=1 HTTP/1.1\r\n\
                    Host: cache.example.com\r\n\
                    X-Forwarded-Proto: https\r\n\
                    Cookie: auth_reset=1\r\n\
                    Authorization: Basic YWJjOmRlZg==\r\n\
                    Connection: close\r\n\
                    Content-Length: 5\r\n\r\nhello";
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = Request::new(&mut headers);
        let status = req.parse(raw).unwrap();
        assert!(status.is_complete());

        let parsed = extract_request(&req);
        assert_eq!(parsed.path, "/?logout=1");
        assert_eq!(parsed.host, "cache.example.com");
        assert!(parsed.https);
        assert_eq!(parsed.cookie.as_deref(), Some(b"auth_reset=1" as &[u8]));
        assert_eq!(parsed.authorization.as_deref(), Some(b"Basic YWJjOmRlZg==" as &[u8]));
        assert_eq!(parsed.content_length, 5);
        assert!(!parsed.is_chunked);
        assert!(parsed.wants_close);
    }

    #[test]
    fn test_gate_response_uses_credentials_from_config() {
        let config: AdminConfig = toml::from_str(
            r#"
            [auth]
            username = "ops"
            password = "s3cret"
        "#,
        )
        .unwrap();
        let strategy = AuthStrategy::from_config(&config);
        match &strategy {
            AuthStrategy::Basic { credentials, realm } => {
                assert_eq!(
                    credentials,
                    &Credentials { username: "ops".to_string(), password: "s3cret".to_string() }
                );
                assert_eq!(realm, "Cache Admin Login");
            }
            _ => panic!("expected basic strategy"),
        }
    }
}
