//! # 認証ゲートモジュール
//!
//! レンダリング前に毎リクエスト評価される HTTP Basic 認証のゲートを提供します。
//! 認証はステートレスで、資格情報はリクエストごとに再検証されます。
//! サーバー側セッションは持たず、唯一の永続状態は明示的ログアウト時に
//! クライアントへ発行される短命の Cookie（ログアウトマーカー）のみです。
//!
//! ## 状態遷移
//!
//! ```text
//! ?logout 付きリクエスト ──→ マーカー Cookie 設定 + クエリ除去先へ 302
//! マーカー Cookie 付き   ──→ Cookie 失効 + 401 チャレンジ（再入力を促す）
//! それ以外               ──→ Authorization ヘッダー検証 → Allow / 401
//! ```
//!
//! ゲートが Allow 以外を返した場合、そのリクエストの処理はここで終端し、
//! レンダラーは呼び出されません。

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::config::{AdminConfig, AuthStrategyKind};

// ====================
// 定数
// ====================

/// ログアウトマーカー Cookie 名
pub const LOGOUT_COOKIE: &str = "auth_reset";

/// ログアウトを指示するクエリパラメータ名
pub const LOGOUT_PARAM: &str = "logout";

/// ログアウトマーカーの有効期間（秒）
///
/// 直後のリクエストで読み取られて失効するため、短時間で十分
const LOGOUT_COOKIE_TTL_SECS: u64 = 60;

/// 認証失敗時の固定メッセージ
pub const MSG_BAD_CREDENTIALS: &[u8] = b"Incorrect username or password!";

/// ログアウト完了時の固定メッセージ
pub const MSG_LOGGED_OUT: &[u8] = b"You have been logged out.";

// ====================
// 認証ストラテジ
// ====================

/// 設定済みの資格情報
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// カスタムストラテジ用ハンドラ
pub type CustomHandler = Box<dyn Fn(&RequestContext<'_>) -> GateDecision + Send + Sync>;

/// 認証ストラテジ
///
/// 設定値から閉じた列挙型として構築され、パターンマッチで分岐する。
/// `Custom` は組み込み利用者が独自ゲートを差し込むための口。
pub enum AuthStrategy {
    /// 認証なし（全リクエスト許可）
    Disabled,
    /// HTTP Basic 認証
    Basic { credentials: Credentials, realm: String },
    /// 利用者定義のゲート
    Custom(CustomHandler),
}

impl AuthStrategy {
    /// 設定からストラテジを構築する
    pub fn from_config(config: &AdminConfig) -> Self {
        match config.auth.strategy {
            AuthStrategyKind::None => AuthStrategy::Disabled,
            AuthStrategyKind::Basic => AuthStrategy::Basic {
                credentials: Credentials {
                    username: config.auth.username.clone(),
                    password: config.auth.password.clone(),
                },
                realm: config.auth.realm.clone(),
            },
        }
    }

    /// 認証が有効かどうか
    pub fn is_enabled(&self) -> bool {
        !matches!(self, AuthStrategy::Disabled)
    }
}

// ====================
// リクエストコンテキスト
// ====================

/// ゲート評価に必要なリクエスト情報
///
/// HTTP パーサーが抽出したヘッダー群への参照のみを持ち、所有しない。
#[derive(Debug, Default)]
pub struct RequestContext<'a> {
    /// クエリを除いたパス
    pub path: &'a str,
    /// クエリ文字列（`?` より後ろ、無ければ None）
    pub query: Option<&'a str>,
    /// Host ヘッダー
    pub host: &'a str,
    /// X-Forwarded-Proto が https かどうか
    pub https: bool,
    /// Authorization ヘッダーの生の値
    pub authorization: Option<&'a [u8]>,
    /// Cookie ヘッダーの生の値
    pub cookie: Option<&'a [u8]>,
}

// ====================
// ゲート判定
// ====================

/// ゲートの判定結果
///
/// `Allow` 以外はそのリクエストの終端を意味し、ゲートが応答を生成する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// 認証成功。ゲートは何も出力せず、呼び出し元へ制御を返す
    Allow,
    /// 明示的ログアウト。マーカー Cookie を設定し、クエリを除いた URL へリダイレクト
    LogoutRedirect { location: String },
    /// マーカー Cookie を検出。Cookie を失効させ、再チャレンジ
    LoggedOut,
    /// 資格情報なし、または不一致
    Denied,
}

/// ゲートが生成する応答の骨格
///
/// キャッシュ抑止ヘッダー等の全応答共通部分は呼び出し元が付与する。
#[derive(Debug, PartialEq, Eq)]
pub struct GateResponse {
    pub status: u16,
    pub reason: &'static str,
    /// ゲート固有の追加ヘッダー（WWW-Authenticate, Location, Set-Cookie）
    pub headers: Vec<(&'static str, String)>,
    pub body: &'static [u8],
}

/// リクエストを評価し、ゲートの判定を返す
///
/// ストラテジが `Disabled` の場合は常に `Allow`。
pub fn evaluate(strategy: &AuthStrategy, ctx: &RequestContext<'_>) -> GateDecision {
    match strategy {
        AuthStrategy::Disabled => GateDecision::Allow,
        AuthStrategy::Custom(handler) => handler(ctx),
        AuthStrategy::Basic { credentials, .. } => evaluate_basic(credentials, ctx),
    }
}

/// Basic 認証の評価
fn evaluate_basic(credentials: &Credentials, ctx: &RequestContext<'_>) -> GateDecision {
    // 1. 明示的ログアウト: クエリからフラグを取り除いた URL へリダイレクト
    if query_has_param(ctx.query, LOGOUT_PARAM) {
        let scheme = if ctx.https { "https" } else { "http" };
        return GateDecision::LogoutRedirect {
            location: format!("{}://{}{}", scheme, ctx.host, ctx.path),
        };
    }

    // 2. ログアウトマーカーを検出したら失効させ、ブラウザに再入力を促す
    if cookie_value(ctx.cookie, LOGOUT_COOKIE).is_some() {
        return GateDecision::LoggedOut;
    }

    // 3. 資格情報の検証
    //
    // 比較は単純な文字列等価であり、タイミングセーフではない。
    // 管理ツールという位置付けを変えないため元の挙動を踏襲している。
    match parse_basic_authorization(ctx.authorization) {
        Some((username, password))
            if username == credentials.username && password == credentials.password =>
        {
            GateDecision::Allow
        }
        _ => GateDecision::Denied,
    }
}

/// 判定から応答の骨格を生成する
///
/// `Allow` は応答を持たないため `None`。
pub fn response_for(decision: &GateDecision, realm: &str) -> Option<GateResponse> {
    match decision {
        GateDecision::Allow => None,
        GateDecision::LogoutRedirect { location } => Some(GateResponse {
            status: 302,
            reason: "Found",
            headers: vec![
                ("Location", location.clone()),
                (
                    "Set-Cookie",
                    format!("{}=1; Max-Age={}; Path=/", LOGOUT_COOKIE, LOGOUT_COOKIE_TTL_SECS),
                ),
            ],
            body: b"",
        }),
        GateDecision::LoggedOut => Some(GateResponse {
            status: 401,
            reason: "Unauthorized",
            headers: vec![
                ("WWW-Authenticate", format!("Basic realm=\"{}\"", realm)),
                // Max-Age=0 で即時失効させる
                ("Set-Cookie", format!("{}=; Max-Age=0; Path=/", LOGOUT_COOKIE)),
            ],
            body: MSG_LOGGED_OUT,
        }),
        GateDecision::Denied => Some(GateResponse {
            status: 401,
            reason: "Unauthorized",
            headers: vec![("WWW-Authenticate", format!("Basic realm=\"{}\"", realm))],
            body: MSG_BAD_CREDENTIALS,
        }),
    }
}

// ====================
// ヘッダー解析ヘルパー
// ====================

/// クエリ文字列に指定パラメータが含まれるか
///
/// `logout` と `logout=1` の両形式を受け付ける
pub fn query_has_param(query: Option<&str>, name: &str) -> bool {
    let Some(query) = query else {
        return false;
    };
    query.split('&').any(|pair| {
        let key = pair.split('=').next().unwrap_or(pair);
        key == name
    })
}

/// Cookie ヘッダーから指定名の値を取り出す
pub fn cookie_value<'a>(header: Option<&'a [u8]>, name: &str) -> Option<&'a str> {
    let header = std::str::from_utf8(header?).ok()?;
    for pair in header.split(';') {
        let pair = pair.trim();
        if let Some((key, value)) = pair.split_once('=') {
            if key == name {
                return Some(value);
            }
        }
    }
    None
}

/// `Authorization: Basic <base64>` をユーザー名とパスワードに分解する
///
/// 形式不正はすべて None（＝資格情報なしと同じ扱い）
fn parse_basic_authorization(header: Option<&[u8]>) -> Option<(String, String)> {
    let header = std::str::from_utf8(header?).ok()?;
    let encoded = header.strip_prefix("Basic ").or_else(|| header.strip_prefix("basic "))?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    // パスワードにコロンが含まれ得るため最初のコロンで分割
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_strategy() -> AuthStrategy {
        AuthStrategy::Basic {
            credentials: Credentials {
                username: "admin".to_string(),
                password: "password".to_string(),
            },
            realm: "Cache Admin Login".to_string(),
        }
    }

    fn basic_header(user: &str, pass: &str) -> Vec<u8> {
        format!("Basic {}", BASE64.encode(format!("{}:{}", user, pass))).into_bytes()
    }

    #[test]
    fn test_disabled_strategy_allows_everything() {
        let ctx = RequestContext { path: "/", host: "localhost", ..Default::default() };
        assert_eq!(evaluate(&AuthStrategy::Disabled, &ctx), GateDecision::Allow);
    }

    #[test]
    fn test_missing_credentials_denied() {
        let ctx = RequestContext { path: "/", host: "localhost", ..Default::default() };
        let decision = evaluate(&test_strategy(), &ctx);
        assert_eq!(decision, GateDecision::Denied);

        let response = response_for(&decision, "Cache Admin Login").unwrap();
        assert_eq!(response.status, 401);
        assert_eq!(response.body, MSG_BAD_CREDENTIALS);
        assert!(response
            .headers
            .iter()
            .any(|(k, v)| *k == "WWW-Authenticate" && v == "Basic realm=\"Cache Admin Login\""));
    }

    #[test]
    fn test_wrong_password_denied() {
        let header = basic_header("admin", "wrong");
        let ctx = RequestContext {
            path: "/",
            host: "localhost",
            authorization: Some(&header),
            ..Default::default()
        };
        assert_eq!(evaluate(&test_strategy(), &ctx), GateDecision::Denied);
    }

    #[test]
    fn test_correct_credentials_allowed() {
        let header = basic_header("admin", "password");
        let ctx = RequestContext {
            path: "/",
            host: "localhost",
            authorization: Some(&header),
            ..Default::default()
        };
        let decision = evaluate(&test_strategy(), &ctx);
        assert_eq!(decision, GateDecision::Allow);
        // Allow はゲート自身の応答を持たない
        assert!(response_for(&decision, "r").is_none());
    }

    #[test]
    fn test_password_containing_colon() {
        let strategy = AuthStrategy::Basic {
            credentials: Credentials {
                username: "admin".to_string(),
                password: "pa:ss".to_string(),
            },
            realm: "r".to_string(),
        };
        let header = basic_header("admin", "pa:ss");
        let ctx = RequestContext {
            path: "/",
            host: "localhost",
            authorization: Some(&header),
            ..Default::default()
        };
        assert_eq!(evaluate(&strategy, &ctx), GateDecision::Allow);
    }

    #[test]
    fn test_logout_query_redirects_and_sets_cookie() {
        let ctx = RequestContext {
            path: "/",
            query: Some("logout=1"),
            host: "localhost:8080",
            ..Default::default()
        };
        let decision = evaluate(&test_strategy(), &ctx);
        assert_eq!(
            decision,
            GateDecision::LogoutRedirect { location: "http://localhost:8080/".to_string() }
        );

        let response = response_for(&decision, "r").unwrap();
        assert_eq!(response.status, 302);
        assert!(response
            .headers
            .iter()
            .any(|(k, v)| *k == "Location" && v == "http://localhost:8080/"));
        assert!(response
            .headers
            .iter()
            .any(|(k, v)| *k == "Set-Cookie" && v == "auth_reset=1; Max-Age=60; Path=/"));
    }

    #[test]
    fn test_logout_respects_forwarded_proto() {
        let ctx = RequestContext {
            path: "/admin/",
            query: Some("tab=keys&logout"),
            host: "cache.example.com",
            https: true,
            ..Default::default()
        };
        let decision = evaluate(&test_strategy(), &ctx);
        assert_eq!(
            decision,
            GateDecision::LogoutRedirect {
                location: "https://cache.example.com/admin/".to_string()
            }
        );
    }

    #[test]
    fn test_logout_marker_cookie_challenges_and_clears() {
        // 正しい資格情報を出していてもマーカーが優先される
        let header = basic_header("admin", "password");
        let ctx = RequestContext {
            path: "/",
            host: "localhost",
            authorization: Some(&header),
            cookie: Some(b"theme=dark; auth_reset=1"),
            ..Default::default()
        };
        let decision = evaluate(&test_strategy(), &ctx);
        assert_eq!(decision, GateDecision::LoggedOut);

        let response = response_for(&decision, "Cache Admin Login").unwrap();
        assert_eq!(response.status, 401);
        assert_eq!(response.body, b"You have been logged out.");
        assert!(response
            .headers
            .iter()
            .any(|(k, v)| *k == "Set-Cookie" && v == "auth_reset=; Max-Age=0; Path=/"));
    }

    #[test]
    fn test_query_has_param() {
        assert!(query_has_param(Some("logout"), "logout"));
        assert!(query_has_param(Some("logout=1"), "logout"));
        assert!(query_has_param(Some("a=b&logout=1"), "logout"));
        assert!(!query_has_param(Some("logoutx=1"), "logout"));
        assert!(!query_has_param(Some("a=logout"), "logout"));
        assert!(!query_has_param(None, "logout"));
    }

    #[test]
    fn test_cookie_value() {
        assert_eq!(cookie_value(Some(b"auth_reset=1"), "auth_reset"), Some("1"));
        assert_eq!(cookie_value(Some(b"a=b; auth_reset=1; c=d"), "auth_reset"), Some("1"));
        assert_eq!(cookie_value(Some(b"a=b"), "auth_reset"), None);
        assert_eq!(cookie_value(None, "auth_reset"), None);
    }

    #[test]
    fn test_malformed_authorization_denied() {
        for header in [
            b"Basic".to_vec(),
            b"Basic !!!not-base64!!!".to_vec(),
            b"Bearer abcdef".to_vec(),
            // コロンを含まないペイロード
            format!("Basic {}", BASE64.encode("no-colon")).into_bytes(),
        ] {
            let ctx = RequestContext {
                path: "/",
                host: "localhost",
                authorization: Some(&header),
                ..Default::default()
            };
            assert_eq!(evaluate(&test_strategy(), &ctx), GateDecision::Denied);
        }
    }

    #[test]
    fn test_custom_strategy_dispatch() {
        let strategy = AuthStrategy::Custom(Box::new(|ctx| {
            if ctx.path.starts_with("/public") {
                GateDecision::Allow
            } else {
                GateDecision::Denied
            }
        }));
        let ctx = RequestContext { path: "/public/x", host: "h", ..Default::default() };
        assert_eq!(evaluate(&strategy, &ctx), GateDecision::Allow);
        let ctx = RequestContext { path: "/secret", host: "h", ..Default::default() };
        assert_eq!(evaluate(&strategy, &ctx), GateDecision::Denied);
    }
}
