//! # 設定モジュール
//!
//! `config.toml` と環境変数からダッシュボードの設定を読み込みます。
//!
//! ## 優先順位
//!
//! 1. 環境変数（`CACHEADMIN_AUTH_USERNAME` など）
//! 2. 設定ファイル
//! 3. 組み込みデフォルト値
//!
//! 設定ファイルが存在しない場合はデフォルト値のみで起動します。
//! 読み込んだ設定は起動後は変更されず、`Arc` 経由で全ワーカーに共有されます。

use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// 認証情報を上書きする環境変数名
pub const ENV_AUTH_USERNAME: &str = "CACHEADMIN_AUTH_USERNAME";
pub const ENV_AUTH_PASSWORD: &str = "CACHEADMIN_AUTH_PASSWORD";
/// リッスンアドレスを上書きする環境変数名
pub const ENV_LISTEN: &str = "CACHEADMIN_LISTEN";

/// デフォルト値関数
fn default_listen() -> String { "0.0.0.0:8080".to_string() }
fn default_strategy() -> AuthStrategyKind { AuthStrategyKind::Basic }
fn default_username() -> String { "admin".to_string() }
fn default_password() -> String { "password".to_string() }
fn default_realm() -> String { "Cache Admin Login".to_string() }
fn default_dashboards() -> Vec<String> {
    vec!["server".to_string(), "redis".to_string(), "memcached".to_string()]
}
fn default_timezone() -> String { "UTC".to_string() }
fn default_timeformat() -> String { "%d. %m. %Y %H:%M:%S".to_string() }
fn default_decimalsep() -> String { ",".to_string() }
fn default_thousandssep() -> String { " ".to_string() }
fn default_listview() -> String { "tree".to_string() }
fn default_panelrefresh() -> u64 { 30 }
fn default_metricsrefresh() -> u64 { 60 }
fn default_metricstab() -> u64 { 1440 }
fn default_url() -> String { "/".to_string() }
fn default_tmpdir() -> PathBuf { std::env::temp_dir().join("cacheadmin") }
fn default_redis_port() -> u16 { 6379 }

/// ダッシュボード全体の設定
#[derive(Deserialize, Clone, Debug)]
pub struct AdminConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub auth: AuthSection,

    /// 表示するダッシュボードの識別子
    ///
    /// 順序がサイドバーの並び順になり、先頭がデフォルトのダッシュボード
    #[serde(default = "default_dashboards")]
    pub dashboards: Vec<String>,

    /// Redis 接続先リスト
    #[serde(default)]
    pub redis: Vec<RedisServer>,

    /// Memcached 接続先リスト
    #[serde(default)]
    pub memcached: Vec<MemcachedServer>,

    #[serde(default)]
    pub display: DisplaySection,

    /// 一時ファイル置き場
    ///
    /// 起動時に存在しなければ作成される
    #[serde(default = "default_tmpdir")]
    pub tmpdir: PathBuf,

    /// リバースプロキシ配下で運用する場合のベースパス
    #[serde(default = "default_url")]
    pub url: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            auth: AuthSection::default(),
            dashboards: default_dashboards(),
            redis: Vec::new(),
            memcached: Vec::new(),
            display: DisplaySection::default(),
            tmpdir: default_tmpdir(),
            url: default_url(),
        }
    }
}

/// サーバー設定
#[derive(Deserialize, Clone, Debug)]
pub struct ServerSection {
    /// リッスンアドレス
    ///
    /// デフォルト: 0.0.0.0:8080
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { listen: default_listen() }
    }
}

/// 認証ストラテジの種別
///
/// 実行時に呼び出し可能かどうかを判定するのではなく、
/// 閉じた列挙型としてパターンマッチで分岐します。
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthStrategyKind {
    /// 認証なし（全リクエスト許可）
    None,
    /// HTTP Basic 認証
    Basic,
}

/// 認証設定
#[derive(Deserialize, Clone, Debug)]
pub struct AuthSection {
    /// 使用する認証ストラテジ
    ///
    /// デフォルト: basic
    #[serde(default = "default_strategy")]
    pub strategy: AuthStrategyKind,

    /// デフォルト: admin
    #[serde(default = "default_username")]
    pub username: String,

    /// デフォルト: password
    #[serde(default = "default_password")]
    pub password: String,

    /// WWW-Authenticate ヘッダーの realm
    #[serde(default = "default_realm")]
    pub realm: String,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            username: default_username(),
            password: default_password(),
            realm: default_realm(),
        }
    }
}

/// Redis 接続先
#[derive(Deserialize, Clone, Debug)]
pub struct RedisServer {
    /// 表示名
    pub name: String,
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    /// データベース番号
    #[serde(default)]
    pub database: Option<u32>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Memcached 接続先
#[derive(Deserialize, Clone, Debug)]
pub struct MemcachedServer {
    /// 表示名
    pub name: String,
    pub host: String,
    pub port: u16,
}

/// 表示・ロケール設定
///
/// 描画側（外部コラボレータ）が参照する値で、この層では読み込みと
/// 受け渡しのみを行う。
#[derive(Deserialize, Clone, Debug)]
pub struct DisplaySection {
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// 日時のフォーマット（strftime 形式）
    #[serde(default = "default_timeformat")]
    pub timeformat: String,

    #[serde(default = "default_decimalsep")]
    pub decimalsep: String,

    #[serde(default = "default_thousandssep")]
    pub thousandssep: String,

    /// キー一覧の表示形式（"tree" または "flat"）
    #[serde(default = "default_listview")]
    pub listview: String,

    /// パネルの自動更新間隔（秒）
    #[serde(default = "default_panelrefresh")]
    pub panelrefresh: u64,

    /// メトリクスの更新間隔（秒）
    #[serde(default = "default_metricsrefresh")]
    pub metricsrefresh: u64,

    /// メトリクスタブの保持期間（分）
    #[serde(default = "default_metricstab")]
    pub metricstab: u64,
}

impl Default for DisplaySection {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            timeformat: default_timeformat(),
            decimalsep: default_decimalsep(),
            thousandssep: default_thousandssep(),
            listview: default_listview(),
            panelrefresh: default_panelrefresh(),
            metricsrefresh: default_metricsrefresh(),
            metricstab: default_metricstab(),
        }
    }
}

impl AdminConfig {
    /// 設定ファイルを読み込み、環境変数による上書きを適用する
    ///
    /// ファイルが存在しない場合はデフォルト設定を返す。
    /// パースエラーは `InvalidData` として返す。
    pub fn load(path: &Path) -> io::Result<Self> {
        let mut config = if path.exists() {
            let config_str = fs::read_to_string(path)?;
            toml::from_str(&config_str).map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, format!("TOML parse error: {}", e))
            })?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// 環境変数による上書き
    fn apply_env_overrides(&mut self) {
        if let Ok(username) = std::env::var(ENV_AUTH_USERNAME) {
            if !username.is_empty() {
                self.auth.username = username;
            }
        }
        if let Ok(password) = std::env::var(ENV_AUTH_PASSWORD) {
            if !password.is_empty() {
                self.auth.password = password;
            }
        }
        if let Ok(listen) = std::env::var(ENV_LISTEN) {
            if !listen.is_empty() {
                self.server.listen = listen;
            }
        }
    }

    /// 一時ディレクトリを作成する（存在すれば何もしない）
    pub fn ensure_tmpdir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.tmpdir)
    }
}
