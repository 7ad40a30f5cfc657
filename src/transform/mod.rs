//! # 値変換パイプライン
//!
//! キャッシュに格納された不透明なバイナリ値を、表示用にデコードし、
//! 保存時に再エンコードするための名前付きレジストリを提供します。
//!
//! ## アーキテクチャ
//!
//! ```text
//! 生の値 ──(view)──→ デコード済みバイト列 ──(formatter)──→ 表示用文字列
//! 編集済みの値 ──(save)──→ 格納バイト列
//! ```
//!
//! - **view**: 失敗許容。不正な入力は例外ではなく「結果なし」に縮退する
//! - **save**: 正常な入力に対して全域。失敗は設定ミス扱いの致命的エラー
//! - **formatter**: view の後段で構造化テキストへの二次デコードを行う。
//!   view と同じ失敗許容の契約
//!
//! レジストリは起動時に一度だけ構築され、以降は読み取り専用として
//! `Arc` 経由で全ワーカースレッドから並行参照されます。
//! 登録順が選択 UI での表示順になります。

mod codecs;
mod serialized;

pub use serialized::unserialize_to_json;

use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};

/// 表示用デコード関数
///
/// 失敗は None（デコード不能）で表現する
pub type ViewFn = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// 保存用エンコード関数
pub type SaveFn = Box<dyn Fn(&[u8]) -> io::Result<Vec<u8>> + Send + Sync>;

/// 二次デコード（整形）関数
pub type FormatterFn = Box<dyn Fn(&[u8]) -> Option<String> + Send + Sync>;

// ====================
// エラー定義
// ====================

/// 変換パイプラインのエラー
///
/// デコード失敗はエラーではなく `Option::None` として表現されるため、
/// ここに現れるのはレジストリの不整合と致命的なエンコード失敗のみ。
#[derive(Debug)]
pub enum TransformError {
    /// 未登録の変換名が要求された（設定とレジストリの不整合）
    TransformNotFound(String),
    /// 未登録のフォーマッタ名が要求された
    FormatterNotFound(String),
    /// エンコード失敗
    ///
    /// 正常な入力では発生しない。発生した場合は書き戻しを中断すべき
    Encode(String, io::Error),
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransformNotFound(name) => write!(f, "Unknown transform: {}", name),
            Self::FormatterNotFound(name) => write!(f, "Unknown formatter: {}", name),
            Self::Encode(name, e) => write!(f, "Encode failed in transform {}: {}", name, e),
        }
    }
}

impl std::error::Error for TransformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Encode(_, e) => Some(e),
            _ => None,
        }
    }
}

/// 変換パイプラインの処理結果
pub type TransformResult<T> = Result<T, TransformError>;

// ====================
// レジストリ
// ====================

/// 変換エントリ
struct TransformEntry {
    name: String,
    view: ViewFn,
    save: SaveFn,
}

/// 名前付き変換・フォーマッタのレジストリ
///
/// 挿入順を保持する。同名の再登録は位置を保ったまま関数を差し替える。
#[derive(Default)]
pub struct TransformRegistry {
    transforms: Vec<TransformEntry>,
    formatters: Vec<(String, FormatterFn)>,
}

impl TransformRegistry {
    /// 空のレジストリを作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// デフォルトの変換・フォーマッタを登録済みのレジストリを作成する
    ///
    /// 変換はいずれも標準の圧縮ワイヤフォーマットとバイト互換:
    ///
    /// | 名前        | 格納形式                                   |
    /// |-------------|--------------------------------------------|
    /// | `zlib`      | zlib コンテナ（deflate + Adler-32）        |
    /// | `gzip`      | gzip コンテナ（ヘッダー + CRC32/ISIZE）    |
    /// | `deflate`   | 生の deflate ストリーム（チェックサムなし）|
    /// | `zlib-auto` | 書き込みは zlib、読み取りは gzip/zlib 自動判別 |
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register_transform(
            "zlib",
            Box::new(codecs::zlib_decompress),
            Box::new(codecs::zlib_compress),
        );
        registry.register_transform(
            "gzip",
            Box::new(codecs::gzip_decompress),
            Box::new(codecs::gzip_compress),
        );
        registry.register_transform(
            "deflate",
            Box::new(codecs::deflate_decompress),
            Box::new(codecs::deflate_compress),
        );
        registry.register_transform(
            "zlib-auto",
            Box::new(codecs::auto_decompress),
            Box::new(codecs::zlib_compress),
        );

        registry.register_formatter("unserialize", Box::new(unserialize_to_json));

        registry
    }

    /// 変換を登録する
    ///
    /// 既存の名前は位置を保ったまま上書きされる
    pub fn register_transform(&mut self, name: &str, view: ViewFn, save: SaveFn) {
        let entry = TransformEntry { name: name.to_string(), view, save };
        match self.transforms.iter_mut().find(|e| e.name == name) {
            Some(existing) => *existing = entry,
            None => self.transforms.push(entry),
        }
    }

    /// フォーマッタを登録する
    ///
    /// 既存の名前は位置を保ったまま上書きされる
    pub fn register_formatter(&mut self, name: &str, formatter: FormatterFn) {
        match self.formatters.iter_mut().find(|(n, _)| n == name) {
            Some(existing) => existing.1 = formatter,
            None => self.formatters.push((name.to_string(), formatter)),
        }
    }

    /// 登録済み変換名（登録順 = 表示順）
    pub fn transform_names(&self) -> impl Iterator<Item = &str> {
        self.transforms.iter().map(|e| e.name.as_str())
    }

    /// 登録済みフォーマッタ名（登録順）
    pub fn formatter_names(&self) -> impl Iterator<Item = &str> {
        self.formatters.iter().map(|(n, _)| n.as_str())
    }

    /// 表示用にデコードする
    ///
    /// デコード不能な入力は `Ok(None)` に縮退する。変換関数内の panic も
    /// 捕捉して `Ok(None)` にするため、呼び出し側で個別のエラー処理は不要。
    /// 未登録の名前のみエラー。
    pub fn decode_for_view(&self, name: &str, raw: &[u8]) -> TransformResult<Option<Vec<u8>>> {
        let entry = self
            .transforms
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| TransformError::TransformNotFound(name.to_string()))?;

        Ok(panic::catch_unwind(AssertUnwindSafe(|| (entry.view)(raw))).unwrap_or(None))
    }

    /// 保存用にエンコードする
    ///
    /// このパスは正常な入力に対して失敗しない前提。失敗した値を
    /// そのまま格納すると復元不能になるため、エラーは呼び出し元へ伝播する。
    pub fn encode_for_save(&self, name: &str, value: &[u8]) -> TransformResult<Vec<u8>> {
        let entry = self
            .transforms
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| TransformError::TransformNotFound(name.to_string()))?;

        (entry.save)(value).map_err(|e| TransformError::Encode(name.to_string(), e))
    }

    /// デコード済みの値にフォーマッタを適用する
    ///
    /// `decode_for_view` と同じ失敗許容の契約
    pub fn apply_formatter(&self, name: &str, decoded: &[u8]) -> TransformResult<Option<String>> {
        let (_, formatter) = self
            .formatters
            .iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| TransformError::FormatterNotFound(name.to_string()))?;

        Ok(panic::catch_unwind(AssertUnwindSafe(|| formatter(decoded))).unwrap_or(None))
    }
}
