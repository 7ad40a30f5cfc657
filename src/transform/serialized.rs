//! # レガシーシリアライズ形式のフォーマッタ
//!
//! PHP の `serialize()` が生成するテキスト形式をパースし、JSON 文字列として
//! 再出力します。PHP 製アプリケーションがキャッシュに書き込んだ値を
//! 人間が読める形で表示するための二次デコーダです。
//!
//! ## 対応する型
//!
//! ```text
//! N;                null
//! b:0; / b:1;       真偽値
//! i:123;            整数
//! d:1.5;            浮動小数点（INF/NAN は対象外）
//! s:3:"abc";        文字列（長さはバイト数）
//! a:2:{...}         配列（連番キーなら JSON 配列、それ以外は JSON オブジェクト）
//! ```
//!
//! オブジェクト（`O:`）はクラス復元を伴うため受け付けません。
//! フォーマッタの契約に従い、トップレベルが配列でない値・パース失敗・
//! 末尾のゴミはすべて None に縮退します。

use serde_json::{Map, Number, Value};

/// シリアライズ済みバイト列を JSON 文字列に変換する
///
/// トップレベルが配列（`a:`）の場合のみ Some を返す
pub fn unserialize_to_json(raw: &[u8]) -> Option<String> {
    let mut parser = Parser { input: raw, pos: 0 };
    let value = parser.parse_value()?;

    // 末尾にゴミが残っていれば不正な入力として扱う
    if parser.pos != parser.input.len() {
        return None;
    }

    // 配列以外のスカラーは整形対象外
    match &value {
        Value::Array(_) | Value::Object(_) => serde_json::to_string(&value).ok(),
        _ => None,
    }
}

/// 再帰下降パーサ
struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn parse_value(&mut self) -> Option<Value> {
        match self.peek()? {
            b'N' => {
                self.expect(b"N;")?;
                Some(Value::Null)
            }
            b'b' => {
                self.expect(b"b:")?;
                let flag = match self.next()? {
                    b'0' => false,
                    b'1' => true,
                    _ => return None,
                };
                self.expect(b";")?;
                Some(Value::Bool(flag))
            }
            b'i' => {
                self.expect(b"i:")?;
                let n: i64 = self.read_until(b';')?.parse().ok()?;
                Some(Value::Number(n.into()))
            }
            b'd' => {
                self.expect(b"d:")?;
                let f: f64 = self.read_until(b';')?.parse().ok()?;
                // NaN / Inf は JSON で表現できない
                Some(Value::Number(Number::from_f64(f)?))
            }
            b's' => {
                let s = self.parse_string()?;
                Some(Value::String(s))
            }
            b'a' => self.parse_array(),
            // O:（オブジェクト）を含むその他は受け付けない
            _ => None,
        }
    }

    /// `s:<len>:"<bytes>";` をパースする
    fn parse_string(&mut self) -> Option<String> {
        self.expect(b"s:")?;
        let len: usize = self.read_until(b':')?.parse().ok()?;
        self.expect(b"\"")?;
        let bytes = self.take(len)?;
        // JSON 化できるのは UTF-8 のみ
        let s = std::str::from_utf8(bytes).ok()?.to_string();
        self.expect(b"\";")?;
        Some(s)
    }

    /// `a:<count>:{ key value ... }` をパースする
    ///
    /// キーが 0 からの連番なら JSON 配列、それ以外は JSON オブジェクト
    fn parse_array(&mut self) -> Option<Value> {
        self.expect(b"a:")?;
        let count: usize = self.read_until(b':')?.parse().ok()?;
        self.expect(b"{")?;

        let mut pairs: Vec<(Value, Value)> = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let key = match self.peek()? {
                b'i' => {
                    self.expect(b"i:")?;
                    let n: i64 = self.read_until(b';')?.parse().ok()?;
                    Value::Number(n.into())
                }
                b's' => Value::String(self.parse_string()?),
                // 配列キーは整数か文字列のみ
                _ => return None,
            };
            let value = self.parse_value()?;
            pairs.push((key, value));
        }
        self.expect(b"}")?;

        let is_list = pairs
            .iter()
            .enumerate()
            .all(|(i, (k, _))| k.as_i64() == Some(i as i64));

        if is_list {
            Some(Value::Array(pairs.into_iter().map(|(_, v)| v).collect()))
        } else {
            let mut map = Map::with_capacity(pairs.len());
            for (key, value) in pairs {
                let key = match key {
                    Value::String(s) => s,
                    // 整数キーは文字列化する（JSON オブジェクトのキーは文字列のみ）
                    Value::Number(n) => n.to_string(),
                    _ => return None,
                };
                map.insert(key, value);
            }
            Some(Value::Object(map))
        }
    }

    // ====================
    // 低レベルヘルパー
    // ====================

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn expect(&mut self, literal: &[u8]) -> Option<()> {
        if self.input[self.pos..].starts_with(literal) {
            self.pos += literal.len();
            Some(())
        } else {
            None
        }
    }

    /// 区切り文字までを UTF-8 文字列として読み、区切り文字を消費する
    fn read_until(&mut self, delimiter: u8) -> Option<&'a str> {
        let rest = &self.input[self.pos..];
        let idx = rest.iter().position(|&b| b == delimiter)?;
        let s = std::str::from_utf8(&rest[..idx]).ok()?;
        self.pos += idx + 1;
        Some(s)
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        if end > self.input.len() {
            return None;
        }
        let bytes = &self.input[self.pos..end];
        self.pos = end;
        Some(bytes)
    }
}
