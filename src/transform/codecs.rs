//! # 圧縮コーデック
//!
//! デフォルト変換として登録される圧縮・伸長関数群。
//! いずれも `flate2` による標準ワイヤフォーマットで、他言語のクライアントが
//! 書き込んだ値とバイト互換です。
//!
//! - zlib:    RFC 1950（deflate + Adler-32 チェックサム）
//! - gzip:    RFC 1952（マジック `1f 8b` + CRC32/ISIZE トレーラ）
//! - deflate: RFC 1951（生ストリーム、チェックサムなし）
//!
//! 伸長側は失敗許容（`Option`）、圧縮側は `io::Result` を返し、
//! レジストリがそれぞれの契約（縮退／致命的エラー）に変換します。

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
use flate2::Compression;
use std::io;
use std::io::{Read, Write};

/// gzip マジックバイト
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

// ====================
// 圧縮（保存側）
// ====================

/// zlib コンテナに圧縮する
pub fn zlib_compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// gzip コンテナに圧縮する
pub fn gzip_compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// 生の deflate ストリームに圧縮する
pub fn deflate_compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

// ====================
// 伸長（表示側）
// ====================

/// zlib コンテナを伸長する
///
/// チェックサム不一致を含め、あらゆる失敗は None
pub fn zlib_decompress(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}

/// gzip コンテナを伸長する
pub fn gzip_decompress(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}

/// 生の deflate ストリームを伸長する
pub fn deflate_decompress(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}

/// コンテナ形式を自動判別して伸長する
///
/// 先頭の gzip マジックで判別し、それ以外は zlib として扱う。
/// 生 deflate は受け付けない（判別不能なため）。
pub fn auto_decompress(data: &[u8]) -> Option<Vec<u8>> {
    if data.starts_with(&GZIP_MAGIC) {
        gzip_decompress(data)
    } else {
        zlib_decompress(data)
    }
}
