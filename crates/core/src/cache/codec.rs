// Copyright © 2026 Kirky.X
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::Cursor;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::types::{CacheValue, CoreError, Result};

const ENVELOPE_MAGIC: u8 = 0xC5;
const ENVELOPE_VERSION: u8 = 1;
const HEADER_LEN: usize = 3;
const CRC_LEN: usize = 4;

pub const TAG_JSON: u8 = b'J';
pub const TAG_MSGPACK: u8 = b'M';
pub const TAG_RAW: u8 = b'R';

/// 单一编码格式。`encode` 返回 None 表示该格式不处理这类值
pub trait Codec: Send + Sync {
    fn tag(&self) -> u8;
    fn name(&self) -> &'static str;
    fn encode(&self, value: &CacheValue) -> Result<Option<Vec<u8>>>;
    fn decode(&self, payload: &[u8]) -> Result<CacheValue>;
}

/// 结构化文本编码，处理基本类型和集合
#[derive(Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn tag(&self) -> u8 {
        TAG_JSON
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &CacheValue) -> Result<Option<Vec<u8>>> {
        match value {
            CacheValue::Json(json) => Ok(Some(serde_json::to_vec(json)?)),
            CacheValue::Binary(_) => Ok(None),
        }
    }

    fn decode(&self, payload: &[u8]) -> Result<CacheValue> {
        Ok(CacheValue::Json(serde_json::from_slice(payload)?))
    }
}

/// 二进制编码（MessagePack），作为不透明对象的兜底格式
#[derive(Debug, Default)]
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// 无信封的旧数据：要求整段输入恰好是一个 MessagePack 值
    fn decode_strict(payload: &[u8]) -> Result<CacheValue> {
        let mut cursor = Cursor::new(payload);
        let value = {
            let mut de = rmp_serde::Deserializer::new(&mut cursor);
            serde_json::Value::deserialize(&mut de)?
        };
        if cursor.position() as usize != payload.len() {
            return Err(CoreError::Serialization(
                "trailing bytes after msgpack value".to_string(),
            ));
        }
        Ok(CacheValue::Json(value))
    }
}

impl Codec for MsgPackCodec {
    fn tag(&self) -> u8 {
        TAG_MSGPACK
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode(&self, value: &CacheValue) -> Result<Option<Vec<u8>>> {
        Ok(Some(rmp_serde::to_vec_named(value)?))
    }

    fn decode(&self, payload: &[u8]) -> Result<CacheValue> {
        match rmp_serde::from_slice::<CacheValue>(payload) {
            Ok(value) => Ok(value),
            Err(_) => Self::decode_strict(payload),
        }
    }
}

/// 原始字节：UTF-8 文本还原为字符串，否则保留为二进制
#[derive(Debug, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn tag(&self) -> u8 {
        TAG_RAW
    }

    fn name(&self) -> &'static str {
        "raw"
    }

    fn encode(&self, value: &CacheValue) -> Result<Option<Vec<u8>>> {
        match value {
            CacheValue::Binary(bytes) => Ok(Some(bytes.clone())),
            CacheValue::Json(_) => Ok(None),
        }
    }

    fn decode(&self, payload: &[u8]) -> Result<CacheValue> {
        match std::str::from_utf8(payload) {
            Ok(text) => Ok(CacheValue::Json(serde_json::Value::String(text.to_string()))),
            Err(_) => Ok(CacheValue::Binary(payload.to_vec())),
        }
    }
}

/// 有序的编解码链，写入带版本信封：
/// `[magic][version][tag][payload][crc32 LE]`
///
/// 读取时按标签分派；没有信封的旧数据依次尝试 结构化 → 二进制 → 原始字符串。
#[derive(Clone)]
pub struct CodecChain {
    codecs: Vec<Arc<dyn Codec>>,
}

impl std::fmt::Debug for CodecChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecChain")
            .field(
                "codecs",
                &self.codecs.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for CodecChain {
    fn default() -> Self {
        Self::new(vec![
            Arc::new(JsonCodec),
            Arc::new(MsgPackCodec),
            Arc::new(RawCodec),
        ])
    }
}

impl CodecChain {
    pub fn new(codecs: Vec<Arc<dyn Codec>>) -> Self {
        Self { codecs }
    }

    pub fn encode(&self, value: &CacheValue) -> Result<Vec<u8>> {
        for codec in &self.codecs {
            if let Some(payload) = codec.encode(value)? {
                let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
                bytes.push(ENVELOPE_MAGIC);
                bytes.push(ENVELOPE_VERSION);
                bytes.push(codec.tag());
                bytes.extend_from_slice(&payload);
                let checksum = crc32fast::hash(&bytes);
                bytes.extend_from_slice(&checksum.to_le_bytes());
                return Ok(bytes);
            }
        }
        Err(CoreError::Serialization(
            "no codec accepted the value".to_string(),
        ))
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<CacheValue> {
        if Self::has_envelope(bytes) {
            return self.decode_envelope(bytes);
        }
        self.decode_legacy(bytes)
    }

    fn has_envelope(bytes: &[u8]) -> bool {
        bytes.len() >= HEADER_LEN + CRC_LEN
            && bytes[0] == ENVELOPE_MAGIC
            && bytes[1] == ENVELOPE_VERSION
    }

    fn decode_envelope(&self, bytes: &[u8]) -> Result<CacheValue> {
        let (body, stored_crc) = bytes.split_at(bytes.len() - CRC_LEN);
        let mut crc = [0u8; CRC_LEN];
        crc.copy_from_slice(stored_crc);
        if crc32fast::hash(body) != u32::from_le_bytes(crc) {
            return Err(CoreError::Serialization(
                "CRC32 verification failed".to_string(),
            ));
        }

        let tag = body[2];
        let payload = &body[HEADER_LEN..];
        let codec = self
            .codecs
            .iter()
            .find(|c| c.tag() == tag)
            .ok_or_else(|| CoreError::Serialization(format!("unknown format tag {:#04x}", tag)))?;
        codec.decode(payload)
    }

    fn decode_legacy(&self, bytes: &[u8]) -> Result<CacheValue> {
        if let Ok(value) = JsonCodec.decode(bytes) {
            return Ok(value);
        }
        if Self::may_be_msgpack(bytes) {
            if let Ok(value) = MsgPackCodec::decode_strict(bytes) {
                debug!("Decoded legacy entry as msgpack");
                return Ok(value);
            }
        }
        RawCodec.decode(bytes)
    }

    /// 以 fixint 开头的单字节 MessagePack 和单个 ASCII 字符无法区分，按原始字符串处理
    fn may_be_msgpack(bytes: &[u8]) -> bool {
        matches!(bytes.first().copied(), Some(0x80..=0xdf))
    }
}
