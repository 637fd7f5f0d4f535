use crate::error::PayloadError;
use crate::peer::types::{DescriptionKind, SessionDescription};
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::Deserialize;
use std::io::{Read, Write};

/// Ограничение на размер JSON, в том числе после распаковки
const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024;

/// JSON-представление для отправки через ретранслятор
pub fn encode(desc: &SessionDescription) -> Result<String, PayloadError> {
    Ok(serde_json::to_string(desc)?)
}

/// JSON -> gzip -> base64, для ручного копирования
pub fn encode_compact(desc: &SessionDescription) -> Result<String, PayloadError> {
    let json = serde_json::to_vec(desc)?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json).map_err(PayloadError::Gzip)?;
    let compressed = gz.finish().map_err(PayloadError::Gzip)?;

    Ok(general_purpose::STANDARD.encode(compressed))
}

/// Разбирает описание в любой из двух форм и проверяет его форму
pub fn decode(text: &str, expected: DescriptionKind) -> Result<SessionDescription, PayloadError> {
    let json = to_json_bytes(text)?;
    let desc: SessionDescription = serde_json::from_slice(&json)?;

    if desc.kind != expected {
        return Err(PayloadError::KindMismatch {
            expected: expected.to_string(),
            actual: desc.kind.to_string(),
        });
    }
    if desc.role != desc.kind.sender_role() {
        return Err(PayloadError::RoleMismatch {
            kind: desc.kind.to_string(),
            role: format!("{:?}", desc.role).to_lowercase(),
        });
    }
    if !desc.sdp.trim_start().starts_with("v=") {
        return Err(PayloadError::EmptySdp);
    }
    Ok(desc)
}

#[derive(Deserialize)]
struct KindOnly {
    kind: DescriptionKind,
}

/// Быстрая классификация входящего сообщения без полной проверки
pub fn peek_kind(text: &str) -> Option<DescriptionKind> {
    let json = to_json_bytes(text).ok()?;
    serde_json::from_slice::<KindOnly>(&json).ok().map(|k| k.kind)
}

fn to_json_bytes(text: &str) -> Result<Vec<u8>, PayloadError> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        if trimmed.len() as u64 > MAX_DECOMPRESSED_SIZE {
            return Err(PayloadError::TooLarge(MAX_DECOMPRESSED_SIZE));
        }
        return Ok(trimmed.as_bytes().to_vec());
    }

    // 1. base64 -> bytes
    let compressed = general_purpose::STANDARD.decode(trimmed)?;

    // 2. gunzip с ограничением размера
    let gz = GzDecoder::new(&compressed[..]);
    let mut json = Vec::new();
    let mut limited_reader = gz.take(MAX_DECOMPRESSED_SIZE + 1);
    limited_reader
        .read_to_end(&mut json)
        .map_err(PayloadError::Gzip)?;
    if json.len() as u64 > MAX_DECOMPRESSED_SIZE {
        return Err(PayloadError::TooLarge(MAX_DECOMPRESSED_SIZE));
    }
    Ok(json)
}
