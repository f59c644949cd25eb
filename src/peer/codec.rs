use crate::error::CodecError;
use crate::peer::types::SdpPayload;
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

// Ограничиваем размер распаковываемых данных до 256 KiB
const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024;

pub fn enc(p: &SdpPayload) -> Result<String, CodecError> {
    // 1. JSON -> bytes
    let json = serde_json::to_vec(p)?;

    // 2. GZIP compress
    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json)?;
    let compressed = gz.finish()?;

    // 3. base64
    Ok(general_purpose::STANDARD.encode(compressed))
}

pub fn dec(s: &str) -> Result<SdpPayload, CodecError> {
    // 1. base64 -> bytes
    let compressed = general_purpose::STANDARD.decode(s)?;

    // 2. gunzip с ограничением размера для защиты от zip-bomb
    let gz = GzDecoder::new(&compressed[..]);
    let mut json = Vec::new();
    let mut limited_reader = gz.take(MAX_DECOMPRESSED_SIZE + 1);
    limited_reader.read_to_end(&mut json)?;
    if json.len() as u64 > MAX_DECOMPRESSED_SIZE {
        return Err(CodecError::TooLarge {
            limit: MAX_DECOMPRESSED_SIZE,
        });
    }

    // 3. JSON -> struct
    Ok(serde_json::from_slice(&json)?)
}

/// Декодирует payload и проверяет, что он относится к ожидаемой сессии
pub fn dec_for_session(s: &str, session_id: &str) -> Result<SdpPayload, CodecError> {
    let payload = dec(s)?;
    if payload.id != session_id {
        return Err(CodecError::SessionMismatch {
            expected: session_id.to_string(),
            found: payload.id,
        });
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::{SdpKind, SessionDescription};

    fn payload(id: &str, sdp: String) -> SdpPayload {
        SdpPayload {
            sdp: SessionDescription {
                kind: SdpKind::Offer,
                sdp,
            },
            id: id.into(),
            ts: 1_700_000_000,
        }
    }

    #[test]
    fn encoded_payload_decodes_for_its_session() {
        let original = payload("abc", "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n".into());
        let wire = enc(&original).unwrap();
        let decoded = dec_for_session(&wire, "abc").unwrap();
        assert_eq!(decoded.sdp, original.sdp);
        assert_eq!(decoded.ts, original.ts);
    }

    #[test]
    fn payload_from_other_session_is_rejected() {
        let wire = enc(&payload("old", "v=0".into())).unwrap();
        assert!(matches!(
            dec_for_session(&wire, "new"),
            Err(CodecError::SessionMismatch { .. })
        ));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        // хорошо сжимается, но после распаковки больше лимита
        let wire = enc(&payload("big", "a".repeat(300 * 1024))).unwrap();
        assert!(matches!(dec(&wire), Err(CodecError::TooLarge { .. })));
    }

    #[test]
    fn garbage_is_not_base64() {
        assert!(matches!(dec("%%%"), Err(CodecError::Base64(_))));
    }
}
