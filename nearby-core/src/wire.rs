//! Framing: 1 byte kind length + UTF-8 kind + opaque payload.
//!
//! The legacy control envelope prefixes three counted strings (identifier,
//! command, class name) before a JSON payload. Both variants are produced and
//! parsed here; neither looks inside the payload.

use uuid::Uuid;

/// Longest kind tag that fits the one-byte length prefix.
pub const MAX_KIND_LEN: usize = u8::MAX as usize;

const MIN_FRAME_LEN: usize = 2;
const LEGACY_STRING_COUNT: u8 = 3;

/// A decoded single-tag frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedMessage {
    pub kind: String,
    pub payload: Vec<u8>,
}

impl FramedMessage {
    pub fn new(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameEncodeError> {
        encode_frame(&self.kind, &self.payload)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_frame(bytes)
    }
}

/// Encode `kind` and `payload` into a single frame.
pub fn encode_frame(kind: &str, payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let kind_bytes = kind.as_bytes();
    if kind_bytes.is_empty() {
        return Err(FrameEncodeError::EmptyKind);
    }
    if kind_bytes.len() > MAX_KIND_LEN {
        return Err(FrameEncodeError::KindTooLong(kind_bytes.len()));
    }
    let mut out = Vec::with_capacity(1 + kind_bytes.len() + payload.len());
    out.push(kind_bytes.len() as u8);
    out.extend_from_slice(kind_bytes);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode one single-tag frame. The whole buffer is the frame; everything after
/// the kind is payload.
pub fn decode_frame(bytes: &[u8]) -> Result<FramedMessage, DecodeError> {
    let kind = peek_kind(bytes)?;
    let payload = bytes[1 + kind.len()..].to_vec();
    Ok(FramedMessage {
        kind: kind.to_owned(),
        payload,
    })
}

/// Read only the kind tag of a frame without copying the payload.
pub fn peek_kind(bytes: &[u8]) -> Result<&str, DecodeError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(DecodeError::TooShort(bytes.len()));
    }
    let kind_len = bytes[0] as usize;
    let remaining = bytes.len() - 1;
    if kind_len > remaining {
        return Err(DecodeError::KindLengthOverflow {
            declared: kind_len,
            remaining,
        });
    }
    std::str::from_utf8(&bytes[1..1 + kind_len]).map_err(|_| DecodeError::UndecodableKind)
}

/// Legacy request/response envelope used by the older system messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyEnvelope {
    pub identifier: String,
    pub command: String,
    pub class_name: String,
    pub payload: Vec<u8>,
}

impl LegacyEnvelope {
    /// New envelope with a fresh UUID identifier.
    pub fn new(command: impl Into<String>, class_name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            identifier: Uuid::new_v4().to_string().to_uppercase(),
            command: command.into(),
            class_name: class_name.into(),
            payload,
        }
    }

    /// Class name without any module prefix (`Module.Type` -> `Type`).
    pub fn moduleless_class_name(&self) -> &str {
        self.class_name
            .rsplit('.')
            .next()
            .unwrap_or(&self.class_name)
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameEncodeError> {
        let strings = [&self.identifier, &self.command, &self.class_name];
        let mut out = Vec::with_capacity(
            1 + strings.iter().map(|s| 1 + s.len()).sum::<usize>() + self.payload.len(),
        );
        out.push(LEGACY_STRING_COUNT);
        for s in strings {
            if s.len() > MAX_KIND_LEN {
                return Err(FrameEncodeError::KindTooLong(s.len()));
            }
            out.push(s.len() as u8);
            out.extend_from_slice(s.as_bytes());
        }
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(DecodeError::TooShort(bytes.len()));
        }
        let count = bytes[0];
        if count < LEGACY_STRING_COUNT {
            return Err(DecodeError::MissingField(count));
        }
        let mut offset = 1usize;
        let mut strings = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let Some(&len) = bytes.get(offset) else {
                return Err(DecodeError::TooShort(bytes.len()));
            };
            let len = len as usize;
            let start = offset + 1;
            let remaining = bytes.len() - start;
            if len > remaining {
                return Err(DecodeError::KindLengthOverflow {
                    declared: len,
                    remaining,
                });
            }
            let s = std::str::from_utf8(&bytes[start..start + len])
                .map_err(|_| DecodeError::UndecodableKind)?;
            strings.push(s.to_owned());
            offset = start + len;
        }
        let mut strings = strings.into_iter();
        let (Some(identifier), Some(command), Some(class_name)) =
            (strings.next(), strings.next(), strings.next())
        else {
            return Err(DecodeError::MissingField(count));
        };
        Ok(Self {
            identifier,
            command,
            class_name,
            payload: bytes[offset..].to_vec(),
        })
    }
}

/// Error encoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("kind is empty")]
    EmptyKind,
    #[error("kind is {0} bytes, limit is 255")]
    KindTooLong(usize),
    #[error("payload encode failed: {0}")]
    Payload(String),
}

/// Error decoding a frame or the message inside it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),
    #[error("declared kind length {declared} exceeds remaining {remaining} bytes")]
    KindLengthOverflow { declared: usize, remaining: usize },
    #[error("kind is not valid UTF-8")]
    UndecodableKind,
    #[error("unknown message kind {0:?}")]
    UnknownKind(String),
    #[error("payload for {kind:?} failed to decode: {reason}")]
    PayloadDecodeFailed { kind: String, reason: String },
    #[error("legacy envelope carries {0} strings, expected 3")]
    MissingField(u8),
}

impl DecodeError {
    /// Framing errors mean the envelope itself is malformed.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            DecodeError::TooShort(_)
                | DecodeError::KindLengthOverflow { .. }
                | DecodeError::UndecodableKind
                | DecodeError::MissingField(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn roundtrip_simple() {
        let frame = encode_frame("pair", br#"{"info":{}}"#).unwrap();
        assert_eq!(frame[0], 4);
        assert_eq!(&frame[1..5], b"pair");
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.kind, "pair");
        assert_eq!(decoded.payload, br#"{"info":{}}"#);
    }

    #[test]
    fn empty_payload_is_allowed() {
        let frame = encode_frame("x", &[]).unwrap();
        assert_eq!(frame, vec![1, b'x']);
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.kind, "x");
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn encode_rejects_bad_kinds() {
        assert_eq!(encode_frame("", b"{}"), Err(FrameEncodeError::EmptyKind));
        let long = "k".repeat(256);
        assert_eq!(
            encode_frame(&long, b"{}"),
            Err(FrameEncodeError::KindTooLong(256))
        );
        assert!(encode_frame(&"k".repeat(255), b"").is_ok());
    }

    #[test]
    fn malformed_frames() {
        assert_eq!(decode_frame(&[]), Err(DecodeError::TooShort(0)));
        assert_eq!(decode_frame(&[3]), Err(DecodeError::TooShort(1)));
        assert_eq!(
            decode_frame(&[5, b'a', b'b']),
            Err(DecodeError::KindLengthOverflow {
                declared: 5,
                remaining: 2
            })
        );
        assert_eq!(
            decode_frame(&[2, 0xff, 0xfe, b'{']),
            Err(DecodeError::UndecodableKind)
        );
    }

    #[test]
    fn legacy_layout_is_byte_exact() {
        let env = LegacyEnvelope {
            identifier: "ID".into(),
            command: "*system-ping*".into(),
            class_name: "Nearby.NearbySystemMessage".into(),
            payload: br#"{"kind":"*system-ping*"}"#.to_vec(),
        };
        let bytes = env.encode().unwrap();
        let mut expected = vec![3u8, 2, b'I', b'D', 13];
        expected.extend_from_slice(b"*system-ping*");
        expected.push(26);
        expected.extend_from_slice(b"Nearby.NearbySystemMessage");
        expected.extend_from_slice(br#"{"kind":"*system-ping*"}"#);
        assert_eq!(bytes, expected);
        assert_eq!(LegacyEnvelope::decode(&bytes).unwrap(), env);
        assert_eq!(env.moduleless_class_name(), "NearbySystemMessage");
    }

    #[test]
    fn legacy_rejects_truncated() {
        let env = LegacyEnvelope::new("*dictionary*", "Nearby.DictionaryMessage", b"{}".to_vec());
        let bytes = env.encode().unwrap();
        assert!(LegacyEnvelope::decode(&bytes[..10]).is_err());
        assert_eq!(
            LegacyEnvelope::decode(&[2, 1, b'a', 1, b'b']),
            Err(DecodeError::MissingField(2))
        );
    }

    proptest! {
        #[test]
        fn roundtrip_any_valid_kind(
            kind in "[a-zA-Z0-9*_\\-é]{1,60}",
            payload in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            prop_assume!(kind.len() <= MAX_KIND_LEN);
            let frame = encode_frame(&kind, &payload).unwrap();
            let decoded = decode_frame(&frame).unwrap();
            prop_assert_eq!(decoded.kind, kind);
            prop_assert_eq!(decoded.payload, payload);
        }

        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..300)) {
            let _ = decode_frame(&bytes);
            let _ = LegacyEnvelope::decode(&bytes);
        }

        #[test]
        fn overflowing_length_is_rejected(len in 2u8..=255, body in proptest::collection::vec(any::<u8>(), 0..2)) {
            let mut bytes = vec![len];
            bytes.extend_from_slice(&body);
            if bytes.len() >= 2 {
                let is_overflow = matches!(
                    decode_frame(&bytes),
                    Err(DecodeError::KindLengthOverflow { .. })
                );
                prop_assert!(is_overflow);
            }
        }
    }
}
