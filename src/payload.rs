//! Probe payload: the publish time as decimal nanoseconds since the UNIX epoch.
//!
//! The payload is both the correlation key and the timing data, so nothing else
//! is carried. Anything that does not parse is foreign traffic on the topic.

use bytes::Bytes;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload is not UTF-8")]
    NotUtf8,
    #[error("payload {0:?} is not an integer timestamp")]
    NotAnInteger(String),
}

pub fn encode_timestamp(unix_ns: i64) -> Bytes {
    Bytes::from(unix_ns.to_string())
}

pub fn parse_timestamp(payload: &[u8]) -> Result<i64, PayloadError> {
    let text = std::str::from_utf8(payload).map_err(|_| PayloadError::NotUtf8)?;
    text.parse::<i64>().map_err(|_| {
        // Keep log lines bounded when someone publishes large blobs on the topic.
        let shown: String = text.chars().take(32).collect();
        PayloadError::NotAnInteger(shown)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_what_it_encodes() {
        let ts = 1_700_000_000_123_456_789i64;
        assert_eq!(parse_timestamp(&encode_timestamp(ts)).unwrap(), ts);
        assert_eq!(encode_timestamp(42).as_ref(), b"42");
    }

    #[test]
    fn rejects_foreign_payloads() {
        assert_eq!(
            parse_timestamp(b"hello"),
            Err(PayloadError::NotAnInteger("hello".into()))
        );
        assert!(parse_timestamp(b"").is_err());
        assert!(parse_timestamp(b" 42").is_err());
        assert!(parse_timestamp(b"1.5").is_err());
        assert!(parse_timestamp(b"99999999999999999999").is_err());
        assert_eq!(parse_timestamp(&[0xff, 0xfe]), Err(PayloadError::NotUtf8));
    }

    #[test]
    fn long_garbage_is_truncated_in_error() {
        let blob = "x".repeat(500);
        match parse_timestamp(blob.as_bytes()) {
            Err(PayloadError::NotAnInteger(shown)) => assert_eq!(shown.len(), 32),
            other => panic!("unexpected {:?}", other),
        }
    }
}
