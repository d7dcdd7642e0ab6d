use crate::error::{Error, Result};

/// Build the bytes an initiator writes to its peer.
///
/// - A message alone is sent as-is.
/// - A size alone yields `size` bytes of a deterministic pattern.
/// - Both repeat the message until `size` bytes are filled, truncating the
///   last repetition.
///
/// Empty payloads are rejected: a zero-length region cannot be registered.
pub fn build_payload(message: Option<&str>, size: Option<usize>) -> Result<Vec<u8>> {
    let payload = match (message.map(str::as_bytes), size) {
        (Some(msg), Some(size)) if !msg.is_empty() => {
            msg.iter().copied().cycle().take(size).collect()
        }
        (Some(msg), None) => msg.to_vec(),
        (None, Some(size)) => (0..size).map(|i| (i % 251) as u8).collect(),
        (Some(_), Some(_)) => Vec::new(),
        (None, None) => {
            return Err(Error::Config(
                "either a message or a payload size is required".into(),
            ))
        }
    };

    if payload.is_empty() {
        return Err(Error::Config("payload must not be empty".into()));
    }
    if u32::try_from(payload.len()).is_err() {
        return Err(Error::Config(format!(
            "payload of {} bytes is too large",
            payload.len()
        )));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_fills_size() {
        assert_eq!(build_payload(Some("AB"), Some(5)).unwrap(), b"ABABA");
        assert_eq!(build_payload(Some("AAAA"), None).unwrap(), b"AAAA");
        assert_eq!(build_payload(Some("hello"), Some(2)).unwrap(), b"he");
    }

    #[test]
    fn size_alone_is_patterned() {
        let payload = build_payload(None, Some(1 << 20)).unwrap();
        assert_eq!(payload.len(), 1 << 20);
        assert_eq!(payload[250], 250);
        assert_eq!(payload[251], 0);
    }

    #[test]
    fn empty_payloads_are_rejected() {
        assert!(matches!(build_payload(None, None), Err(Error::Config(_))));
        assert!(build_payload(Some(""), None).is_err());
        assert!(build_payload(None, Some(0)).is_err());
        assert!(build_payload(Some(""), Some(8)).is_err());
    }
}
