//! Incremental UTF-8 decoding of process output.

use std::char::REPLACEMENT_CHARACTER;

/// Decodes a byte stream read in arbitrary pieces.
///
/// A multi-byte sequence cut by a read boundary is carried over to the next
/// call instead of being replaced. Bytes that can never form valid UTF-8 are
/// replaced with U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.carry);
        input.extend_from_slice(bytes);

        let mut out = String::with_capacity(input.len());
        let mut rest = input.as_slice();

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    if let Ok(valid) = std::str::from_utf8(valid) {
                        out.push_str(valid);
                    }
                    match err.error_len() {
                        Some(len) => {
                            out.push(REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            // Incomplete sequence at the end: wait for more bytes.
                            self.carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush a sequence left incomplete at end of stream.
    pub fn finish(&mut self) -> String {
        let carry = std::mem::take(&mut self.carry);
        String::from_utf8_lossy(&carry).into_owned()
    }

    pub fn has_pending(&self) -> bool {
        !self.carry.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passthrough() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"hello"), "hello");
        assert!(!decoder.has_pending());
    }

    #[test]
    fn test_split_multibyte_sequence() {
        let bytes = "héllo → 世界".as_bytes();
        for split in 0..=bytes.len() {
            let mut decoder = Utf8Decoder::new();
            let mut out = decoder.decode(&bytes[..split]);
            out.push_str(&decoder.decode(&bytes[split..]));
            out.push_str(&decoder.finish());
            assert_eq!(out, "héllo → 世界", "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let text = "<think>🤔</think>ok";
        let mut decoder = Utf8Decoder::new();
        let mut out = String::new();
        for byte in text.as_bytes() {
            out.push_str(&decoder.decode(std::slice::from_ref(byte)));
        }
        assert_eq!(out, text);
    }

    #[test]
    fn test_invalid_bytes_are_replaced() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn test_truncated_sequence_at_end() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"x\xe4\xb8"), "x");
        assert!(decoder.has_pending());
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert!(!decoder.has_pending());
    }
}
