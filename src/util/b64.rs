use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;

/// Encodes raw bytes into the base64 string carried in the payment header.
pub fn encode_header<T: AsRef<[u8]>>(input: T) -> String {
    b64.encode(input.as_ref())
}

/// Decodes a payment header value back into raw bytes.
pub fn decode_header(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    b64.decode(input.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let payload = br#"{"nonce":"7"}"#;
        let encoded = encode_header(payload);
        assert_eq!(decode_header(&encoded).unwrap(), payload.to_vec());
    }

    #[test]
    fn test_decode_trims_whitespace() {
        let encoded = format!(" {} ", encode_header(b"abc"));
        assert_eq!(decode_header(&encoded).unwrap(), b"abc".to_vec());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_header("not//valid==base64!").is_err());
    }
}
