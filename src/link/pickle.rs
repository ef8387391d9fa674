// Value <-> wire-safe bytes, via serde_json.
//
// JSON escapes NUL and every control byte, so the encoded stream is
// structurally zero-free; ASCII payloads stay 7-bit clean. Non-ASCII
// output is rejected in 7-bit mode rather than mangled — code points
// past 0x7F need the 8-bit link build.

use alloc::vec::Vec;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::LinkError;

/// Encode a value for transmission. `seven_bit` matches the link's
/// character width.
pub fn encode<T: Serialize>(value: &T, seven_bit: bool) -> Result<Vec<u8>, LinkError> {
    let bytes = serde_json::to_vec(value).map_err(|_| LinkError::Encode)?;
    if bytes.contains(&0) || (seven_bit && !bytes.is_ascii()) {
        return Err(LinkError::Encode);
    }
    Ok(bytes)
}

/// Decode one received message.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, LinkError> {
    serde_json::from_slice(bytes).map_err(|_| LinkError::Decode)
}

#[cfg(test)]
mod tests {
    use alloc::string::String;

    use serde_json::json;

    use super::*;

    #[test]
    fn round_trip() {
        let v = json!({"x": 1, "y": [2, 3]});
        let bytes = encode(&v, true).unwrap();
        assert!(bytes.is_ascii());
        assert!(!bytes.contains(&0));
        let back: serde_json::Value = decode(&bytes).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn non_ascii_needs_eight_bit_mode() {
        let v = String::from("grüß");
        assert_eq!(encode(&v, true), Err(LinkError::Encode));
        let bytes = encode(&v, false).unwrap();
        assert!(!bytes.contains(&0));
        let back: String = decode(&bytes).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn garbage_does_not_decode() {
        assert_eq!(decode::<u32>(b"not json"), Err(LinkError::Decode));
    }
}
