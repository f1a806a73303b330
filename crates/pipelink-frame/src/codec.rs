use bytes::{BufMut, BytesMut};

/// Frame header: payload length as an 8-byte little-endian unsigned integer.
pub const HEADER_SIZE: usize = 8;

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// +------------------+------------------+
/// | Length (8B LE)   | Payload          |
/// |                  | (Length bytes)   |
/// +------------------+------------------+
/// ```
///
/// No magic number, version, or checksum: each direction of a link is a
/// private ordered stream between exactly two endpoints.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u64_le(payload.len() as u64);
    dst.put_slice(payload);
}

/// Decode a frame header into the declared payload length.
pub fn decode_header(header: [u8; HEADER_SIZE]) -> u64 {
    u64::from_le_bytes(header)
}

/// Configuration for the framed transport.
#[derive(Debug, Clone, Default)]
pub struct FrameConfig {
    /// Maximum accepted payload length in bytes. `None` means unbounded.
    ///
    /// When set, a header declaring a larger length closes the connection
    /// and fails the receive. This is the defense against malformed headers.
    pub max_frame_len: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_prepends_little_endian_length() {
        let mut buf = BytesMut::new();
        encode_frame(b"hello", &mut buf);

        assert_eq!(buf.len(), HEADER_SIZE + 5);
        assert_eq!(&buf[..HEADER_SIZE], &[5, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&buf[HEADER_SIZE..], b"hello");
    }

    #[test]
    fn encode_empty_payload() {
        let mut buf = BytesMut::new();
        encode_frame(b"", &mut buf);

        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(decode_header(buf[..].try_into().unwrap()), 0);
    }

    #[test]
    fn header_roundtrip() {
        let mut buf = BytesMut::new();
        encode_frame(&vec![0xAB; 300], &mut buf);

        let len = decode_header(buf[..HEADER_SIZE].try_into().unwrap());
        assert_eq!(len, 300);
    }

    #[test]
    fn default_config_is_unbounded() {
        assert!(FrameConfig::default().max_frame_len.is_none());
    }
}
