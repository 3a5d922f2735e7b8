use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

// Upper bound for the handshake packet payload (excluding the length varint).
// Vanilla is tiny (<300 bytes), but Forge markers and RealIP suffixes ride in
// the address field, so allow the full address bound plus headroom while still
// rejecting hostile length claims before allocating.
pub const MAX_HANDSHAKE_PACKET: usize = 512 * 1024;

// Byte-length bound for the server address string inside the handshake.
pub const MAX_SERVER_ADDRESS: usize = 262_144;

pub const HANDSHAKE_PACKET_ID: i32 = 0x00;

// Next-state values a client may request in the handshake.
pub const NEXT_STATE_STATUS: i32 = 1;
pub const NEXT_STATE_LOGIN: i32 = 2;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("varint exceeds 5 bytes")]
    MalformedVarInt,
    #[error("unexpected end of packet")]
    Truncated,
    #[error("invalid length {0}")]
    InvalidLength(i32),
    #[error("handshake too large ({0} bytes)")]
    PacketTooLarge(usize),
    #[error("server address too long ({0} bytes)")]
    AddressTooLong(usize),
    #[error("invalid utf-8 in server address")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("unexpected packet id {0}")]
    UnexpectedPacket(i32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read one VarInt length prefix, then exactly that many payload bytes.
/// Returns the packet body (packet id + fields, without the length prefix).
pub async fn read_framed_packet<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Vec<u8>, ProtocolError> {
    let len = read_varint_stream(stream).await?;
    if len <= 0 {
        return Err(ProtocolError::InvalidLength(len));
    }
    let len = len as usize;
    if len > MAX_HANDSHAKE_PACKET {
        return Err(ProtocolError::PacketTooLarge(len));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

async fn read_varint_stream<R: AsyncRead + Unpin>(stream: &mut R) -> Result<i32, ProtocolError> {
    let mut num = 0i32;
    let mut shift = 0u32;
    loop {
        let mut b = [0u8; 1];
        let n = stream.read(&mut b).await?;
        if n == 0 {
            return Err(ProtocolError::Truncated);
        }
        num |= ((b[0] & 0x7F) as i32) << shift;
        if (b[0] & 0x80) == 0 {
            break;
        }
        shift += 7;
        if shift >= 35 {
            return Err(ProtocolError::MalformedVarInt);
        }
    }
    Ok(num)
}

pub fn read_varint(bytes: &[u8], mut idx: usize) -> Result<(i32, usize), ProtocolError> {
    let mut num = 0i32;
    let mut shift = 0u32;
    loop {
        if idx >= bytes.len() {
            return Err(ProtocolError::Truncated);
        }
        let b = bytes[idx];
        idx += 1;
        num |= ((b & 0x7F) as i32) << shift;
        if (b & 0x80) == 0 {
            break;
        }
        shift += 7;
        if shift >= 35 {
            return Err(ProtocolError::MalformedVarInt);
        }
    }
    Ok((num, idx))
}

pub fn write_varint(out: &mut Vec<u8>, value: i32) {
    let mut v = value as u32;
    loop {
        let b = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(b);
            break;
        }
        out.push(b | 0x80);
    }
}

pub fn read_string(
    bytes: &[u8],
    idx: usize,
    max_len: usize,
) -> Result<(String, usize), ProtocolError> {
    let (len, mut i) = read_varint(bytes, idx)?;
    if len < 0 {
        return Err(ProtocolError::InvalidLength(len));
    }
    let len = len as usize;
    if len > max_len {
        return Err(ProtocolError::AddressTooLong(len));
    }
    if i + len > bytes.len() {
        return Err(ProtocolError::Truncated);
    }
    let s = std::str::from_utf8(&bytes[i..i + len])?.to_string();
    i += len;
    Ok((s, i))
}

pub fn write_string(out: &mut Vec<u8>, s: &str) {
    write_varint(out, s.len() as i32);
    out.extend_from_slice(s.as_bytes());
}

/// The first packet a Java-edition client sends:
/// packet id (VarInt) = 0
/// protocol version (VarInt)
/// server address (String with VarInt byte length)
/// server port (u16 big-endian)
/// next state (VarInt, 1 = status, 2 = login)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub port: u16,
    pub next_status: i32,
}

impl Handshake {
    pub fn decode(bytes: &[u8], idx: usize) -> Result<(Self, usize), ProtocolError> {
        let (protocol_version, idx) = read_varint(bytes, idx)?;
        let (server_address, idx) = read_string(bytes, idx, MAX_SERVER_ADDRESS)?;
        if idx + 2 > bytes.len() {
            return Err(ProtocolError::Truncated);
        }
        let port = u16::from_be_bytes([bytes[idx], bytes[idx + 1]]);
        let idx = idx + 2;
        let (next_status, idx) = read_varint(bytes, idx)?;
        Ok((
            Handshake {
                protocol_version,
                server_address,
                port,
                next_status,
            },
            idx,
        ))
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        write_varint(out, self.protocol_version);
        write_string(out, &self.server_address);
        out.extend_from_slice(&self.port.to_be_bytes());
        write_varint(out, self.next_status);
    }
}

/// Decoded handshake plus the raw packet body it came from. The payload is
/// what gets forwarded to the backend, so unless a rewrite replaces it the
/// backend sees the client's exact bytes, including any Forge extra data the
/// parser does not model.
#[derive(Debug, Clone)]
pub struct PacketContext {
    pub packet_id: i32,
    pub handshake: Handshake,
    pub payload: Vec<u8>,
}

impl PacketContext {
    /// Parse a handshake out of a framed packet body, keeping the body alive
    /// as the forwardable payload.
    pub fn decode(body: Vec<u8>) -> Result<Self, ProtocolError> {
        let (packet_id, idx) = read_varint(&body, 0)?;
        if packet_id != HANDSHAKE_PACKET_ID {
            return Err(ProtocolError::UnexpectedPacket(packet_id));
        }
        let (handshake, _) = Handshake::decode(&body, idx)?;
        Ok(PacketContext {
            packet_id,
            handshake,
            payload: body,
        })
    }

    /// Re-encode the (possibly modified) handshake into a fresh payload.
    pub fn rewrite_payload(&mut self) {
        let mut out = Vec::with_capacity(self.payload.len() + 32);
        write_varint(&mut out, self.packet_id);
        self.handshake.encode(&mut out);
        self.payload = out;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint_bytes(value: i32) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint(&mut out, value);
        out
    }

    #[test]
    fn varint_known_encodings() {
        assert_eq!(varint_bytes(0), [0x00]);
        assert_eq!(varint_bytes(1), [0x01]);
        assert_eq!(varint_bytes(127), [0x7F]);
        assert_eq!(varint_bytes(128), [0x80, 0x01]);
        assert_eq!(varint_bytes(300), [0xAC, 0x02]);
        assert_eq!(varint_bytes(i32::MAX), [0xFF, 0xFF, 0xFF, 0xFF, 0x07]);
        assert_eq!(varint_bytes(-1), [0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
    }

    #[test]
    fn varint_roundtrip() {
        for v in [
            0,
            1,
            127,
            128,
            255,
            300,
            25565,
            1 << 21,
            i32::MAX,
            -1,
            -300,
            i32::MIN,
        ] {
            let bytes = varint_bytes(v);
            assert!(bytes.len() <= 5);
            let (back, idx) = read_varint(&bytes, 0).unwrap();
            assert_eq!(back, v);
            assert_eq!(idx, bytes.len());
        }
    }

    #[test]
    fn varint_rejects_six_bytes() {
        let err = read_varint(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01], 0).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedVarInt));
    }

    #[test]
    fn varint_rejects_truncation() {
        let err = read_varint(&[0x80, 0x80], 0).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated));
    }

    fn sample_handshake() -> Handshake {
        Handshake {
            protocol_version: 765,
            server_address: "play.example.com".into(),
            port: 25565,
            next_status: NEXT_STATE_LOGIN,
        }
    }

    fn encode_body(h: &Handshake) -> Vec<u8> {
        let mut body = Vec::new();
        write_varint(&mut body, HANDSHAKE_PACKET_ID);
        h.encode(&mut body);
        body
    }

    #[test]
    fn handshake_roundtrip() {
        let h = sample_handshake();
        let body = encode_body(&h);
        let pc = PacketContext::decode(body.clone()).unwrap();
        assert_eq!(pc.packet_id, HANDSHAKE_PACKET_ID);
        assert_eq!(pc.handshake, h);
        assert_eq!(pc.payload, body);
    }

    #[test]
    fn handshake_roundtrip_preserves_forge_marker() {
        let mut h = sample_handshake();
        h.server_address = "play.example.com\0FML2\0".into();
        let body = encode_body(&h);
        let pc = PacketContext::decode(body).unwrap();
        assert_eq!(pc.handshake.server_address, "play.example.com\0FML2\0");
    }

    #[test]
    fn rewrite_payload_replaces_body() {
        let h = sample_handshake();
        let mut pc = PacketContext::decode(encode_body(&h)).unwrap();
        pc.handshake.server_address = "play.example.com///1.2.3.4/1700000000000".into();
        pc.rewrite_payload();
        let back = PacketContext::decode(pc.payload.clone()).unwrap();
        assert_eq!(
            back.handshake.server_address,
            "play.example.com///1.2.3.4/1700000000000"
        );
        assert_eq!(back.handshake.port, h.port);
        assert_eq!(back.handshake.next_status, h.next_status);
    }

    #[test]
    fn decode_rejects_wrong_packet_id() {
        let mut body = Vec::new();
        write_varint(&mut body, 0x05);
        sample_handshake().encode(&mut body);
        let err = PacketContext::decode(body).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedPacket(0x05)));
    }

    #[test]
    fn decode_rejects_oversized_address_claim() {
        // Claims a 1 MiB address with only a few bytes behind it.
        let mut body = Vec::new();
        write_varint(&mut body, HANDSHAKE_PACKET_ID);
        write_varint(&mut body, 765);
        write_varint(&mut body, 1024 * 1024);
        body.extend_from_slice(b"tiny");
        let err = PacketContext::decode(body).unwrap_err();
        assert!(matches!(err, ProtocolError::AddressTooLong(_)));
    }

    #[test]
    fn decode_rejects_truncated_port() {
        let mut body = Vec::new();
        write_varint(&mut body, HANDSHAKE_PACKET_ID);
        write_varint(&mut body, 765);
        write_string(&mut body, "example.com");
        body.push(0x63); // half a port
        let err = PacketContext::decode(body).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated));
    }

    #[tokio::test]
    async fn framed_read_returns_body() {
        let body = encode_body(&sample_handshake());
        let mut wire = Vec::new();
        write_varint(&mut wire, body.len() as i32);
        wire.extend_from_slice(&body);
        let got = read_framed_packet(&mut wire.as_slice()).await.unwrap();
        assert_eq!(got, body);
    }

    #[tokio::test]
    async fn framed_read_rejects_huge_length_claim() {
        // A 10 MiB length prefix must fail before any allocation of that size.
        let mut wire = Vec::new();
        write_varint(&mut wire, 10 * 1024 * 1024);
        wire.extend_from_slice(&[0u8; 64]);
        let err = read_framed_packet(&mut wire.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::PacketTooLarge(_)));
    }

    #[tokio::test]
    async fn framed_read_rejects_eof_mid_length() {
        let wire = [0x80u8, 0x80];
        let err = read_framed_packet(&mut wire.as_ref()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated));
    }
}
