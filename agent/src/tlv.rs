//! Framed type-length-value codec (§4.3, §6 TLV wire).
//!
//! Wire unit: `Type: u16 be | Length: u32 be | Value: Length bytes`. Grounded
//! directly on `TLVPackage`/`TLVHandler::recvPackage` in
//! `original_source/core/cms/common/impl/TLVHandler.cpp`: the same
//! three-counter restartable shape (header bytes accumulated so far, body
//! bytes accumulated so far, declared body length) replaces that class's
//! `m_recvdLen`/`m_totalLen` fields.

use shared::error::MonitoringError;

pub const HEADER_LEN: usize = shared::defaults::TLV_HEADER_LEN;
pub const MAX_BODY_LEN: u32 = shared::defaults::TLV_MAX_BODY_LEN;

/// Type vocabulary from §4.3/§6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Binary = 0,
    Utf8Json = 1,
    Protobuf = 2,
    ProtobufExt = 3,
}

impl TryFrom<u16> for PacketType {
    type Error = MonitoringError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Binary),
            1 => Ok(PacketType::Utf8Json),
            2 => Ok(PacketType::Protobuf),
            3 => Ok(PacketType::ProtobufExt),
            other => Err(MonitoringError::EParse(format!("unknown TLV type {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvPacket {
    pub packet_type: u16,
    pub value: Vec<u8>,
}

impl TlvPacket {
    pub fn new(packet_type: u16, value: Vec<u8>) -> Self {
        Self { packet_type, value }
    }

    /// Serialize to the wire format. Fails above `MAX_BODY_LEN` (§4.3).
    pub fn encode(&self) -> Result<Vec<u8>, MonitoringError> {
        if self.value.len() as u64 > MAX_BODY_LEN as u64 {
            return Err(MonitoringError::EOverflow(format!(
                "TLV body {} exceeds max {}",
                self.value.len(),
                MAX_BODY_LEN
            )));
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + self.value.len());
        buf.extend_from_slice(&self.packet_type.to_be_bytes());
        buf.extend_from_slice(&(self.value.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.value);
        Ok(buf)
    }
}

/// Restartable receive-side state machine. One `TlvDecoder` handles a whole
/// connection's stream of packets: after a packet completes, internal state
/// resets so the next `decode_one` call starts a fresh header.
#[derive(Debug, Default)]
pub struct TlvDecoder {
    header: Vec<u8>,
    packet_type: u16,
    declared_len: u32,
    body: Vec<u8>,
}

impl TlvDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed up to `buf.len()` new bytes. Returns `(consumed, packet)`:
    /// `consumed` is always `<= buf.len()`; `packet` is `Some` the instant a
    /// full packet has been accumulated, at which point any bytes in
    /// `buf[consumed..]` belong to the *next* packet and the caller should
    /// call `decode_one` again with that remainder.
    ///
    /// Idempotent under repeated partial feeds (I3/I4): calling with an
    /// empty or short slice never loses already-accumulated progress.
    pub fn decode_one(
        &mut self,
        buf: &[u8],
    ) -> Result<(usize, Option<TlvPacket>), MonitoringError> {
        let mut offset = 0;

        if self.header.len() < HEADER_LEN {
            let need = HEADER_LEN - self.header.len();
            let take = need.min(buf.len() - offset);
            self.header.extend_from_slice(&buf[offset..offset + take]);
            offset += take;

            if self.header.len() < HEADER_LEN {
                return Ok((offset, None));
            }

            let packet_type = u16::from_be_bytes([self.header[0], self.header[1]]);
            let declared_len = u32::from_be_bytes([
                self.header[2],
                self.header[3],
                self.header[4],
                self.header[5],
            ]);
            if declared_len > MAX_BODY_LEN {
                return Err(MonitoringError::EOverflow(format!(
                    "TLV declared length {declared_len} exceeds max {MAX_BODY_LEN}"
                )));
            }
            self.packet_type = packet_type;
            self.declared_len = declared_len;
            self.body = Vec::with_capacity(declared_len as usize);
        }

        let remaining_needed = self.declared_len as usize - self.body.len();
        let take = remaining_needed.min(buf.len() - offset);
        self.body.extend_from_slice(&buf[offset..offset + take]);
        offset += take;

        if self.body.len() < self.declared_len as usize {
            return Ok((offset, None));
        }

        let packet = TlvPacket::new(self.packet_type, std::mem::take(&mut self.body));
        self.header.clear();
        self.declared_len = 0;
        Ok((offset, Some(packet)))
    }
}

/// Restartable send-side cursor, mirroring `TLVPackage::m_sendLen` — an
/// endpoint write may accept fewer bytes than offered, and the cursor lets
/// the caller resume from where it left off.
pub struct SendCursor {
    buf: Vec<u8>,
    sent: usize,
}

impl SendCursor {
    pub fn new(packet: &TlvPacket) -> Result<Self, MonitoringError> {
        Ok(Self {
            buf: packet.encode()?,
            sent: 0,
        })
    }

    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.sent..]
    }

    pub fn advance(&mut self, n: usize) {
        self.sent = (self.sent + n).min(self.buf.len());
    }

    pub fn is_done(&self) -> bool {
        self.sent >= self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_whole_buffer() {
        let packet = TlvPacket::new(1, b"hello world".to_vec());
        let encoded = packet.encode().unwrap();

        let mut decoder = TlvDecoder::new();
        let (consumed, decoded) = decoder.decode_one(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.unwrap(), packet);
    }

    #[test]
    fn incremental_byte_at_a_time_two_packets() {
        // S3: two packets {type=1,value="a"} and {type=2,value="bc"} fed one
        // byte at a time yield two Complete events in order.
        let p1 = TlvPacket::new(1, b"a".to_vec());
        let p2 = TlvPacket::new(2, b"bc".to_vec());
        let mut stream = p1.encode().unwrap();
        stream.extend(p2.encode().unwrap());

        let mut decoder = TlvDecoder::new();
        let mut completed = Vec::new();
        let mut i = 0;
        while i < stream.len() {
            let (consumed, packet) = decoder.decode_one(&stream[i..i + 1]).unwrap();
            assert_eq!(consumed, 1);
            if let Some(p) = packet {
                completed.push(p);
            }
            i += 1;
        }

        assert_eq!(completed, vec![p1, p2]);
    }

    #[test]
    fn empty_body_is_complete_at_header_boundary() {
        let packet = TlvPacket::new(0, Vec::new());
        let encoded = packet.encode().unwrap();
        assert_eq!(encoded.len(), HEADER_LEN);

        let mut decoder = TlvDecoder::new();
        let (consumed, decoded) = decoder.decode_one(&encoded).unwrap();
        assert_eq!(consumed, HEADER_LEN);
        assert_eq!(decoded.unwrap().value, Vec::<u8>::new());
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(&1u16.to_be_bytes());
        header.extend_from_slice(&(MAX_BODY_LEN + 1).to_be_bytes());

        let mut decoder = TlvDecoder::new();
        let err = decoder.decode_one(&header).unwrap_err();
        assert!(matches!(err, MonitoringError::EOverflow(_)));
    }

    #[test]
    fn send_cursor_resumes_after_partial_write() {
        let packet = TlvPacket::new(2, b"payload".to_vec());
        let mut cursor = SendCursor::new(&packet).unwrap();
        assert!(!cursor.is_done());
        cursor.advance(3);
        assert_eq!(cursor.remaining().len(), cursor.buf.len() - 3);
        cursor.advance(1000);
        assert!(cursor.is_done());
    }
}
