//! MBAP framing and the Read Holding Registers PDU.
//!
//! Pure byte-level encode/parse; all I/O lives in the transport.

/// Function code for Read Holding Registers.
pub const FUNC_READ_HOLDING: u8 = 0x03;

/// Fixed MBAP header length on the wire.
pub const MBAP_LEN: usize = 7;

/// Largest PDU we ever expect back: function + byte count + 125 registers.
pub const MAX_PDU_LEN: usize = 2 + 250;

/// Parsed MBAP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    /// Remaining bytes after the protocol/length fields (unit id + PDU).
    pub length: u16,
    pub unit_id: u8,
}

/// Frame-level problems. The transport maps these onto its error taxonomy:
/// `Exception` becomes `RemoteException`, everything else desyncs the stream
/// and becomes `ConnectionLost`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The device answered with an exception PDU carrying this code.
    Exception(u8),
    Malformed(String),
}

/// Encode a Read Holding Registers request frame.
pub fn encode_read_holding(transaction_id: u16, unit_id: u8, start: u16, count: u16) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0..2].copy_from_slice(&transaction_id.to_be_bytes());
    // protocol id is always zero for Modbus
    buf[2..4].copy_from_slice(&0u16.to_be_bytes());
    // length covers unit id + function + start + count
    buf[4..6].copy_from_slice(&6u16.to_be_bytes());
    buf[6] = unit_id;
    buf[7] = FUNC_READ_HOLDING;
    buf[8..10].copy_from_slice(&start.to_be_bytes());
    buf[10..12].copy_from_slice(&count.to_be_bytes());
    buf
}

/// Parse the 7-byte MBAP header.
pub fn parse_mbap(buf: &[u8; MBAP_LEN]) -> Result<MbapHeader, FrameError> {
    let protocol = u16::from_be_bytes([buf[2], buf[3]]);
    if protocol != 0 {
        return Err(FrameError::Malformed(format!("protocol id {protocol}, expected 0")));
    }
    let length = u16::from_be_bytes([buf[4], buf[5]]);
    if length < 2 || usize::from(length) > 1 + MAX_PDU_LEN {
        return Err(FrameError::Malformed(format!("implausible frame length {length}")));
    }
    Ok(MbapHeader {
        transaction_id: u16::from_be_bytes([buf[0], buf[1]]),
        length,
        unit_id: buf[6],
    })
}

/// Parse a Read Holding Registers response PDU into register words.
///
/// `expected` is the register count from the request; the byte count in the
/// PDU must match exactly.
pub fn parse_read_holding_response(pdu: &[u8], expected: u16) -> Result<Vec<u16>, FrameError> {
    if pdu.is_empty() {
        return Err(FrameError::Malformed("empty pdu".to_string()));
    }
    let function = pdu[0];
    if function == FUNC_READ_HOLDING | 0x80 {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(FrameError::Exception(code));
    }
    if function != FUNC_READ_HOLDING {
        return Err(FrameError::Malformed(format!("unexpected function {function:#04x}")));
    }
    let byte_count = usize::from(*pdu.get(1).ok_or_else(|| {
        FrameError::Malformed("truncated pdu: missing byte count".to_string())
    })?);
    if byte_count != usize::from(expected) * 2 || pdu.len() != 2 + byte_count {
        return Err(FrameError::Malformed(format!(
            "byte count {} for {} requested registers (pdu len {})",
            byte_count,
            expected,
            pdu.len()
        )));
    }
    let words = pdu[2..]
        .chunks_exact(2)
        .map(|w| u16::from_be_bytes([w[0], w[1]]))
        .collect();
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===== request encoding =====

    #[test]
    fn test_encode_read_holding_golden_bytes() {
        let frame = encode_read_holding(0x0102, 0x11, 0x0010, 0x0002);
        assert_eq!(
            frame,
            [0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x10, 0x00, 0x02]
        );
    }

    #[test]
    fn test_encode_length_field_constant() {
        let frame = encode_read_holding(9, 1, 1000, 125);
        assert_eq!(u16::from_be_bytes([frame[4], frame[5]]), 6);
    }

    // ===== MBAP parsing =====

    #[test]
    fn test_parse_mbap_roundtrip() {
        let hdr = parse_mbap(&[0xAB, 0xCD, 0x00, 0x00, 0x00, 0x07, 0x2A]).expect("parse");
        assert_eq!(hdr.transaction_id, 0xABCD);
        assert_eq!(hdr.length, 7);
        assert_eq!(hdr.unit_id, 0x2A);
    }

    #[test]
    fn test_parse_mbap_rejects_nonzero_protocol() {
        let err = parse_mbap(&[0, 1, 0x00, 0x01, 0x00, 0x06, 0x01]).unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[test]
    fn test_parse_mbap_rejects_tiny_length() {
        let err = parse_mbap(&[0, 1, 0, 0, 0x00, 0x01, 0x01]).unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[test]
    fn test_parse_mbap_rejects_huge_length() {
        let err = parse_mbap(&[0, 1, 0, 0, 0xFF, 0xFF, 0x01]).unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    // ===== response parsing =====

    #[test]
    fn test_parse_response_two_registers() {
        let pdu = [0x03, 0x04, 0x12, 0x34, 0x56, 0x78];
        let words = parse_read_holding_response(&pdu, 2).expect("parse");
        assert_eq!(words, vec![0x1234, 0x5678]);
    }

    #[test]
    fn test_parse_response_exception_maps_code() {
        let pdu = [0x83, 0x02];
        let err = parse_read_holding_response(&pdu, 2).unwrap_err();
        assert_eq!(err, FrameError::Exception(0x02));
    }

    #[test]
    fn test_parse_response_wrong_function_rejected() {
        let pdu = [0x04, 0x02, 0x00, 0x01];
        assert!(matches!(
            parse_read_holding_response(&pdu, 1).unwrap_err(),
            FrameError::Malformed(_)
        ));
    }

    #[test]
    fn test_parse_response_byte_count_mismatch_rejected() {
        // claims 2 bytes but request expected 2 registers (4 bytes)
        let pdu = [0x03, 0x02, 0x00, 0x01];
        assert!(matches!(
            parse_read_holding_response(&pdu, 2).unwrap_err(),
            FrameError::Malformed(_)
        ));
    }

    #[test]
    fn test_parse_response_truncated_rejected() {
        let pdu = [0x03, 0x04, 0x00, 0x01];
        assert!(matches!(
            parse_read_holding_response(&pdu, 2).unwrap_err(),
            FrameError::Malformed(_)
        ));
    }

    #[test]
    fn test_parse_response_empty_rejected() {
        assert!(matches!(
            parse_read_holding_response(&[], 1).unwrap_err(),
            FrameError::Malformed(_)
        ));
    }
}
