//! Modbus-TCP frame codec
//!
//! Encodes requests and decodes responses for the subset of function codes
//! the gateway uses. Each ADU is a 7-byte MBAP header followed by the PDU.

use crate::error::IoError;

/// Read coils
pub const READ_COILS: u8 = 0x01;
/// Read holding registers
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
/// Write single coil
pub const WRITE_SINGLE_COIL: u8 = 0x05;
/// Write single register
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;

/// MBAP header length (transaction, protocol, length, unit)
pub const MBAP_HEADER_LEN: usize = 7;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;
const EXCEPTION_FLAG: u8 = 0x80;
const MAX_PDU_LEN: usize = 253;

/// Request PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, count: u16 },
    ReadHoldingRegisters { address: u16, count: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
}

impl Request {
    /// Function code
    pub fn function(&self) -> u8 {
        match self {
            Request::ReadCoils { .. } => READ_COILS,
            Request::ReadHoldingRegisters { .. } => READ_HOLDING_REGISTERS,
            Request::WriteSingleCoil { .. } => WRITE_SINGLE_COIL,
            Request::WriteSingleRegister { .. } => WRITE_SINGLE_REGISTER,
        }
    }

    fn encode_pdu(&self) -> [u8; 5] {
        let (a, b) = match *self {
            Request::ReadCoils { address, count } => (address, count),
            Request::ReadHoldingRegisters { address, count } => (address, count),
            Request::WriteSingleCoil { address, value } => {
                (address, if value { COIL_ON } else { COIL_OFF })
            }
            Request::WriteSingleRegister { address, value } => (address, value),
        };
        let [a_hi, a_lo] = a.to_be_bytes();
        let [b_hi, b_lo] = b.to_be_bytes();
        [self.function(), a_hi, a_lo, b_hi, b_lo]
    }
}

/// Decoded response PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Coils(Vec<bool>),
    Registers(Vec<u16>),
    CoilWritten { address: u16, value: bool },
    RegisterWritten { address: u16, value: u16 },
}

/// MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction: u16,
    pub protocol: u16,
    /// Byte count of unit id + PDU
    pub length: u16,
    pub unit: u8,
}

impl MbapHeader {
    /// Parse the first 7 bytes of an ADU
    pub fn parse(bytes: &[u8]) -> Result<Self, IoError> {
        if bytes.len() < MBAP_HEADER_LEN {
            return Err(IoError::InvalidResponse(format!(
                "header needs {} bytes, got {}",
                MBAP_HEADER_LEN,
                bytes.len()
            )));
        }
        let header = Self {
            transaction: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit: bytes[6],
        };
        if header.protocol != 0 {
            return Err(IoError::InvalidResponse(format!(
                "protocol id {} is not Modbus",
                header.protocol
            )));
        }
        if header.length < 2 || header.pdu_len() > MAX_PDU_LEN {
            return Err(IoError::InvalidResponse(format!("bad length {}", header.length)));
        }
        Ok(header)
    }

    /// PDU bytes following the header
    pub fn pdu_len(&self) -> usize {
        self.length.saturating_sub(1) as usize
    }
}

/// Build a complete request ADU
pub fn encode_request(transaction: u16, unit: u8, request: &Request) -> Vec<u8> {
    let pdu = request.encode_pdu();
    let mut adu = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    adu.extend_from_slice(&transaction.to_be_bytes());
    adu.extend_from_slice(&0u16.to_be_bytes());
    adu.extend_from_slice(&(pdu.len() as u16 + 1).to_be_bytes());
    adu.push(unit);
    adu.extend_from_slice(&pdu);
    adu
}

/// Decode a response PDU against the request that produced it
pub fn decode_response(request: &Request, pdu: &[u8]) -> Result<Response, IoError> {
    let function = *pdu
        .first()
        .ok_or_else(|| IoError::InvalidResponse("empty PDU".to_string()))?;

    if function == request.function() | EXCEPTION_FLAG {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(IoError::Exception {
            function: request.function(),
            code,
        });
    }
    if function != request.function() {
        return Err(IoError::InvalidResponse(format!(
            "function {:02X} answers request {:02X}",
            function,
            request.function()
        )));
    }

    match *request {
        Request::ReadCoils { count, .. } => {
            let data = counted_payload(pdu)?;
            if data.len() * 8 < count as usize {
                return Err(IoError::InvalidResponse(format!(
                    "{} coil bytes for {} coils",
                    data.len(),
                    count
                )));
            }
            let coils = (0..count as usize)
                .map(|i| data[i / 8] & (1 << (i % 8)) != 0)
                .collect();
            Ok(Response::Coils(coils))
        }
        Request::ReadHoldingRegisters { count, .. } => {
            let data = counted_payload(pdu)?;
            if data.len() != count as usize * 2 {
                return Err(IoError::InvalidResponse(format!(
                    "{} register bytes for {} registers",
                    data.len(),
                    count
                )));
            }
            Ok(Response::Registers(
                data.chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect(),
            ))
        }
        Request::WriteSingleCoil { .. } => {
            let (address, raw) = echo(pdu)?;
            let value = match raw {
                COIL_ON => true,
                COIL_OFF => false,
                other => {
                    return Err(IoError::InvalidResponse(format!("coil value {:04X}", other)))
                }
            };
            Ok(Response::CoilWritten { address, value })
        }
        Request::WriteSingleRegister { .. } => {
            let (address, value) = echo(pdu)?;
            Ok(Response::RegisterWritten { address, value })
        }
    }
}

/// Byte-count prefixed payload of a read response
fn counted_payload(pdu: &[u8]) -> Result<&[u8], IoError> {
    let count = *pdu
        .get(1)
        .ok_or_else(|| IoError::InvalidResponse("missing byte count".to_string()))? as usize;
    pdu.get(2..2 + count).ok_or_else(|| {
        IoError::InvalidResponse(format!("byte count {} exceeds PDU of {}", count, pdu.len()))
    })
}

/// Address/value echo of a single write
fn echo(pdu: &[u8]) -> Result<(u16, u16), IoError> {
    if pdu.len() != 5 {
        return Err(IoError::InvalidResponse(format!("write echo of {} bytes", pdu.len())));
    }
    Ok((
        u16::from_be_bytes([pdu[1], pdu[2]]),
        u16::from_be_bytes([pdu[3], pdu[4]]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_read_registers() {
        let adu = encode_request(
            0x0102,
            1,
            &Request::ReadHoldingRegisters { address: 200, count: 1 },
        );
        assert_eq!(adu, vec![0x01, 0x02, 0, 0, 0, 6, 1, 0x03, 0, 200, 0, 1]);
    }

    #[test]
    fn test_encode_write_coil() {
        let adu = encode_request(7, 3, &Request::WriteSingleCoil { address: 5, value: true });
        assert_eq!(&adu[7..], &[0x05, 0, 5, 0xFF, 0x00]);
    }

    #[test]
    fn test_decode_registers() {
        let req = Request::ReadHoldingRegisters { address: 0, count: 2 };
        let resp = decode_response(&req, &[0x03, 4, 0x00, 0x01, 0x12, 0x34]).unwrap();
        assert_eq!(resp, Response::Registers(vec![1, 0x1234]));
    }

    #[test]
    fn test_decode_short_register_payload() {
        let req = Request::ReadHoldingRegisters { address: 0, count: 2 };
        assert!(decode_response(&req, &[0x03, 2, 0x00, 0x01]).is_err());
        assert!(decode_response(&req, &[0x03, 4, 0x00]).is_err());
    }

    #[test]
    fn test_decode_coils() {
        let req = Request::ReadCoils { address: 0, count: 3 };
        let resp = decode_response(&req, &[0x01, 1, 0b101]).unwrap();
        assert_eq!(resp, Response::Coils(vec![true, false, true]));
    }

    #[test]
    fn test_decode_exception() {
        let req = Request::WriteSingleRegister { address: 9, value: 1 };
        match decode_response(&req, &[0x86, 0x02]) {
            Err(IoError::Exception { function, code }) => {
                assert_eq!(function, 0x06);
                assert_eq!(code, 0x02);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_wrong_function() {
        let req = Request::ReadCoils { address: 0, count: 1 };
        assert!(decode_response(&req, &[0x03, 2, 0, 1]).is_err());
    }

    #[test]
    fn test_header_parse() {
        let h = MbapHeader::parse(&[0, 9, 0, 0, 0, 5, 1]).unwrap();
        assert_eq!(h.transaction, 9);
        assert_eq!(h.pdu_len(), 4);
        assert!(MbapHeader::parse(&[0, 9, 0, 1, 0, 5, 1]).is_err());
        assert!(MbapHeader::parse(&[0, 9, 0, 0]).is_err());
    }

    proptest! {
        #[test]
        fn prop_write_register_echo_decodes(address: u16, value: u16, tid: u16) {
            let req = Request::WriteSingleRegister { address, value };
            let adu = encode_request(tid, 1, &req);
            let header = MbapHeader::parse(&adu).unwrap();
            prop_assert_eq!(header.transaction, tid);
            prop_assert_eq!(header.pdu_len(), adu.len() - MBAP_HEADER_LEN);
            let resp = decode_response(&req, &adu[MBAP_HEADER_LEN..]).unwrap();
            prop_assert_eq!(resp, Response::RegisterWritten { address, value });
        }
    }
}
