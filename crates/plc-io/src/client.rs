//! Modbus-TCP client for PLC register access
//!
//! Blocking client shared by every board thread. Requests are serialized on
//! one connection; a broken connection is dropped and re-opened on the next
//! call.

use crate::error::IoError;
use crate::frame::{decode_response, encode_request, MbapHeader, Request, Response, MBAP_HEADER_LEN};
use crate::{GatewayKind, IoGateway, PlcConfig};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Modbus-TCP PLC client
pub struct ModbusClient {
    /// PLC endpoint ("host:port")
    endpoint: String,
    unit_id: u8,
    timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
    transaction: AtomicU16,
}

impl ModbusClient {
    /// Create a client; the connection is opened lazily
    pub fn new(config: &PlcConfig) -> Self {
        let endpoint = format!("{}:{}", config.host, config.port);
        info!("Creating Modbus client for PLC at {}", endpoint);
        Self {
            endpoint,
            unit_id: config.unit_id,
            timeout: Duration::from_millis(config.timeout_ms),
            stream: Mutex::new(None),
            transaction: AtomicU16::new(1),
        }
    }

    /// Open the connection now instead of on first use
    pub fn connect(&self) -> Result<(), IoError> {
        let mut guard = self
            .stream
            .lock()
            .map_err(|e| IoError::Lock(e.to_string()))?;
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        Ok(())
    }

    /// Drop the connection
    pub fn disconnect(&self) {
        if let Ok(mut guard) = self.stream.lock() {
            if guard.take().is_some() {
                info!("Disconnected from PLC {}", self.endpoint);
            }
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn open(&self) -> Result<TcpStream, IoError> {
        let addr = self
            .endpoint
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| IoError::Connection(format!("cannot resolve {}", self.endpoint)))?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;
        info!("Connected to PLC {}", self.endpoint);
        Ok(stream)
    }

    fn transact(&self, request: Request) -> Result<Response, IoError> {
        let mut guard = self
            .stream
            .lock()
            .map_err(|e| IoError::Lock(e.to_string()))?;
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        let stream = guard.as_mut().ok_or_else(|| IoError::Connection("not connected".to_string()))?;

        let transaction = self.transaction.fetch_add(1, Ordering::Relaxed);
        let result = exchange(stream, transaction, self.unit_id, &request, self.timeout);
        if let Err(e) = &result {
            if matches!(
                e,
                IoError::Connection(_) | IoError::Timeout(_) | IoError::TransactionMismatch { .. }
            ) {
                warn!("Dropping PLC connection {}: {}", self.endpoint, e);
                *guard = None;
            }
        }
        result
    }
}

/// One request/response round trip
fn exchange(
    stream: &mut TcpStream,
    transaction: u16,
    unit: u8,
    request: &Request,
    timeout: Duration,
) -> Result<Response, IoError> {
    let adu = encode_request(transaction, unit, request);
    stream.write_all(&adu).map_err(|e| map_io(e, timeout))?;

    let mut header = [0u8; MBAP_HEADER_LEN];
    stream.read_exact(&mut header).map_err(|e| map_io(e, timeout))?;
    let header = MbapHeader::parse(&header)?;
    if header.transaction != transaction {
        return Err(IoError::TransactionMismatch {
            expected: transaction,
            actual: header.transaction,
        });
    }

    let mut pdu = vec![0u8; header.pdu_len()];
    stream.read_exact(&mut pdu).map_err(|e| map_io(e, timeout))?;
    debug!("PLC transaction {} function {:02X} ok", transaction, request.function());
    decode_response(request, &pdu)
}

fn map_io(err: std::io::Error, timeout: Duration) -> IoError {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => IoError::Timeout(timeout.as_millis() as u64),
        _ => IoError::Connection(err.to_string()),
    }
}

impl IoGateway for ModbusClient {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Plc
    }

    fn read_register(&self, address: u16) -> Result<u16, IoError> {
        match self.transact(Request::ReadHoldingRegisters { address, count: 1 })? {
            Response::Registers(values) => values
                .first()
                .copied()
                .ok_or_else(|| IoError::InvalidResponse("no register value".to_string())),
            other => Err(IoError::InvalidResponse(format!("{:?}", other))),
        }
    }

    fn write_register(&self, address: u16, value: u16) -> Result<(), IoError> {
        match self.transact(Request::WriteSingleRegister { address, value })? {
            Response::RegisterWritten { address: a, value: v } if a == address && v == value => Ok(()),
            other => Err(IoError::WriteRejected(format!("{:?}", other))),
        }
    }

    fn write_bit(&self, _channel: u8, address: u16, value: bool) -> Result<(), IoError> {
        match self.transact(Request::WriteSingleCoil { address, value })? {
            Response::CoilWritten { address: a, value: v } if a == address && v == value => Ok(()),
            other => Err(IoError::WriteRejected(format!("{:?}", other))),
        }
    }

    fn read_bit(&self, _channel: u8, address: u16) -> Result<bool, IoError> {
        match self.transact(Request::ReadCoils { address, count: 1 })? {
            Response::Coils(bits) => bits
                .first()
                .copied()
                .ok_or_else(|| IoError::InvalidResponse("no coil value".to_string())),
            other => Err(IoError::InvalidResponse(format!("{:?}", other))),
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.lock().map(|s| s.is_some()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{READ_HOLDING_REGISTERS, WRITE_SINGLE_REGISTER};
    use std::net::TcpListener;
    use std::thread;

    /// Minimal PLC: one holding register bank, answers until the peer closes
    fn spawn_plc(registers: Vec<u16>) -> (PlcConfig, thread::JoinHandle<Vec<u16>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let mut registers = registers;
            let (mut conn, _) = listener.accept().unwrap();
            let mut req = [0u8; 12];
            while conn.read_exact(&mut req).is_ok() {
                let function = req[7];
                let address = u16::from_be_bytes([req[8], req[9]]) as usize;
                let mut pdu = match function {
                    READ_HOLDING_REGISTERS if address < registers.len() => {
                        let mut p = vec![function, 2];
                        p.extend_from_slice(&registers[address].to_be_bytes());
                        p
                    }
                    WRITE_SINGLE_REGISTER if address < registers.len() => {
                        registers[address] = u16::from_be_bytes([req[10], req[11]]);
                        req[7..12].to_vec()
                    }
                    _ => vec![function | 0x80, 0x02],
                };
                let mut resp = req[0..4].to_vec();
                resp.extend_from_slice(&(pdu.len() as u16 + 1).to_be_bytes());
                resp.push(req[6]);
                resp.append(&mut pdu);
                conn.write_all(&resp).unwrap();
            }
            registers
        });
        let config = PlcConfig {
            host: "127.0.0.1".to_string(),
            port,
            unit_id: 1,
            timeout_ms: 2000,
        };
        (config, handle)
    }

    #[test]
    fn test_read_write_round_trip() {
        let (config, plc) = spawn_plc(vec![0, 7, 0, 0]);
        let client = ModbusClient::new(&config);
        assert!(!client.is_connected());

        assert_eq!(client.read_register(1).unwrap(), 7);
        assert!(client.is_connected());
        client.write_register(2, 42).unwrap();
        assert_eq!(client.read_register(2).unwrap(), 42);

        client.disconnect();
        let registers = plc.join().unwrap();
        assert_eq!(registers, vec![0, 7, 42, 0]);
    }

    #[test]
    fn test_exception_keeps_connection() {
        let (config, plc) = spawn_plc(vec![0; 2]);
        let client = ModbusClient::new(&config);
        assert!(matches!(
            client.read_register(100),
            Err(IoError::Exception { code: 2, .. })
        ));
        assert!(client.is_connected());
        assert_eq!(client.read_register(0).unwrap(), 0);
        client.disconnect();
        plc.join().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let client = ModbusClient::new(&PlcConfig {
            host: "127.0.0.1".to_string(),
            port,
            timeout_ms: 200,
            ..PlcConfig::default()
        });
        assert!(client.read_register(0).is_err());
        assert!(!client.is_connected());
    }
}
