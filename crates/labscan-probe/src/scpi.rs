//! SCPI `*IDN?` handshake over raw TCP

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::error::ProbeError;

/// Raw socket ports instruments commonly listen on, in probing order
pub const INSTRUMENT_PORTS: [u16; 4] = [5025, 5024, 3490, 3491];

/// Shortest connect window granted to a single port
const MIN_CONNECT_SLICE: Duration = Duration::from_millis(200);

/// Longest `*IDN?` answer read, newline included
const MAX_IDN_LEN: u64 = 256;

/// Identification string returned by `*IDN?`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentIdentity {
    pub manufacturer: String,
    pub model: String,
    pub serial: Option<String>,
    pub firmware: Option<String>,
    /// Port the instrument answered on
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct InstrumentProbe {
    ports: Vec<u16>,
}

impl Default for InstrumentProbe {
    fn default() -> Self {
        Self::new(INSTRUMENT_PORTS.to_vec())
    }
}

impl InstrumentProbe {
    pub fn new(ports: Vec<u16>) -> Self {
        Self { ports }
    }

    /// Ask the first port that accepts a connection for `*IDN?`.
    ///
    /// Ports that refuse or do not answer the connect are skipped. Once a
    /// port connects, its answer decides the outcome.
    pub async fn probe(&self, ip: IpAddr, timeout: Duration) -> Result<InstrumentIdentity, ProbeError> {
        let deadline = Instant::now() + timeout;
        let slice = (timeout / self.ports.len().max(1) as u32).max(MIN_CONNECT_SLICE);
        let mut last_error = ProbeError::Unreachable(format!("no instrument port open on {}", ip));

        for &port in &self.ports {
            let addr = SocketAddr::new(ip, port);
            let connect_deadline = (Instant::now() + slice).min(deadline);

            let stream = match timeout_at(connect_deadline, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    trace!(addr = %addr, error = %e, "Instrument port closed");
                    last_error = ProbeError::Unreachable(e.to_string());
                    continue;
                }
                Err(_) => {
                    trace!(addr = %addr, "Instrument port connect timed out");
                    last_error = ProbeError::Timeout;
                    if Instant::now() >= deadline {
                        break;
                    }
                    continue;
                }
            };

            let line = timeout_at(deadline, query_idn(stream))
                .await
                .map_err(|_| ProbeError::Timeout)?
                .map_err(|e| ProbeError::ProtocolMismatch(format!("{}: {}", addr, e)))?;

            let identity = parse_idn(&line, port).ok_or_else(|| {
                ProbeError::ProtocolMismatch(format!("unexpected *IDN? answer: {:?}", line.trim()))
            })?;

            debug!(
                addr = %addr,
                manufacturer = %identity.manufacturer,
                model = %identity.model,
                "Identified instrument"
            );
            return Ok(identity);
        }

        Err(last_error)
    }
}

async fn query_idn(mut stream: TcpStream) -> io::Result<String> {
    stream.write_all(b"*IDN?\n").await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream.take(MAX_IDN_LEN));
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    if !line.ends_with('\n') && line.len() as u64 >= MAX_IDN_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("answer longer than {} bytes", MAX_IDN_LEN),
        ));
    }
    Ok(line)
}

/// Parse `manufacturer,model,serial,firmware`.
///
/// Manufacturer and model are required; the rest are optional.
pub fn parse_idn(line: &str, port: u16) -> Option<InstrumentIdentity> {
    let mut fields = line.trim().splitn(4, ',').map(str::trim);

    let manufacturer = fields.next().filter(|f| !f.is_empty())?;
    let model = fields.next().filter(|f| !f.is_empty())?;
    let optional = |field: Option<&str>| {
        field
            .filter(|f| !f.is_empty() && *f != "0")
            .map(str::to_string)
    };

    Some(InstrumentIdentity {
        manufacturer: manufacturer.to_string(),
        model: model.to_string(),
        serial: optional(fields.next()),
        firmware: optional(fields.next()),
        port,
    })
}
