//! SNI (Server Name Indication) extraction from TLS ClientHello.
//!
//! Two pieces live here:
//! - [`parse_sni`]: a pure parser over one TLS record. Every short or
//!   malformed field yields `None`, which is the normal answer for non-TLS
//!   traffic or a ClientHello without SNI.
//! - [`SniInspector`]: reads the first TLS record off the downstream stream
//!   (bounded in time and size) so the captured bytes can be forwarded
//!   upstream verbatim before relaying starts.

use std::io;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default timeout for reading the ClientHello.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(4);

/// Default cap on captured bytes (16KB).
pub const DEFAULT_MAX_SNIFF_BYTES: usize = 16 * 1024;

/// TLS record header: type(1) + version(2) + length(2).
pub const RECORD_HEADER_LEN: usize = 5;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Bytes per read while filling or draining.
const READ_CHUNK: usize = 2048;

/// Configuration for ClientHello capture.
#[derive(Debug, Clone)]
pub struct SniffConfig {
    /// Maximum time to wait for the record.
    pub timeout: Duration,
    /// Maximum bytes to capture.
    pub max_bytes: usize,
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_bytes: DEFAULT_MAX_SNIFF_BYTES,
        }
    }
}

/// Bytes captured before relaying, plus the SNI parsed from them.
///
/// The bytes must be written upstream exactly once before the pumps start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHelloSample {
    pub bytes: Vec<u8>,
    pub sni: Option<String>,
}

/// Result of reading the ClientHello off a downstream stream.
#[derive(Debug)]
pub enum SniffOutcome {
    /// Record header (and body, for handshakes) was read in full.
    Captured(ClientHelloSample),
    /// The deadline expired. Partial bytes are kept, SNI is unavailable.
    TimedOut(ClientHelloSample),
    /// The stream ended or failed before the fixed-length part was read.
    Failed(io::Error),
    /// Shutdown or session cancellation fired mid-read.
    Cancelled,
}

/// ClientHello reader for TLS passthrough.
#[derive(Debug, Clone, Default)]
pub struct SniInspector {
    config: SniffConfig,
}

impl SniInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SniffConfig) -> Self {
        Self { config }
    }

    /// Capture the first TLS record from `stream` and parse its SNI.
    pub async fn inspect<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        cancel: &CancellationToken,
    ) -> SniffOutcome {
        let mut buffer = Vec::with_capacity(READ_CHUNK);

        let read = timeout(
            self.config.timeout,
            read_client_hello(stream, &mut buffer, self.config.max_bytes),
        );

        match cancel.run_until_cancelled(read).await {
            None => SniffOutcome::Cancelled,
            Some(Ok(Ok(()))) => {
                let sni = parse_sni(&buffer);
                debug!(bytes = buffer.len(), sni = ?sni, "ClientHello captured");
                SniffOutcome::Captured(ClientHelloSample { bytes: buffer, sni })
            }
            Some(Ok(Err(e))) => SniffOutcome::Failed(e),
            Some(Err(_)) => {
                warn!(
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    bytes = buffer.len(),
                    "ClientHello read timed out"
                );
                SniffOutcome::TimedOut(ClientHelloSample {
                    bytes: buffer,
                    sni: None,
                })
            }
        }
    }
}

/// Read the record header, the declared body, then whatever is already
/// buffered, appending to `buffer` as bytes arrive.
async fn read_client_hello<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut Vec<u8>,
    max_bytes: usize,
) -> io::Result<()> {
    fill(stream, buffer, RECORD_HEADER_LEN).await?;

    if buffer[0] != CONTENT_TYPE_HANDSHAKE {
        return Ok(());
    }

    let record_len = u16::from_be_bytes([buffer[3], buffer[4]]) as usize;
    let target = (RECORD_HEADER_LEN + record_len).min(max_bytes.max(RECORD_HEADER_LEN));
    fill(stream, buffer, target).await?;

    drain_ready(stream, buffer, max_bytes);
    Ok(())
}

/// Read until `buffer` holds `target` bytes. EOF first is an error.
async fn fill<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut Vec<u8>,
    target: usize,
) -> io::Result<()> {
    let mut chunk = [0u8; READ_CHUNK];
    while buffer.len() < target {
        let want = (target - buffer.len()).min(READ_CHUNK);
        let n = stream.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed while reading ClientHello",
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    Ok(())
}

/// Take bytes that are ready right now, without waiting for more.
///
/// Catches ClientHellos split across several records or segments.
fn drain_ready<R: AsyncRead + Unpin>(stream: &mut R, buffer: &mut Vec<u8>, max_bytes: usize) {
    let mut chunk = [0u8; READ_CHUNK];
    while buffer.len() < max_bytes {
        let room = (max_bytes - buffer.len()).min(READ_CHUNK);
        match stream.read(&mut chunk[..room]).now_or_never() {
            Some(Ok(n)) if n > 0 => buffer.extend_from_slice(&chunk[..n]),
            _ => break,
        }
    }
}

/// Bounds-checked big-endian cursor.
struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn remaining(&self) -> usize {
        self.data.len()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() < n {
            return None;
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    /// One-byte length prefix, then that many bytes.
    fn vec8(&mut self) -> Option<&'a [u8]> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    /// Two-byte length prefix, then that many bytes.
    fn vec16(&mut self) -> Option<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}

/// Parse the SNI hostname from a buffer holding one TLS record.
///
/// TLS record:
/// - byte 0: content type (0x16 = handshake)
/// - bytes 1-2: version
/// - bytes 3-4: record length
///
/// ClientHello body:
/// - handshake type (1) + length (3)
/// - client version (2) + random (32)
/// - session id (1-byte length prefix)
/// - cipher suites (2-byte length prefix)
/// - compression methods (1-byte length prefix)
/// - extensions (2-byte length prefix), each type(2) + length(2) + payload
///
/// Returns the first `host_name` entry, lower-cased with trailing dots
/// trimmed.
pub fn parse_sni(data: &[u8]) -> Option<String> {
    let mut record = Cursor::new(data);
    if record.u8()? != CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    record.take(2)?;
    let body = record.vec16()?;

    let mut handshake = Cursor::new(body);
    if handshake.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let handshake_len = handshake.u24()?;
    let mut hello = Cursor::new(handshake.take(handshake_len)?);

    hello.take(2 + 32)?;
    hello.vec8()?;
    hello.vec16()?;
    hello.vec8()?;
    let mut extensions = Cursor::new(hello.vec16()?);

    while extensions.remaining() >= 4 {
        let ext_type = extensions.u16()?;
        let payload = extensions.vec16()?;

        if ext_type == EXTENSION_SERVER_NAME {
            if let Some(host) = parse_server_name(payload) {
                return Some(host);
            }
        }
    }

    None
}

/// Walk a server_name extension payload for the first host_name entry.
fn parse_server_name(payload: &[u8]) -> Option<String> {
    let mut list = Cursor::new(Cursor::new(payload).vec16()?);

    while list.remaining() >= 3 {
        let name_type = list.u8()?;
        let name = list.vec16()?;

        if name_type == NAME_TYPE_HOST_NAME {
            let host = normalize_hostname(&decode_ascii(name));
            return (!host.is_empty()).then_some(host);
        }
    }

    None
}

fn decode_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect()
}

/// Normalize a hostname for comparison: trailing dots trimmed, lower-case.
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}
