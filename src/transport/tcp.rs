//! TCP transport and server.
//!
//! Frames are a u32 little-endian payload length, the MessagePack payload,
//! then a u32 little-endian CRC32 of the payload. The first client frame is
//! always [`ClientMessage::Connect`].

use super::{Connector, Transport, TransportEvent};
use crate::error::{Result, SyncError};
use crate::host::Host;
use crate::protocol::{decode_message, encode_message, ClientMessage, ServerMessage};
use crate::types::{CancellationToken, ConnectionId};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// URI scheme accepted by [`TcpConnector::from_uri`].
pub const SCHEME: &str = "tcp://";

/// Largest accepted frame payload.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// How often the accept loop checks for cancellation.
const ACCEPT_POLL: Duration = Duration::from_millis(10);

pub(crate) fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let encoded = encode_message(message)?;
    if encoded.len() > MAX_FRAME_LEN {
        return Err(SyncError::Transport(format!(
            "frame of {} bytes exceeds limit",
            encoded.len()
        )));
    }
    writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
    writer.write_all(&encoded)?;
    writer.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream.
pub(crate) fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(SyncError::InvalidFormat("frame too large".into()));
    }

    let mut encoded = vec![0u8; len];
    reader.read_exact(&mut encoded)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let expected = u32::from_le_bytes(checksum_bytes);
    let got = crc32fast::hash(&encoded);
    if expected != got {
        return Err(SyncError::ChecksumMismatch { expected, got });
    }

    decode_message(&encoded).map(Some)
}

/// Connects to a host listening on a TCP address.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Parse a `tcp://host:port` URI.
    pub fn from_uri(uri: &str) -> Result<Self> {
        match uri.strip_prefix(SCHEME) {
            Some(addr) if !addr.is_empty() => Ok(Self::new(addr)),
            _ => Err(SyncError::Config(format!("unsupported host URI: {}", uri))),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Connector for TcpConnector {
    fn connect(&self, module: &str, token: Option<&str>) -> Result<Box<dyn Transport>> {
        let transport = TcpTransport::connect(&self.addr, module, token)?;
        Ok(Box::new(transport))
    }
}

/// Client end of a TCP connection. A reader thread decodes frames into a
/// channel that [`Transport::poll`] drains.
pub struct TcpTransport {
    writer: BufWriter<TcpStream>,
    events: Receiver<TransportEvent>,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

impl TcpTransport {
    pub fn connect(addr: &str, module: &str, token: Option<&str>) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| SyncError::Connection(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        let read_half = stream.try_clone()?;

        let mut writer = BufWriter::new(stream);
        write_frame(
            &mut writer,
            &ClientMessage::Connect {
                module: module.to_string(),
                token: token.map(String::from),
            },
        )?;

        let (tx, events) = unbounded();
        let reader = thread::Builder::new()
            .name("tablesync-tcp-reader".into())
            .spawn(move || read_loop(read_half, tx))?;
        debug!(target: "tablesync::transport", addr, module, "tcp connected");

        Ok(Self {
            writer,
            events,
            reader: Some(reader),
            closed: false,
        })
    }
}

fn read_loop(stream: TcpStream, tx: Sender<TransportEvent>) {
    let mut reader = BufReader::new(stream);
    loop {
        let event = match read_frame::<_, ServerMessage>(&mut reader) {
            Ok(Some(message)) => TransportEvent::Message(message),
            Ok(None) => TransportEvent::Closed(Some("connection closed by host".into())),
            Err(e) => TransportEvent::Closed(Some(e.to_string())),
        };
        let last = matches!(event, TransportEvent::Closed(_));
        if tx.send(event).is_err() || last {
            return;
        }
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, message: ClientMessage) -> Result<()> {
        if self.closed {
            return Err(SyncError::NotConnected);
        }
        let disconnect = matches!(message, ClientMessage::Disconnect);
        write_frame(&mut self.writer, &message)
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        if disconnect {
            self.close();
        }
        Ok(())
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        if self.closed {
            return Vec::new();
        }
        let events: Vec<_> = self.events.try_iter().collect();
        if events.iter().any(|e| matches!(e, TransportEvent::Closed(_))) {
            self.closed = true;
        }
        events
    }

    fn close(&mut self) {
        if self.closed && self.reader.is_none() {
            return;
        }
        self.closed = true;
        let _ = self.writer.flush();
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Serve `host` on `listener` until `cancel` is raised, then close every
/// session.
///
/// Each connection gets a reader thread, which feeds the host, and a writer
/// thread, which drains the session outbox onto the socket.
pub fn serve(host: Arc<Host>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
    listener.set_nonblocking(true)?;
    info!(target: "tablesync::server", addr = ?listener.local_addr().ok(), module = host.module_name(), "listening");

    while !cancel.is_cancelled() {
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                let host = Arc::clone(&host);
                let spawned = thread::Builder::new()
                    .name(format!("tablesync-session-{}", peer))
                    .spawn(move || {
                        if let Err(e) = serve_connection(host, stream, peer) {
                            warn!(target: "tablesync::server", %peer, error = %e, "connection failed");
                        }
                    });
                if let Err(e) = spawned {
                    warn!(target: "tablesync::server", %peer, error = %e, "could not spawn session thread");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => warn!(target: "tablesync::server", error = %e, "accept failed"),
        }
    }

    info!(target: "tablesync::server", sessions = host.session_count(), "shutting down");
    host.shutdown();
    Ok(())
}

fn serve_connection(host: Arc<Host>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    let (module, token) = match read_frame::<_, ClientMessage>(&mut reader)? {
        Some(ClientMessage::Connect { module, token }) => (module, token),
        Some(other) => {
            return Err(SyncError::Connection(format!(
                "expected handshake, got {:?}",
                other
            )))
        }
        None => return Ok(()),
    };

    if module != host.module_name() {
        let reason = SyncError::UnknownModule(module).to_string();
        write_frame(&mut writer, &ServerMessage::ConnectRefused { reason })?;
        return Ok(());
    }

    let (outbox, inbox) = unbounded();
    let connection_id = match host.open_session(token.as_deref(), outbox) {
        Ok((connection_id, _)) => connection_id,
        Err(e) => {
            write_frame(
                &mut writer,
                &ServerMessage::ConnectRefused {
                    reason: e.to_string(),
                },
            )?;
            return Ok(());
        }
    };
    debug!(target: "tablesync::server", %peer, connection = connection_id.0, "handshake complete");
    let session = SessionGuard {
        host: host.as_ref(),
        connection_id,
    };

    let outgoing = thread::Builder::new()
        .name(format!("tablesync-writer-{}", peer))
        .spawn(move || write_loop(writer, inbox))?;

    loop {
        match read_frame::<_, ClientMessage>(&mut reader) {
            Ok(Some(ClientMessage::Disconnect)) | Ok(None) => break,
            Ok(Some(message)) => {
                if let Err(e) = host.handle_message(connection_id, message) {
                    warn!(target: "tablesync::server", connection = connection_id.0, error = %e, "message rejected");
                }
            }
            Err(e) => {
                warn!(target: "tablesync::server", connection = connection_id.0, error = %e, "read failed");
                break;
            }
        }
    }

    drop(session);
    let _ = outgoing.join();
    Ok(())
}

/// Closes the session however the reader exits, so the writer thread sees
/// its outbox drop.
struct SessionGuard<'h> {
    host: &'h Host,
    connection_id: ConnectionId,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.host.close_session(self.connection_id);
    }
}

/// Runs until the host drops the session outbox.
fn write_loop(mut writer: BufWriter<TcpStream>, inbox: Receiver<ServerMessage>) {
    for message in inbox.iter() {
        if let Err(e) = write_frame(&mut writer, &message) {
            debug!(target: "tablesync::server", error = %e, "write failed");
            break;
        }
    }
    let _ = writer.flush();
    let _ = writer.get_ref().shutdown(Shutdown::Both);
}
