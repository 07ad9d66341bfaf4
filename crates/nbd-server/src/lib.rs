//! Oldstyle NBD protocol endpoint.
//!
//! Accepts a single client, performs the fixed oldstyle handshake and then
//! services READ/WRITE/FLUSH/TRIM/DISCONNECT requests against a
//! [`BlockDevice`]. All multi-byte wire integers are big-endian. Data errors
//! on individual commands are answered with POSIX error codes in the reply
//! header and never tear down the connection; protocol violations do.
//!
//! Shutdown is cooperative: an interrupt flag is checked at the top of every
//! request cycle, and an `EINTR` out of a blocking socket read surfaces as
//! [`NbdError::Interrupted`] so the driver can flush and close workers.

#![deny(unsafe_code)]

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

/// READ command code.
pub const CMD_READ: u32 = 0;
/// WRITE command code.
pub const CMD_WRITE: u32 = 1;
/// DISCONNECT command code.
pub const CMD_DISC: u32 = 2;
/// FLUSH command code.
pub const CMD_FLUSH: u32 = 3;
/// TRIM command code.
pub const CMD_TRIM: u32 = 4;

/// Export has flags beyond read-only.
pub const FLAG_HAS_FLAGS: u32 = 0b00_0001;
/// Export is read-only (not used by this server).
pub const FLAG_READ_ONLY: u32 = 0b00_0010;
/// Client may send FLUSH.
pub const FLAG_SEND_FLUSH: u32 = 0b00_0100;
/// Client may send TRIM.
pub const FLAG_SEND_TRIM: u32 = 0b10_0000;

const HANDSHAKE_PASSWD: &[u8; 8] = b"NBDMAGIC";
const HANDSHAKE_MAGIC: u64 = 0x0000_4202_8186_1253;
const REQUEST_MAGIC: u32 = 0x2560_9513;
const REPLY_MAGIC: [u8; 4] = *b"gDf\x98";
const REQUEST_LEN: usize = 28;

/// POSIX error code carried in a reply header. Zero is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub u32);

impl Errno {
    /// Input/output error; used for checksum and corruption failures.
    pub const EIO: Self = Self(5);
    /// Invalid argument; used for commands this server does not know.
    pub const EINVAL: Self = Self(22);
}

/// What a finished session means to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client sent DISCONNECT.
    Disconnected,
}

/// Errors terminating a session.
#[derive(Debug, thiserror::Error)]
pub enum NbdError {
    /// Socket failure.
    #[error("io: {0}")]
    Io(#[from] io::Error),
    /// Cooperative shutdown: interrupt flag set or EINTR out of a recv.
    #[error("interrupted")]
    Interrupted,
    /// The client went away without sending DISCONNECT.
    #[error("client unexpectedly closed the connection")]
    ClientClosed,
    /// The client violated the wire protocol.
    #[error("protocol: {0}")]
    Protocol(String),
}

/// The logical byte range a session reads and writes.
pub trait BlockDevice: Send {
    /// Read `length` bytes at `offset`.
    fn read(&mut self, offset: u64, length: usize) -> Result<Vec<u8>, Errno>;
    /// Write `data` at `offset`.
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), Errno>;
    /// Make every acknowledged write durable before returning.
    fn flush(&mut self) -> Result<(), Errno>;
    /// Discard `length` bytes at `offset`.
    fn trim(&mut self, offset: u64, length: u64) -> Result<(), Errno>;
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    disconnects: AtomicU64,
    flushes: AtomicU64,
    trims: AtomicU64,
}

/// Per-command counters for a server.
#[derive(Debug, Clone, Copy, Default)]
pub struct NbdStats {
    /// READ commands served.
    pub reads: u64,
    /// WRITE commands served.
    pub writes: u64,
    /// DISCONNECT commands served.
    pub disconnects: u64,
    /// FLUSH commands served.
    pub flushes: u64,
    /// TRIM commands served.
    pub trims: u64,
}

/// A bound NBD endpoint. One client at a time; [`NbdServer::serve_one`] runs
/// a whole session and can be called again to accept the next client.
pub struct NbdServer {
    listener: TcpListener,
    size: u64,
    counters: Arc<Counters>,
    interrupted: Arc<AtomicBool>,
}

impl NbdServer {
    /// Bind the listener. `size` is the virtual device length advertised in
    /// the handshake. Binding port 0 picks a free port; see
    /// [`NbdServer::local_addr`].
    pub fn bind<A: ToSocketAddrs>(addr: A, size: u64) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            size,
            counters: Arc::new(Counters::default()),
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Share an externally owned interrupt flag (e.g. one a signal handler
    /// sets).
    #[must_use]
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = flag;
        self
    }

    /// The flag that stops the request loop when set.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    /// Address the listener actually bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Snapshot of the per-command counters.
    pub fn stats(&self) -> NbdStats {
        NbdStats {
            reads: self.counters.reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            disconnects: self.counters.disconnects.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            trims: self.counters.trims.load(Ordering::Relaxed),
        }
    }

    /// Accept one client and service it until DISCONNECT, an interrupt, or a
    /// terminal error.
    pub fn serve_one(&self, device: &mut dyn BlockDevice) -> Result<SessionEnd, NbdError> {
        let (mut stream, peer) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Err(NbdError::Interrupted),
            Err(e) => return Err(NbdError::Io(e)),
        };
        info!(%peer, "client connected");
        self.handshake(&mut stream)?;
        let result = self.request_loop(&mut stream, device);
        if let Err(e) = &result {
            debug!(%peer, error = %e, "session ended");
        }
        result
    }

    fn handshake(&self, stream: &mut TcpStream) -> Result<(), NbdError> {
        let flags = FLAG_HAS_FLAGS | FLAG_SEND_FLUSH | FLAG_SEND_TRIM;
        let mut hello = Vec::with_capacity(152);
        hello.extend_from_slice(HANDSHAKE_PASSWD);
        hello.extend_from_slice(&HANDSHAKE_MAGIC.to_be_bytes());
        hello.extend_from_slice(&self.size.to_be_bytes());
        hello.extend_from_slice(&flags.to_be_bytes());
        hello.extend_from_slice(&[0u8; 124]);
        stream.write_all(&hello)?;
        Ok(())
    }

    fn request_loop(
        &self,
        stream: &mut TcpStream,
        device: &mut dyn BlockDevice,
    ) -> Result<SessionEnd, NbdError> {
        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                return Err(NbdError::Interrupted);
            }
            let mut header = [0u8; REQUEST_LEN];
            recv_exact(stream, &mut header)?;

            let magic = u32::from_be_bytes(header[0..4].try_into().expect("fixed slice"));
            if magic != REQUEST_MAGIC {
                return Err(NbdError::Protocol(format!(
                    "invalid request magic {magic:#010x} sent by the client"
                )));
            }
            let command = u32::from_be_bytes(header[4..8].try_into().expect("fixed slice"));
            let handle: [u8; 8] = header[8..16].try_into().expect("fixed slice");
            let offset = u64::from_be_bytes(header[16..24].try_into().expect("fixed slice"));
            let length = u32::from_be_bytes(header[24..28].try_into().expect("fixed slice"));

            match command {
                CMD_READ => {
                    self.counters.reads.fetch_add(1, Ordering::Relaxed);
                    match device.read(offset, length as usize) {
                        Ok(data) => {
                            send_reply(stream, 0, &handle)?;
                            stream.write_all(&data)?;
                        }
                        Err(errno) => send_reply(stream, errno.0, &handle)?,
                    }
                }
                CMD_WRITE => {
                    self.counters.writes.fetch_add(1, Ordering::Relaxed);
                    let mut data = vec![0u8; length as usize];
                    recv_exact(stream, &mut data)?;
                    let errno = device.write(offset, &data).err().map_or(0, |e| e.0);
                    send_reply(stream, errno, &handle)?;
                }
                CMD_DISC => {
                    self.counters.disconnects.fetch_add(1, Ordering::Relaxed);
                    info!("client disconnected");
                    return Ok(SessionEnd::Disconnected);
                }
                CMD_FLUSH => {
                    self.counters.flushes.fetch_add(1, Ordering::Relaxed);
                    let errno = device.flush().err().map_or(0, |e| e.0);
                    send_reply(stream, errno, &handle)?;
                }
                CMD_TRIM => {
                    self.counters.trims.fetch_add(1, Ordering::Relaxed);
                    let errno = device.trim(offset, u64::from(length)).err().map_or(0, |e| e.0);
                    send_reply(stream, errno, &handle)?;
                }
                unknown => {
                    warn!(command = unknown, "unknown NBD command; answering EINVAL");
                    send_reply(stream, Errno::EINVAL.0, &handle)?;
                }
            }
        }
    }
}

/// Fill `buf` from the socket. Zero bytes mean the client went away; an
/// `EINTR` is surfaced as [`NbdError::Interrupted`] so a signal can stop a
/// blocked server.
fn recv_exact(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), NbdError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(NbdError::ClientClosed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                return Err(NbdError::Interrupted)
            }
            Err(e) => return Err(NbdError::Io(e)),
        }
    }
    Ok(())
}

fn send_reply(stream: &mut TcpStream, errno: u32, handle: &[u8; 8]) -> Result<(), NbdError> {
    let mut reply = [0u8; 16];
    reply[0..4].copy_from_slice(&REPLY_MAGIC);
    reply[4..8].copy_from_slice(&errno.to_be_bytes());
    reply[8..16].copy_from_slice(handle);
    stream.write_all(&reply)?;
    Ok(())
}
