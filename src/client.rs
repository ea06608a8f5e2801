//! The TFTP client transfer state machine.
//!
//! A [`TransferSession`] owns the socket, the local file and a send and a
//! receive buffer. Each call to [`TransferSession::step`] performs one
//! logical step of the transfer (send a packet and/or block for the next
//! datagram) and returns the next [`State`]. There is no timeout and no retransmission:
//! a silent peer blocks the session forever, and every failure ends it.
//!
//! # Examples
//!
//! Download a file in binary mode:
//! ```no_run
//! use tftpclient::client::{run_session, SessionParams};
//! use tftpclient::TransferMode;
//!
//! let params = SessionParams::get("192.168.1.100", "boot.img")
//!     .with_local_path("/tmp/boot.img")
//!     .with_mode(TransferMode::Octet);
//!
//! let outcome = run_session(&params)?;
//! println!("{} bytes, last block #{}", outcome.bytes, outcome.last_block);
//! # Ok::<(), tftpclient::client::SessionError>(())
//! ```

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::path::PathBuf;

use log::{debug, trace, warn};
use thiserror::Error;

use crate::encode_ack;
use crate::encode_data;
use crate::encode_error;
use crate::encode_request;
use crate::is_netascii;
use crate::text;
use crate::DataPacket;
use crate::DecodeError;
use crate::ErrorCode;
use crate::ErrorPacket;
use crate::Opcode;
use crate::Packet;
use crate::RequestPacket;
use crate::TransferMode;
use crate::BLOCK_SIZE;
use crate::DEFAULT_PORT;
use crate::PACKET_SIZE;

/// A connectionless datagram endpoint.
pub trait Transport {
    fn send_to(&mut self, buf: &[u8], peer: SocketAddr) -> io::Result<()>;

    /// Blocks until a datagram arrives, returning its length and source.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

impl Transport for UdpSocket {
    fn send_to(&mut self, buf: &[u8], peer: SocketAddr) -> io::Result<()> {
        UdpSocket::send_to(self, buf, peer).map(|_| ())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }
}

#[derive(Debug)]
#[derive(Clone, Copy)]
#[derive(PartialEq, Eq)]
pub enum Direction {
    /// Download a remote file (RRQ).
    Get,
    /// Upload a local file (WRQ).
    Put,
}

/// States of the transfer state machine.
///
/// `Recv` and `Send` name whose turn it conceptually is,
/// not the direction of the next socket call.
#[derive(Debug)]
#[derive(Clone, Copy)]
#[derive(PartialEq, Eq)]
pub enum State {
    Init,
    Recv,
    Send,
    End,
}

/// Everything needed to start a transfer.
///
/// # Example
///
/// ```rust
/// use tftpclient::client::{Direction, SessionParams};
/// use tftpclient::TransferMode;
///
/// let params = SessionParams::put("10.0.0.1", "config.txt")
///     .with_port(6969)
///     .with_mode(TransferMode::NetAscii);
///
/// assert_eq!(params.direction, Direction::Put);
/// assert_eq!(params.local_path.to_str(), Some("config.txt"));
/// ```
#[derive(Debug)]
#[derive(Clone)]
#[derive(PartialEq, Eq)]
pub struct SessionParams {
    /// Server host name or IPv4 address
    pub host: String,
    /// Server port number (usually 69)
    pub port: u16,
    pub local_path: PathBuf,
    pub remote_file: String,
    pub direction: Direction,
    pub mode: TransferMode,
}

impl SessionParams {
    /// The local path defaults to the remote file name, the port to 69
    /// and the mode to [`TransferMode::Octet`].
    pub fn new(
        host: impl Into<String>,
        remote_file: impl Into<String>,
        direction: Direction,
    ) -> Self {
        let remote_file = remote_file.into();
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            local_path: PathBuf::from(&remote_file),
            remote_file,
            direction,
            mode: TransferMode::Octet,
        }
    }

    pub fn get(host: impl Into<String>, remote_file: impl Into<String>) -> Self {
        Self::new(host, remote_file, Direction::Get)
    }

    pub fn put(host: impl Into<String>, remote_file: impl Into<String>) -> Self {
        Self::new(host, remote_file, Direction::Put)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_mode(mut self, mode: TransferMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_local_path(mut self, local_path: impl Into<PathBuf>) -> Self {
        self.local_path = local_path.into();
        self
    }
}

/// Progress notifications, delivered to the observer installed with
/// [`TransferSession::with_observer`].
#[derive(Debug)]
#[derive(Clone)]
#[derive(PartialEq, Eq)]
#[non_exhaustive]
pub enum Event {
    RequestSent { opcode: Opcode, mode: TransferMode },
    /// The server's first reply fixed the transaction id.
    TransactionId { peer: SocketAddr },
    DataReceived { block: u16, len: usize },
    DataSent { block: u16, len: usize },
    AckSent { block: u16 },
    AckReceived { block: u16 },
    ErrorReceived { code: ErrorCode, message: String },
}

/// Summary of a completed transfer.
#[derive(Debug)]
#[derive(Clone, Copy)]
#[derive(PartialEq, Eq)]
pub struct TransferOutcome {
    /// Bytes written to (GET) or read from (PUT) the local file.
    pub bytes: u64,
    /// Number of the last DATA block exchanged.
    pub last_block: u16,
}

/// An error that ends a transfer session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("cannot resolve IPv4 address of '{host}'")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot open UDP socket")]
    Socket(#[source] io::Error),
    #[error("cannot open local file '{}'", .path.display())]
    LocalFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("illegal filename '{filename}': {kind}")]
    Filename {
        filename: String,
        kind: FilenameErrorKind,
    },
    #[error("transfer mode '{0}' cannot be requested")]
    UnsupportedMode(TransferMode),
    #[error("transport failure")]
    Transport(#[source] io::Error),
    #[error("local file I/O failure")]
    LocalIo(#[source] io::Error),
    #[error("malformed packet")]
    Decode(#[from] DecodeError),
    #[error("TFTP error: {code}, '{message}'")]
    Peer { code: ErrorCode, message: String },
    #[error("unexpected {event} packet in state {state:?}")]
    UnexpectedPacket { state: State, event: Opcode },
}

/// The reasons a remote filename cannot be requested.
#[derive(Debug, Error)]
#[derive(Clone, Copy)]
#[derive(PartialEq, Eq)]
#[non_exhaustive]
pub enum FilenameErrorKind {
    #[error("empty")]
    Empty,
    #[error("contains a nul byte")]
    Nul,
    #[error("contains a line break")]
    NotNetascii,
    #[error("too long (maximum len: {max_len}; actual len: {actual_len})")]
    TooLong { actual_len: usize, max_len: usize },
}

/// One client transfer, from the initial request to the terminal state.
pub struct TransferSession<T = UdpSocket, F = File> {
    transport: T,
    /// The server's well-known address until the first reply,
    /// then the address of the transfer's transaction id.
    peer: SocketAddr,
    tid: Option<u16>,
    block: u16,
    file: F,
    remote_file: CString,
    direction: Direction,
    mode: TransferMode,
    state: State,
    event: Opcode,
    tx: [u8; PACKET_SIZE],
    // one byte past the largest packet, so an oversized datagram is not
    // cut down to a valid full block
    rx: [u8; PACKET_SIZE + 1],
    received: usize,
    // netascii-encoded bytes read from the file but not sent yet
    staged: Vec<u8>,
    eof: bool,
    bytes: u64,
    observer: Box<dyn FnMut(&Event)>,
}

impl TransferSession<UdpSocket, File> {
    /// Resolves the server, opens the socket and the local file.
    ///
    /// Fails before anything is sent, and before the local file is
    /// created, if the request cannot be made.
    pub fn open(params: &SessionParams) -> Result<Self, SessionError> {
        request_filename(&params.remote_file, params.mode)?;

        let server = resolve(&params.host, params.port)?;
        let socket =
            UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(SessionError::Socket)?;

        let file = match params.direction {
            | Direction::Get => File::create(&params.local_path),
            | Direction::Put => File::open(&params.local_path),
        }
        .map_err(|source| SessionError::LocalFile {
            path: params.local_path.clone(),
            source,
        })?;

        debug!(
            "{:?} {} {} {}:{}",
            params.direction,
            params.remote_file,
            params.local_path.display(),
            server.ip(),
            server.port()
        );

        Self::new(
            socket,
            server,
            file,
            &params.remote_file,
            params.direction,
            params.mode,
        )
    }
}

impl<T: Transport, F: Read + Write> TransferSession<T, F> {
    /// Creates a session in the [`Init`](State::Init) state that will
    /// request `remote_file` from `server` over `transport`.
    pub fn new(
        transport: T,
        server: SocketAddr,
        file: F,
        remote_file: &str,
        direction: Direction,
        mode: TransferMode,
    ) -> Result<Self, SessionError> {
        let remote_file = request_filename(remote_file, mode)?;
        let event = match direction {
            | Direction::Get => Opcode::Rrq,
            | Direction::Put => Opcode::Wrq,
        };

        Ok(Self {
            transport,
            peer: server,
            tid: None,
            block: 0,
            file,
            remote_file,
            direction,
            mode,
            state: State::Init,
            event,
            tx: [0; PACKET_SIZE],
            rx: [0; PACKET_SIZE + 1],
            received: 0,
            staged: Vec::new(),
            eof: false,
            bytes: 0,
            observer: Box::new(|_| {}),
        })
    }

    pub fn with_observer(mut self, observer: impl FnMut(&Event) + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The opcode of the last packet seen, or of the request to send.
    pub fn event(&self) -> Opcode {
        self.event
    }

    pub fn block(&self) -> u16 {
        self.block
    }

    /// The server's source port for this transfer, once it replied.
    pub fn transaction_id(&self) -> Option<u16> {
        self.tid
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn local_file(&self) -> &F {
        &self.file
    }

    pub fn outcome(&self) -> TransferOutcome {
        TransferOutcome {
            bytes: self.bytes,
            last_block: self.block,
        }
    }

    /// Drives the session to [`State::End`].
    ///
    /// The socket and the file are released when this returns,
    /// whether the transfer succeeded or not.
    pub fn run(mut self) -> Result<TransferOutcome, SessionError> {
        while self.step()? != State::End {}
        Ok(self.outcome())
    }

    /// Performs one step of the transfer and returns the next state.
    ///
    /// Any error moves the session to [`State::End`]. Stepping a session
    /// that already ended does nothing.
    pub fn step(&mut self) -> Result<State, SessionError> {
        let result = match (self.state, self.event) {
            | (State::Init, Opcode::Rrq | Opcode::Wrq) => self.send_request(),
            | (State::Recv | State::Send, Opcode::Error) => self.handle_error(),
            | (State::Recv, Opcode::Data) if self.direction == Direction::Get => {
                self.receive_data()
            }
            | (State::Recv, Opcode::Ack) if self.direction == Direction::Put => {
                self.send_data()
            }
            | (State::Send, Opcode::Ack) => self.acknowledge(),
            | (State::End, _) => Ok(State::End),
            // protocol violation, abort
            | (state, event) => Err(SessionError::UnexpectedPacket { state, event }),
        };

        match result {
            | Ok(next) => {
                debug!("{:?} -> {:?}, event {}", self.state, next, self.event);
                self.state = next;
                Ok(next)
            }
            | Err(error) => {
                debug!("{:?} -> {:?}: {error}", self.state, State::End);
                self.state = State::End;
                self.notify_peer(&error);
                Err(error)
            }
        }
    }

    fn send_request(&mut self) -> Result<State, SessionError> {
        let request = RequestPacket {
            filename: self.remote_file.as_c_str(),
            mode: self.mode,
        };
        let len = encode_request(self.event, &request, &mut self.tx);
        self.send(len)?;
        self.notify(Event::RequestSent {
            opcode: self.event,
            mode: self.mode,
        });

        let source = self.receive()?;
        // later datagrams are not checked against this
        self.peer = source;
        self.tid = Some(source.port());
        debug!("transaction id {} learned from {source}", source.port());
        self.notify(Event::TransactionId { peer: source });

        self.classify()?;
        Ok(State::Recv)
    }

    fn handle_error(&mut self) -> Result<State, SessionError> {
        let Packet::Error(ErrorPacket { code, message }) =
            Packet::decode(&self.rx[..self.received])?
        else {
            return Err(self.unexpected());
        };

        let message = message.to_string_lossy().into_owned();
        self.notify(Event::ErrorReceived {
            code,
            message: message.clone(),
        });
        Err(SessionError::Peer { code, message })
    }

    fn receive_data(&mut self) -> Result<State, SessionError> {
        let Packet::Data(data) = Packet::decode(&self.rx[..self.received])? else {
            return Err(self.unexpected());
        };

        let written = match self.mode {
            | TransferMode::NetAscii => {
                let host = text::to_host(data.payload);
                self.file.write_all(&host).map(|()| host.len())
            }
            | _ => self.file.write_all(data.payload).map(|()| data.len()),
        }
        .map_err(SessionError::LocalIo)?;

        let DataPacket { block, payload } = data;
        let (len, last) = (payload.len(), data.is_final());
        self.block = block;
        self.bytes += written as u64;
        self.event = Opcode::Ack;
        self.notify(Event::DataReceived { block, len });

        if !last {
            return Ok(State::Send);
        }

        self.file.flush().map_err(SessionError::LocalIo)?;
        let len = encode_ack(block, &mut self.tx);
        self.send(len)?;
        self.notify(Event::AckSent { block });
        Ok(State::End)
    }

    fn send_data(&mut self) -> Result<State, SessionError> {
        let Packet::Ack(ack) = Packet::decode(&self.rx[..self.received])? else {
            return Err(self.unexpected());
        };
        self.notify(Event::AckReceived { block: ack.block });

        self.block = ack.block.wrapping_add(1);
        let payload = self.next_payload()?;
        let data = DataPacket {
            block: self.block,
            payload: &payload,
        };
        let len = encode_data(&data, &mut self.tx);
        self.send(len)?;
        self.notify(Event::DataSent {
            block: self.block,
            len: payload.len(),
        });

        self.receive()?;
        self.classify()?;

        if payload.len() < BLOCK_SIZE {
            // the reply to the last block is only looked at for errors
            if self.event == Opcode::Error {
                return self.handle_error();
            }
            return Ok(State::End);
        }
        Ok(State::Recv)
    }

    fn acknowledge(&mut self) -> Result<State, SessionError> {
        let len = encode_ack(self.block, &mut self.tx);
        self.send(len)?;
        self.notify(Event::AckSent { block: self.block });

        self.receive()?;
        self.classify()?;
        Ok(State::Recv)
    }

    /// Takes the next DATA payload, at most [`BLOCK_SIZE`] bytes,
    /// from the local file.
    fn next_payload(&mut self) -> Result<Vec<u8>, SessionError> {
        if self.mode != TransferMode::NetAscii {
            let block = read_block(&mut self.file).map_err(SessionError::LocalIo)?;
            self.bytes += block.len() as u64;
            return Ok(block);
        }

        while self.staged.len() < BLOCK_SIZE && !self.eof {
            let raw = read_block(&mut self.file).map_err(SessionError::LocalIo)?;
            self.eof = raw.len() < BLOCK_SIZE;
            self.bytes += raw.len() as u64;
            self.staged.extend(text::to_network(&raw));
        }

        let len = self.staged.len().min(BLOCK_SIZE);
        Ok(self.staged.drain(..len).collect())
    }

    fn send(&mut self, len: usize) -> Result<(), SessionError> {
        trace!("sending {len} bytes to {}", self.peer);
        self.transport
            .send_to(&self.tx[..len], self.peer)
            .map_err(SessionError::Transport)
    }

    /// Blocks for the next datagram, leaving it in the receive buffer.
    fn receive(&mut self) -> Result<SocketAddr, SessionError> {
        let (len, source) = self
            .transport
            .recv_from(&mut self.rx)
            .map_err(SessionError::Transport)?;
        trace!("received {len} bytes from {source}");
        self.received = len;
        Ok(source)
    }

    /// Records the opcode of the received datagram as the next event.
    fn classify(&mut self) -> Result<(), SessionError> {
        self.event = Packet::decode(&self.rx[..self.received])?.opcode();
        Ok(())
    }

    fn unexpected(&self) -> SessionError {
        SessionError::UnexpectedPacket {
            state: self.state,
            event: self.event,
        }
    }

    fn notify(&mut self, event: Event) {
        (self.observer)(&event);
    }

    /// Tells the peer, once, why the transfer is being abandoned.
    fn notify_peer(&mut self, error: &SessionError) {
        if self.tid.is_none() {
            return;
        }

        let (code, message) = match error {
            | SessionError::Decode(_) | SessionError::UnexpectedPacket { .. } => {
                (ErrorCode::IllegalOperation, c"illegal TFTP operation".to_owned())
            }
            | SessionError::LocalIo(source) => {
                let mut message = source.to_string().into_bytes();
                message.retain(|&byte| byte != 0);
                message.truncate(BLOCK_SIZE - 1);
                (ErrorCode::Undefined, CString::new(message).unwrap_or_default())
            }
            | _ => return,
        };

        let error = ErrorPacket {
            code,
            message: &message,
        };
        let len = encode_error(&error, &mut self.tx);
        if let Err(e) = self.send(len) {
            warn!("cannot report abort to {}: {e}", self.peer);
        }
    }
}

/// Runs a whole transfer described by `params`.
pub fn run_session(params: &SessionParams) -> Result<TransferOutcome, SessionError> {
    TransferSession::open(params)?.run()
}

/// Like [`run_session`], delivering progress [`Event`]s to `observer`.
pub fn run_session_with(
    params: &SessionParams,
    observer: impl FnMut(&Event) + 'static,
) -> Result<TransferOutcome, SessionError> {
    TransferSession::open(params)?.with_observer(observer).run()
}

fn request_filename(remote_file: &str, mode: TransferMode) -> Result<CString, SessionError> {
    if mode == TransferMode::Mail {
        return Err(SessionError::UnsupportedMode(mode));
    }

    let illegal = |kind: FilenameErrorKind| SessionError::Filename {
        filename: remote_file.to_owned(),
        kind,
    };

    if remote_file.is_empty() {
        return Err(illegal(FilenameErrorKind::Empty));
    }
    let filename = CString::new(remote_file).map_err(|_| illegal(FilenameErrorKind::Nul))?;
    if !is_netascii(filename.as_bytes().iter().copied()) {
        return Err(illegal(FilenameErrorKind::NotNetascii));
    }

    let request = RequestPacket {
        filename: &filename,
        mode,
    };
    if request.encoded_len() > PACKET_SIZE {
        let actual_len = remote_file.len();
        return Err(illegal(FilenameErrorKind::TooLong {
            actual_len,
            max_len: PACKET_SIZE - (request.encoded_len() - actual_len),
        }));
    }

    Ok(filename)
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, SessionError> {
    let unresolved = |source: io::Error| SessionError::Resolve {
        host: host.to_owned(),
        source,
    };

    (host, port)
        .to_socket_addrs()
        .map_err(unresolved)?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| {
            unresolved(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no IPv4 address",
            ))
        })
}

fn read_block(file: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut block = Vec::with_capacity(BLOCK_SIZE);
    file.take(BLOCK_SIZE as u64).read_to_end(&mut block)?;
    Ok(block)
}
