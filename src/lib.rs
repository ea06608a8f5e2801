//! A lock-step TFTP (RFC 1350) client.
//!
//! The crate root holds the wire codec: the five packet kinds, their
//! borrowed in-memory representations, [`Packet::decode`] and one encoder
//! per outbound packet kind. [`text`] holds the netascii transcoder and
//! [`client`] the transfer state machine that ties both to a socket.

use core::ffi::CStr;
use core::fmt::Display;

use thiserror::Error;

pub mod client;
pub mod text;

/// Size of the largest datagram exchanged during a transfer.
pub const PACKET_SIZE: usize = HEADER_SIZE + BLOCK_SIZE;

const HEADER_SIZE: usize = OPCODE_SIZE + BLOCK_NO_SIZE;
const OPCODE_SIZE: usize = size_of::<u16>();
const BLOCK_NO_SIZE: usize = size_of::<u16>();

/// Maximum payload of a DATA packet. A shorter payload ends the transfer.
pub const BLOCK_SIZE: usize = 512;

/// The well-known TFTP server port.
pub const DEFAULT_PORT: u16 = 69;

/// A decoded TFTP packet, borrowing its strings and payload from the
/// datagram it was decoded from.
#[derive(Debug)]
#[derive(Clone, Copy)]
#[derive(PartialEq, Eq)]
pub enum Packet<'buf> {
    Rrq(RequestPacket<'buf>),
    Wrq(RequestPacket<'buf>),
    Data(DataPacket<'buf>),
    Ack(AckPacket),
    Error(ErrorPacket<'buf>),
}

impl<'buf> Packet<'buf> {
    pub const fn opcode(&self) -> Opcode {
        match self {
            | Packet::Rrq(_) => Opcode::Rrq,
            | Packet::Wrq(_) => Opcode::Wrq,
            | Packet::Data(_) => Opcode::Data,
            | Packet::Ack(_) => Opcode::Ack,
            | Packet::Error(_) => Opcode::Error,
        }
    }

    /// Decodes a received datagram.
    ///
    /// Never reads past the end of `rx`. Trailing bytes after a complete
    /// RRQ, WRQ, ACK or ERROR packet are ignored.
    pub fn decode(rx: &'buf [u8]) -> Result<Self, DecodeError> {
        let (body, code) = parser::opcode(rx).map_err(truncated)?;
        let opcode = Opcode::try_from(code)?;

        let packet = match opcode {
            | Opcode::Rrq | Opcode::Wrq => {
                let (_, (filename, mode)) = parser::request(body).map_err(truncated)?;
                let request = RequestPacket {
                    filename,
                    mode: TransferMode::try_from(mode)?,
                };
                if opcode == Opcode::Rrq {
                    Packet::Rrq(request)
                } else {
                    Packet::Wrq(request)
                }
            }
            | Opcode::Data => {
                let (_, (block, payload)) = parser::data(body).map_err(truncated)?;
                if payload.len() > BLOCK_SIZE {
                    return Err(DecodeError::Oversized(payload.len()));
                }
                Packet::Data(DataPacket { block, payload })
            }
            | Opcode::Ack => {
                let (_, block) = parser::ack(body).map_err(truncated)?;
                Packet::Ack(AckPacket { block })
            }
            | Opcode::Error => {
                let (_, (code, message)) = parser::error(body).map_err(truncated)?;
                Packet::Error(ErrorPacket {
                    code: ErrorCode::try_from(code)?,
                    message,
                })
            }
        };

        Ok(packet)
    }

    /// Writes the wire form of `self` into `tx` and returns its length.
    pub fn encode(&self, tx: &mut [u8; PACKET_SIZE]) -> usize {
        match self {
            | Packet::Rrq(request) => encode_request(Opcode::Rrq, request, tx),
            | Packet::Wrq(request) => encode_request(Opcode::Wrq, request, tx),
            | Packet::Data(data) => encode_data(data, tx),
            | Packet::Ack(ack) => encode_ack(ack.block, tx),
            | Packet::Error(error) => encode_error(error, tx),
        }
    }
}

fn truncated<E>(_: nom::Err<E>) -> DecodeError {
    DecodeError::Truncated
}

/// Payload of an RRQ or WRQ packet.
#[derive(Debug)]
#[derive(Clone, Copy)]
#[derive(PartialEq, Eq)]
pub struct RequestPacket<'a> {
    pub filename: &'a CStr,
    pub mode: TransferMode,
}

impl<'a> RequestPacket<'a> {
    /// Length of the encoded request, opcode included.
    pub fn encoded_len(&self) -> usize {
        OPCODE_SIZE
            + self.filename.to_bytes_with_nul().len()
            + self.mode.as_cstr().to_bytes_with_nul().len()
    }
}

#[derive(Debug)]
#[derive(Clone, Copy)]
#[derive(PartialEq, Eq)]
pub struct DataPacket<'a> {
    pub block: u16,
    pub payload: &'a [u8],
}

impl<'a> DataPacket<'a> {
    pub const fn len(&self) -> usize {
        self.payload.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Whether this is the last block of a transfer.
    pub const fn is_final(&self) -> bool {
        self.payload.len() < BLOCK_SIZE
    }
}

#[derive(Debug)]
#[derive(Clone, Copy)]
#[derive(PartialEq, Eq)]
pub struct AckPacket {
    pub block: u16,
}

#[derive(Debug)]
#[derive(Clone, Copy)]
#[derive(PartialEq, Eq)]
pub struct ErrorPacket<'a> {
    pub code: ErrorCode,
    /// The error message. Can be empty.
    pub message: &'a CStr,
}

/// Writes an RRQ or WRQ packet into `tx` and returns its length.
///
/// # Panics
///
/// If the request does not fit into `tx`. Check
/// [`RequestPacket::encoded_len`] against [`PACKET_SIZE`] first.
pub fn encode_request(
    opcode: Opcode,
    request: &RequestPacket<'_>,
    tx: &mut [u8; PACKET_SIZE],
) -> usize {
    debug_assert!(matches!(opcode, Opcode::Rrq | Opcode::Wrq));
    debug_assert!(is_netascii(request.mode.as_cstr().to_bytes().iter().copied()));

    must_write(
        tx,
        "request",
        &[
            opcode.to_be_bytes().as_slice(),
            request.filename.to_bytes_with_nul(),
            request.mode.as_cstr().to_bytes_with_nul(),
        ],
    )
}

/// Writes a DATA packet into `tx` and returns its length.
///
/// # Panics
///
/// If the payload is larger than [`BLOCK_SIZE`].
pub fn encode_data(data: &DataPacket<'_>, tx: &mut [u8; PACKET_SIZE]) -> usize {
    must_write(
        tx,
        "data",
        &[
            Opcode::Data.to_be_bytes().as_slice(),
            data.block.to_be_bytes().as_slice(),
            data.payload,
        ],
    )
}

pub fn encode_ack(block: u16, tx: &mut [u8; PACKET_SIZE]) -> usize {
    must_write(
        tx,
        "ack",
        &[
            Opcode::Ack.to_be_bytes().as_slice(),
            block.to_be_bytes().as_slice(),
        ],
    )
}

/// Writes an ERROR packet into `tx` and returns its length.
///
/// # Panics
///
/// If the message does not fit into `tx`.
pub fn encode_error(error: &ErrorPacket<'_>, tx: &mut [u8; PACKET_SIZE]) -> usize {
    must_write(
        tx,
        "error",
        &[
            Opcode::Error.to_be_bytes().as_slice(),
            (error.code as u16).to_be_bytes().as_slice(),
            error.message.to_bytes_with_nul(),
        ],
    )
}

fn must_write(tx: &mut [u8; PACKET_SIZE], name: &str, parts: &[&[u8]]) -> usize {
    let mut tx_bytes = tx.iter_mut();
    let mut written = 0;

    for byte in parts.iter().flat_map(|part| part.iter().copied()) {
        let Some(buf) = tx_bytes.next() else {
            panic!("cannot fit `{name}` into TX buffer");
        };
        *buf = byte;
        written += 1;
    }

    written
}

/// Whether `bytes` is left unchanged by netascii encoding,
/// i.e. whether it can be put on the wire as is.
pub(crate) fn is_netascii(bytes: impl IntoIterator<Item = u8> + Clone) -> bool {
    let mut netascii = ::netascii::Netascii::from_bytes(bytes.clone());
    let mut bytes = bytes.into_iter();
    while let [Some(netascii), Some(bytes)] = [netascii.next(), bytes.next()] {
        if netascii != bytes {
            return false;
        }
    }

    netascii.next().is_none() && bytes.next().is_none()
}

/// The reasons a datagram cannot be decoded.
#[derive(Debug, Error)]
#[derive(Clone)]
#[derive(PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeError {
    #[error(transparent)]
    UnknownOpcode(#[from] UnknownOpcode),
    /// A fixed field or string terminator is missing.
    #[error("truncated packet")]
    Truncated,
    #[error("data payload of {0} bytes exceeds the 512 byte block size")]
    Oversized(usize),
    #[error(transparent)]
    UnknownMode(#[from] UnknownMode),
    #[error(transparent)]
    UnknownErrorCode(#[from] UnknownErrorCode),
}

#[derive(Debug)]
#[derive(Clone, Copy)]
#[derive(PartialEq, Eq)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl Opcode {
    pub const fn to_be_bytes(self) -> [u8; OPCODE_SIZE] {
        (self as u16).to_be_bytes()
    }
}

impl TryFrom<u16> for Opcode {
    type Error = UnknownOpcode;

    fn try_from(code: u16) -> Result<Self, UnknownOpcode> {
        [
            Opcode::Rrq,
            Opcode::Wrq,
            Opcode::Data,
            Opcode::Ack,
            Opcode::Error,
        ]
        .into_iter()
        .find(|opcode| code == *opcode as u16)
        .ok_or(UnknownOpcode(code))
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            | Opcode::Rrq => "RRQ",
            | Opcode::Wrq => "WRQ",
            | Opcode::Data => "DATA",
            | Opcode::Ack => "ACK",
            | Opcode::Error => "ERROR",
        })
    }
}

#[derive(Debug, Error)]
#[derive(Clone, Copy)]
#[derive(PartialEq, Eq)]
#[error("unknown opcode ({0})")]
pub struct UnknownOpcode(pub u16);

#[derive(Debug)]
#[derive(Clone, Copy)]
#[derive(PartialEq, Eq)]
pub enum ErrorCode {
    Undefined = 0,
    NotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileExists = 6,
    NoSuchUser = 7,
}

impl TryFrom<u16> for ErrorCode {
    type Error = UnknownErrorCode;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        [
            ErrorCode::Undefined,
            ErrorCode::NotFound,
            ErrorCode::AccessViolation,
            ErrorCode::DiskFull,
            ErrorCode::IllegalOperation,
            ErrorCode::UnknownTransferId,
            ErrorCode::FileExists,
            ErrorCode::NoSuchUser,
        ]
        .into_iter()
        .find(|error_code| code == *error_code as u16)
        .ok_or(UnknownErrorCode(code))
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let description = match self {
            | ErrorCode::Undefined => "not defined",
            | ErrorCode::NotFound => "file not found",
            | ErrorCode::AccessViolation => "access violation",
            | ErrorCode::DiskFull => "disk full or allocation exceeded",
            | ErrorCode::IllegalOperation => "illegal TFTP operation",
            | ErrorCode::UnknownTransferId => "unknown transfer ID",
            | ErrorCode::FileExists => "file already exists",
            | ErrorCode::NoSuchUser => "no such user",
        };
        write!(f, "{description} ({})", *self as u16)
    }
}

#[derive(Debug, Error)]
#[derive(Clone, Copy)]
#[derive(PartialEq, Eq)]
#[error("unknown error code ({0})")]
pub struct UnknownErrorCode(pub u16);

/// How file contents are represented on the wire.
#[derive(Debug)]
#[derive(Clone, Copy)]
#[derive(PartialEq, Eq)]
pub enum TransferMode {
    /// Raw bytes.
    Octet,
    /// Text with CR/LF line endings, see [`text`].
    NetAscii,
    /// Obsolete. Decoded, but never requested by the client.
    Mail,
}

impl TransferMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            | TransferMode::Octet => "octet",
            | TransferMode::NetAscii => "netascii",
            | TransferMode::Mail => "mail",
        }
    }

    pub const fn as_cstr(self) -> &'static CStr {
        match self {
            | TransferMode::Octet => c"octet",
            | TransferMode::NetAscii => c"netascii",
            | TransferMode::Mail => c"mail",
        }
    }
}

impl Display for TransferMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&CStr> for TransferMode {
    type Error = UnknownMode;

    fn try_from(cstr: &CStr) -> Result<Self, Self::Error> {
        let bytes = cstr.to_bytes();
        [TransferMode::Octet, TransferMode::NetAscii, TransferMode::Mail]
            .into_iter()
            .find(|mode| bytes == mode.as_cstr().to_bytes())
            .ok_or_else(|| UnknownMode(cstr.to_string_lossy().into_owned()))
    }
}

#[derive(Debug, Error)]
#[derive(Clone)]
#[derive(PartialEq, Eq)]
#[error("unknown mode ({0})")]
pub struct UnknownMode(pub String);

mod parser {
    use core::ffi::CStr;

    use nom::bytes::complete::{tag, take_till};
    use nom::combinator::{map_res, recognize, rest};
    use nom::number::complete::be_u16;
    use nom::sequence::{pair, terminated};
    use nom::IResult;

    pub fn opcode(i: &[u8]) -> IResult<&[u8], u16> {
        be_u16(i)
    }

    pub fn request(i: &[u8]) -> IResult<&[u8], (&CStr, &CStr)> {
        pair(cstr, cstr)(i)
    }

    pub fn data(i: &[u8]) -> IResult<&[u8], (u16, &[u8])> {
        pair(be_u16, rest)(i)
    }

    pub fn ack(i: &[u8]) -> IResult<&[u8], u16> {
        be_u16(i)
    }

    pub fn error(i: &[u8]) -> IResult<&[u8], (u16, &CStr)> {
        pair(be_u16, cstr)(i)
    }

    // a run of non-nul bytes and its nul terminator
    fn cstr(i: &[u8]) -> IResult<&[u8], &CStr> {
        map_res(
            recognize(terminated(take_till(|byte: u8| byte == 0), tag(b"\0".as_slice()))),
            CStr::from_bytes_with_nul,
        )(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(packet: Packet) -> ([u8; PACKET_SIZE], usize) {
        let mut tx = [0u8; PACKET_SIZE];
        let len = packet.encode(&mut tx);
        (tx, len)
    }

    #[test]
    fn test_rrq_wire_form() {
        let request = RequestPacket {
            filename: c"bar.txt",
            mode: TransferMode::NetAscii,
        };
        let (tx, len) = encoded(Packet::Rrq(request));

        assert_eq!(&tx[..len], b"\x00\x01bar.txt\x00netascii\x00");
        assert_eq!(len, request.encoded_len());
        assert_eq!(Packet::decode(&tx[..len]), Ok(Packet::Rrq(request)));
    }

    #[test]
    fn test_wrq_round_trip() {
        let request = RequestPacket {
            filename: c"xyz.zip",
            mode: TransferMode::Octet,
        };
        let (tx, len) = encoded(Packet::Wrq(request));

        assert_eq!(&tx[..2], [0, 2]);
        assert_eq!(Packet::decode(&tx[..len]), Ok(Packet::Wrq(request)));
    }

    #[test]
    fn test_mail_mode_is_decoded() {
        let packet = Packet::decode(b"\x00\x02inbox\x00mail\x00").unwrap();
        assert!(matches!(
            packet,
            Packet::Wrq(RequestPacket {
                mode: TransferMode::Mail,
                ..
            })
        ));
    }

    #[test]
    fn test_mode_is_case_sensitive() {
        assert!(matches!(
            Packet::decode(b"\x00\x01a\x00OCTET\x00"),
            Err(DecodeError::UnknownMode(_))
        ));
    }

    #[test]
    fn test_data_round_trip() {
        let text = b"The licenses for most software and other practical works are designed\n\
                     to take away your freedom to share and change the works.";
        let data = DataPacket {
            block: 12345,
            payload: text,
        };
        let (tx, len) = encoded(Packet::Data(data));

        assert_eq!(&tx[..4], [0, 3, 0x30, 0x39]);
        assert_eq!(len, HEADER_SIZE + text.len());
        assert_eq!(Packet::decode(&tx[..len]), Ok(Packet::Data(data)));
    }

    #[test]
    fn test_data_block_boundaries() {
        let full = [0xAAu8; BLOCK_SIZE];
        for payload in [&full[..0], &full[..1], &full[..BLOCK_SIZE - 1], &full[..]] {
            for block in [0, 1, u16::MAX] {
                let data = DataPacket { block, payload };
                let (tx, len) = encoded(Packet::Data(data));
                assert_eq!(Packet::decode(&tx[..len]), Ok(Packet::Data(data)));
            }
        }
    }

    #[test]
    fn test_final_block_detection() {
        let full = [0u8; BLOCK_SIZE];
        assert!(!DataPacket { block: 1, payload: &full }.is_final());
        assert!(DataPacket { block: 1, payload: &full[..BLOCK_SIZE - 1] }.is_final());
        assert!(DataPacket { block: 1, payload: &[] }.is_final());
    }

    #[test]
    fn test_oversized_data() {
        let mut rx = vec![0, 3, 0, 1];
        rx.extend_from_slice(&[b'x'; BLOCK_SIZE + 1]);
        assert_eq!(
            Packet::decode(&rx),
            Err(DecodeError::Oversized(BLOCK_SIZE + 1))
        );
    }

    #[test]
    fn test_ack_round_trip() {
        let (tx, len) = encoded(Packet::Ack(AckPacket { block: 4585 }));
        assert_eq!(len, 4);
        assert_eq!(
            Packet::decode(&tx[..len]),
            Ok(Packet::Ack(AckPacket { block: 4585 }))
        );
    }

    #[test]
    fn test_ack_ignores_trailing_bytes() {
        assert_eq!(
            Packet::decode(&[0, 4, 0, 7, 0xFF, 0xFF]),
            Ok(Packet::Ack(AckPacket { block: 7 }))
        );
    }

    #[test]
    fn test_error_round_trip() {
        let error = ErrorPacket {
            code: ErrorCode::DiskFull,
            message: c"Disk full.",
        };
        let (tx, len) = encoded(Packet::Error(error));

        assert_eq!(&tx[..len], b"\x00\x05\x00\x03Disk full.\x00");
        assert_eq!(Packet::decode(&tx[..len]), Ok(Packet::Error(error)));
    }

    #[test]
    fn test_unknown_opcode() {
        assert_eq!(
            Packet::decode(&[0, 6, 0, 0]),
            Err(DecodeError::UnknownOpcode(UnknownOpcode(6)))
        );
        assert!(matches!(
            Packet::decode(&[0, 0]),
            Err(DecodeError::UnknownOpcode(_))
        ));
    }

    #[test]
    fn test_truncated_packets() {
        for rx in [
            &b""[..],
            &b"\x00"[..],
            &b"\x00\x01file"[..],
            &b"\x00\x01file\x00octet"[..],
            &b"\x00\x03\x00"[..],
            &b"\x00\x04\x00"[..],
            &b"\x00\x05\x00\x01"[..],
            &b"\x00\x05\x00\x01no terminator"[..],
        ] {
            assert_eq!(Packet::decode(rx), Err(DecodeError::Truncated), "{rx:?}");
        }
    }

    #[test]
    fn test_unknown_error_code() {
        assert_eq!(
            Packet::decode(b"\x00\x05\x00\x08oops\x00"),
            Err(DecodeError::UnknownErrorCode(UnknownErrorCode(8)))
        );
    }

    #[test]
    fn test_opcode_from_packet() {
        assert_eq!(Packet::Ack(AckPacket { block: 0 }).opcode(), Opcode::Ack);
        assert_eq!(
            Packet::Data(DataPacket { block: 0, payload: &[] }).opcode(),
            Opcode::Data
        );
    }

    #[test]
    #[should_panic(expected = "cannot fit `request` into TX buffer")]
    fn test_oversized_request_panics() {
        let filename = [b'a'; PACKET_SIZE];
        let mut filename = filename.to_vec();
        filename.push(0);
        let filename = CStr::from_bytes_with_nul(&filename).unwrap();

        let mut tx = [0u8; PACKET_SIZE];
        encode_request(
            Opcode::Rrq,
            &RequestPacket {
                filename,
                mode: TransferMode::Octet,
            },
            &mut tx,
        );
    }

    #[test]
    fn test_plain_text_is_netascii() {
        assert!(is_netascii(b"foo_bar.txt".iter().copied()));
        assert!(is_netascii(b"octet".iter().copied()));
    }
}
