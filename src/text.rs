//! Netascii line-ending transcoding, used when a transfer runs in
//! [`TransferMode::NetAscii`](crate::TransferMode::NetAscii).
//!
//! On the wire a line ends in CR LF and a bare CR is sent as CR NUL.
//! Both functions work on whatever bytes are in hand and keep no state
//! between calls, so a CR LF or CR NUL pair split across two DATA packets
//! is not rejoined by [`to_host`].
//!
//! [`to_host`] after [`to_network`] reproduces its input exactly. The
//! other order does not: [`to_host`] collapses CR LF to LF, so a CR that
//! preceded an LF in the input is lost.

use netascii::{Bytes, Netascii};

const CR: u8 = b'\r';

/// Converts received netascii to local text: CR NUL becomes CR and
/// CR LF becomes LF. A CR followed by anything else, or by nothing,
/// is kept as is.
pub fn to_host(buf: &[u8]) -> Vec<u8> {
    Bytes::from_netascii(buf.iter().copied())
        .map(|byte| byte.unwrap_or(CR))
        .collect()
}

/// Converts local text to netascii: CR becomes CR NUL and LF becomes CR LF.
pub fn to_network(buf: &[u8]) -> Vec<u8> {
    Netascii::from_bytes(buf.iter().copied()).collect()
}
