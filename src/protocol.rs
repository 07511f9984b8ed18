// Copyright 2020 Netwarps Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! The multistream-select wire format.
//!
//! Everything on the wire is a *token*: an unsigned varint length `L`,
//! followed by `L` bytes of payload whose final byte is a newline. The token
//! string is the UTF-8 decoding of the first `L - 1` bytes. On top of the
//! token layer sits the small [`Message`] vocabulary the negotiation speaks.

use bytes::{BufMut, Bytes, BytesMut};
use std::convert::TryFrom;
use std::{fmt, io, str};

use crate::traits::{ReadEx, WriteEx};

/// Version token both sides must present before anything else.
pub const PROTOCOL_ID: &str = "/multistream/1.0.0";

/// Terminator of every token payload.
pub(crate) const DELIMITER: u8 = b'\n';

/// Token a listener answers with when it does not support the proposed
/// protocol.
pub(crate) const NA_TOKEN: &[u8] = b"na";

/// Token requesting the listener's protocol listing.
pub(crate) const LS_TOKEN: &[u8] = b"ls";

/// Largest declared token length accepted on the wire, delimiter included.
pub const MAX_TOKEN_PAYLOAD: usize = 65536;

/// Best-effort notice sent to a peer whose token declared a length above
/// [`MAX_TOKEN_PAYLOAD`], just before the stream is given up on.
pub(crate) const TOO_LARGE_MSG: &[u8] = b"Messages over 64k are not allowed";

/// A protocol identifier exchanged during negotiation.
///
/// Identifiers are opaque UTF-8 strings. The only rejected inputs are the
/// empty string and strings containing a newline, which would break the
/// token framing.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Protocol(Bytes);

impl Protocol {
    fn validate(bytes: &[u8]) -> Result<(), ProtocolError> {
        if bytes.is_empty() || str::from_utf8(bytes).is_err() || bytes.contains(&DELIMITER) {
            return Err(ProtocolError::InvalidProtocol);
        }
        Ok(())
    }
}

impl TryFrom<Bytes> for Protocol {
    type Error = ProtocolError;

    fn try_from(value: Bytes) -> Result<Self, Self::Error> {
        Protocol::validate(&value)?;
        Ok(Protocol(value))
    }
}

impl TryFrom<&[u8]> for Protocol {
    type Error = ProtocolError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Protocol::validate(value)?;
        Ok(Protocol(Bytes::copy_from_slice(value)))
    }
}

impl TryFrom<&str> for Protocol {
    type Error = ProtocolError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Protocol::try_from(value.as_bytes())
    }
}

impl TryFrom<String> for Protocol {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Protocol::validate(value.as_bytes())?;
        Ok(Protocol(Bytes::from(value.into_bytes())))
    }
}

impl AsRef<[u8]> for Protocol {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq<&str> for Protocol {
    fn eq(&self, other: &&str) -> bool {
        self.0.as_ref() == other.as_bytes()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// A multistream-select negotiation message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    /// The version header, [`PROTOCOL_ID`].
    Header,
    /// A protocol proposed by the dialer, or echoed by the listener as
    /// acceptance.
    Protocol(Protocol),
    /// The `ls` request for the listener's protocol listing.
    ListProtocols,
    /// The listener's reply to `ls`. Encoded with a bare length envelope
    /// around the listing so a reader can skip it without parsing tokens.
    Protocols(Vec<Protocol>),
    /// The `na` rejection.
    NotAvailable,
}

impl Message {
    /// Interprets a received token.
    pub fn decode(token: Bytes) -> Result<Message, ProtocolError> {
        if token.as_ref() == PROTOCOL_ID.as_bytes() {
            return Ok(Message::Header);
        }
        if token.as_ref() == LS_TOKEN {
            return Ok(Message::ListProtocols);
        }
        if token.as_ref() == NA_TOKEN {
            return Ok(Message::NotAvailable);
        }
        Protocol::try_from(token).map(Message::Protocol)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Header => f.write_str(PROTOCOL_ID),
            Message::Protocol(p) => write!(f, "{}", p),
            Message::ListProtocols => f.write_str("ls"),
            Message::NotAvailable => f.write_str("na"),
            Message::Protocols(ps) => {
                let names: Vec<String> = ps.iter().map(|p| p.to_string()).collect();
                write!(f, "[{}]", names.join(", "))
            }
        }
    }
}

/// Writes one token: `varint(len + 1)`, the payload, then the delimiter.
///
/// The whole frame is assembled in memory and handed to the stream as a
/// single write followed by a flush, so the length prefix and payload never
/// straddle two writes.
pub(crate) async fn send_token<T>(io: &mut T, payload: &[u8]) -> Result<(), ProtocolError>
where
    T: WriteEx + Send + Unpin,
{
    let len = payload.len() + 1;
    if len > MAX_TOKEN_PAYLOAD {
        return Err(ProtocolError::TooLarge);
    }
    let mut uvi_buf = unsigned_varint::encode::u32_buffer();
    let uvi_len = unsigned_varint::encode::u32(len as u32, &mut uvi_buf);
    let mut frame = BytesMut::with_capacity(uvi_len.len() + len);
    frame.put_slice(uvi_len);
    frame.put_slice(payload);
    frame.put_u8(DELIMITER);
    io.write2(&frame).await?;
    io.flush2().await?;
    Ok(())
}

/// Reads the length prefix of the next token, one byte at a time.
///
/// `Ok(None)` when the stream ends before the first byte, i.e. the peer went
/// away between tokens. An end of stream inside the varint is
/// [`ProtocolError::TransportClosed`].
async fn read_length_prefix<T>(io: &mut T) -> Result<Option<usize>, ProtocolError>
where
    T: ReadEx + Send + Unpin,
{
    let mut b = unsigned_varint::encode::u32_buffer();
    for i in 0..b.len() {
        let mut byte = [0u8; 1];
        let n = io.read2(&mut byte).await?;
        if n == 0 {
            if i == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::TransportClosed);
        }
        b[i] = byte[0];
        if unsigned_varint::decode::is_last(byte[0]) {
            let (len, _) = unsigned_varint::decode::u32(&b[..=i])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            return Ok(Some(len as usize));
        }
    }
    Err(ProtocolError::IoError(io::Error::new(
        io::ErrorKind::InvalidData,
        unsigned_varint::decode::Error::Overflow,
    )))
}

/// Reads one token payload, delimiter stripped.
///
/// `Ok(None)` when the peer closed the stream at a token boundary. Oversized
/// declarations are answered with a [`TOO_LARGE_MSG`] token before the read
/// fails.
pub(crate) async fn recv_token<T>(io: &mut T) -> Result<Option<Bytes>, ProtocolError>
where
    T: ReadEx + WriteEx + Send + Unpin,
{
    let len = match read_length_prefix(io).await? {
        Some(len) => len,
        None => return Ok(None),
    };
    if len == 0 {
        return Ok(Some(Bytes::new()));
    }
    if len > MAX_TOKEN_PAYLOAD {
        let _ = send_token(io, TOO_LARGE_MSG).await;
        return Err(ProtocolError::TooLarge);
    }
    let mut buf = vec![0u8; len];
    io.read_exact2(&mut buf).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ProtocolError::TransportClosed
        } else {
            ProtocolError::IoError(e)
        }
    })?;
    if buf[len - 1] != DELIMITER {
        return Err(ProtocolError::MissingDelimiter);
    }
    buf.truncate(len - 1);
    if str::from_utf8(&buf).is_err() {
        return Err(ProtocolError::BadEncoding);
    }
    Ok(Some(Bytes::from(buf)))
}

/// Writes the `ls` reply: an outer `varint(inner.len())` envelope around
/// `varint(N)` followed by one full token per protocol.
pub(crate) async fn send_listing<T>(io: &mut T, protos: &[Protocol]) -> Result<(), ProtocolError>
where
    T: WriteEx + Send + Unpin,
{
    let mut inner = BytesMut::new();
    let mut count_buf = unsigned_varint::encode::u32_buffer();
    inner.put_slice(unsigned_varint::encode::u32(protos.len() as u32, &mut count_buf));
    for p in protos {
        let mut len_buf = unsigned_varint::encode::u32_buffer();
        inner.put_slice(unsigned_varint::encode::u32((p.as_ref().len() + 1) as u32, &mut len_buf));
        inner.put_slice(p.as_ref());
        inner.put_u8(DELIMITER);
    }

    let mut outer_buf = unsigned_varint::encode::u32_buffer();
    let outer_len = unsigned_varint::encode::u32(inner.len() as u32, &mut outer_buf);
    let mut frame = BytesMut::with_capacity(outer_len.len() + inner.len());
    frame.put_slice(outer_len);
    frame.put_slice(&inner);
    io.write2(&frame).await?;
    io.flush2().await?;
    Ok(())
}

/// Reads the next token from the stream as a string.
///
/// `Ok(None)` when the peer closed the stream at a token boundary. Exposed
/// for callers driving the wire format directly, and for tests.
pub async fn read_next_token<T>(io: &mut T) -> Result<Option<String>, ProtocolError>
where
    T: ReadEx + WriteEx + Send + Unpin,
{
    match recv_token(io).await? {
        Some(token) => {
            let s = String::from_utf8(token.to_vec()).map_err(|_| ProtocolError::BadEncoding)?;
            Ok(Some(s))
        }
        None => Ok(None),
    }
}

/// Message-level I/O over a token stream.
///
/// Owns the socket for the duration of the negotiation; [`into_inner`]
/// releases it once a protocol has been settled on.
///
/// [`into_inner`]: MessageIO::into_inner
pub struct MessageIO<R> {
    inner: R,
}

impl<R> MessageIO<R>
where
    R: ReadEx + WriteEx + Send + Unpin,
{
    pub fn new(inner: R) -> Self {
        MessageIO { inner }
    }

    pub async fn send_message(&mut self, msg: Message) -> Result<(), ProtocolError> {
        match msg {
            Message::Header => send_token(&mut self.inner, PROTOCOL_ID.as_bytes()).await,
            Message::Protocol(p) => send_token(&mut self.inner, p.as_ref()).await,
            Message::ListProtocols => send_token(&mut self.inner, LS_TOKEN).await,
            Message::NotAvailable => send_token(&mut self.inner, NA_TOKEN).await,
            Message::Protocols(protos) => send_listing(&mut self.inner, &protos).await,
        }
    }

    /// Receives the next message. `Ok(None)` when the peer closed the stream
    /// at a token boundary.
    ///
    /// The `ls` reply is not token-framed and is never produced here; peers
    /// that requested a listing consume it straight off the byte stream.
    pub async fn recv_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        match recv_token(&mut self.inner).await? {
            Some(token) => Message::decode(token).map(Some),
            None => Ok(None),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Failure modes of the token layer.
#[derive(Debug)]
pub enum ProtocolError {
    /// An underlying I/O error.
    IoError(io::Error),
    /// The declared token length exceeds [`MAX_TOKEN_PAYLOAD`].
    TooLarge,
    /// The final payload byte is not the newline delimiter.
    MissingDelimiter,
    /// The token payload is not valid UTF-8.
    BadEncoding,
    /// The stream ended in the middle of a frame.
    TransportClosed,
    /// An invalid protocol identifier (empty, or containing a newline).
    InvalidProtocol,
    /// A message that does not belong at this point of the exchange.
    InvalidMessage,
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> ProtocolError {
        ProtocolError::IoError(err)
    }
}

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> io::Error {
        match err {
            ProtocolError::IoError(e) => e,
            ProtocolError::TransportClosed => io::ErrorKind::UnexpectedEof.into(),
            e => io::Error::new(io::ErrorKind::InvalidData, e.to_string()),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let ProtocolError::IoError(e) = self {
            Some(e)
        } else {
            None
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::IoError(e) => write!(f, "i/o error: {}", e),
            ProtocolError::TooLarge => f.write_str("token length exceeds the 64k limit"),
            ProtocolError::MissingDelimiter => f.write_str("token is not newline-terminated"),
            ProtocolError::BadEncoding => f.write_str("token is not valid utf-8"),
            ProtocolError::TransportClosed => f.write_str("stream closed in the middle of a frame"),
            ProtocolError::InvalidProtocol => f.write_str("invalid protocol identifier"),
            ProtocolError::InvalidMessage => f.write_str("unexpected negotiation message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::io::Cursor;

    #[test]
    fn token_frame_layout() {
        let mut out = Vec::new();
        block_on(send_token(&mut out, b"/foo")).unwrap();
        assert_eq!(out, vec![5, b'/', b'f', b'o', b'o', b'\n']);
        assert_eq!(out.iter().filter(|b| **b == DELIMITER).count(), 1);
        assert_eq!(*out.last().unwrap(), DELIMITER);
    }

    #[test]
    fn token_round_trip() {
        let mut out = Vec::new();
        let payload = "x".repeat(300);
        block_on(send_token(&mut out, payload.as_bytes())).unwrap();
        // 301 needs a two-byte varint.
        assert_eq!(&out[..2], &[0xAD, 0x02]);

        let mut cur = Cursor::new(out);
        let token = block_on(recv_token(&mut cur)).unwrap().unwrap();
        assert_eq!(token.as_ref(), payload.as_bytes());
    }

    #[test]
    fn zero_length_consumes_nothing_past_varint() {
        let mut cur = Cursor::new(vec![0x00, 0xFF]);
        let token = block_on(recv_token(&mut cur)).unwrap().unwrap();
        assert!(token.is_empty());
        assert_eq!(cur.position(), 1);
    }

    #[test]
    fn delimiter_only_token_is_empty() {
        let mut cur = Cursor::new(vec![0x01, b'\n']);
        let token = block_on(recv_token(&mut cur)).unwrap().unwrap();
        assert!(token.is_empty());
    }

    #[test]
    fn missing_delimiter_is_rejected() {
        let mut cur = Cursor::new(vec![0x02, b'h', b'X']);
        let err = block_on(recv_token(&mut cur)).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingDelimiter));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut cur = Cursor::new(vec![0x03, 0xFF, 0xFE, b'\n']);
        let err = block_on(recv_token(&mut cur)).unwrap_err();
        assert!(matches!(err, ProtocolError::BadEncoding));
    }

    #[test]
    fn eof_at_token_boundary() {
        let mut cur = Cursor::new(Vec::new());
        let token = block_on(recv_token(&mut cur)).unwrap();
        assert!(token.is_none());
    }

    #[test]
    fn eof_inside_payload() {
        let mut cur = Cursor::new(vec![0x05, b'a', b'b']);
        let err = block_on(recv_token(&mut cur)).unwrap_err();
        assert!(matches!(err, ProtocolError::TransportClosed));
    }

    #[test]
    fn eof_inside_varint() {
        let mut cur = Cursor::new(vec![0x80]);
        let err = block_on(recv_token(&mut cur)).unwrap_err();
        assert!(matches!(err, ProtocolError::TransportClosed));
    }

    #[test]
    fn protocol_validation() {
        assert!(Protocol::try_from("/echo/1.0.0").is_ok());
        assert!(Protocol::try_from("a").is_ok());
        assert!(Protocol::try_from("").is_err());
        assert!(Protocol::try_from("bad\nid").is_err());
        assert!(Protocol::try_from(&b"\xFF\xFE"[..]).is_err());
    }

    #[test]
    fn message_decoding() {
        let decode = |s: &str| Message::decode(Bytes::copy_from_slice(s.as_bytes())).unwrap();
        assert_eq!(decode(PROTOCOL_ID), Message::Header);
        assert_eq!(decode("ls"), Message::ListProtocols);
        assert_eq!(decode("na"), Message::NotAvailable);
        assert!(matches!(decode("/foo"), Message::Protocol(ref p) if *p == "/foo"));
        assert!(Message::decode(Bytes::new()).is_err());
    }
}
