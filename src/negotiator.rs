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

//! Dialer-side negotiation.
//!
//! The dialer drives the exchange: it waits for the listener's version
//! header, presents its own, then proposes protocols one at a time until the
//! listener echoes one back. Request/response pairs are strictly interleaved;
//! a second candidate is never sent before the response to the first has
//! been read.

use std::convert::TryFrom;
use std::future::Future;
use std::{fmt, io};

use futures::channel::oneshot;
use futures::FutureExt;
use log::debug;

use crate::protocol::{Message, MessageIO, Protocol, ProtocolError};
use crate::traits::{ReadEx, WriteEx};

/// Reads the listener's version header, then presents our own.
///
/// The listener writes first, so a freshly connected dialer learns the
/// listener's version before committing to a reply.
pub(crate) async fn handshake_as_initiator<R>(io: &mut MessageIO<R>) -> Result<(), NegotiationError>
where
    R: ReadEx + WriteEx + Send + Unpin,
{
    match io.recv_message().await? {
        Some(Message::Header) => {}
        Some(_) => return Err(NegotiationError::VersionMismatch),
        None => return Err(ProtocolError::TransportClosed.into()),
    }
    io.send_message(Message::Header).await?;
    Ok(())
}

/// Proposes a single protocol and interprets the listener's verdict.
///
/// `Ok(true)` on acceptance, `Ok(false)` on `na` or when the listener hung
/// up instead of answering.
pub(crate) async fn try_select<R>(io: &mut MessageIO<R>, proto: &Protocol) -> Result<bool, NegotiationError>
where
    R: ReadEx + WriteEx + Send + Unpin,
{
    io.send_message(Message::Protocol(proto.clone())).await?;
    debug!("Dialer: proposed protocol: {}", proto);

    match io.recv_message().await? {
        Some(Message::Protocol(ref p)) if p == proto => {
            debug!("Dialer: received confirmation for protocol: {}", p);
            Ok(true)
        }
        Some(Message::NotAvailable) => {
            debug!("Dialer: received rejection of protocol: {}", proto);
            Ok(false)
        }
        None => Ok(false),
        Some(msg) => Err(NegotiationError::UnexpectedToken(msg.to_string())),
    }
}

pub(crate) async fn select_protocol<TSocket>(proto: Protocol, socket: TSocket) -> Result<TSocket, NegotiationError>
where
    TSocket: ReadEx + WriteEx + Send + Unpin,
{
    let mut io = MessageIO::new(socket);
    handshake_as_initiator(&mut io).await?;
    if try_select(&mut io, &proto).await? {
        Ok(io.into_inner())
    } else {
        Err(NegotiationError::NotSupported(vec![proto.to_string()]))
    }
}

/// Negotiates exactly `proto` on the stream, failing if the listener does
/// not support it. Returns the stream, ready for the selected protocol.
pub async fn select_proto_or_fail<TSocket, TProto>(proto: TProto, socket: TSocket) -> Result<TSocket, NegotiationError>
where
    TSocket: ReadEx + WriteEx + Send + Unpin,
    Protocol: TryFrom<TProto, Error = ProtocolError>,
{
    let proto = Protocol::try_from(proto)?;
    select_protocol(proto, socket).await
}

/// Proposes the candidates in order and settles on the first one the
/// listener accepts.
///
/// The order is significant: an earlier candidate the listener supports
/// always wins over a later one. When every candidate is rejected the error
/// carries the attempted set.
pub async fn select_one_of<TSocket, TProto, I>(protos: I, socket: TSocket) -> Result<(Protocol, TSocket), NegotiationError>
where
    TSocket: ReadEx + WriteEx + Send + Unpin,
    I: IntoIterator<Item = TProto>,
    Protocol: TryFrom<TProto, Error = ProtocolError>,
{
    let candidates = protos
        .into_iter()
        .map(Protocol::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    let mut io = MessageIO::new(socket);
    handshake_as_initiator(&mut io).await?;

    for proto in &candidates {
        if try_select(&mut io, proto).await? {
            return Ok((proto.clone(), io.into_inner()));
        }
    }
    Err(NegotiationError::NotSupported(
        candidates.iter().map(|p| p.to_string()).collect(),
    ))
}

/// Races a negotiation operation against a cancellation signal.
///
/// The signal is observed at whichever await point `op` is suspended on and
/// resolves the call to [`NegotiationError::Cancelled`]; `op` is dropped and
/// the stream it was driving must not be reused for negotiation. Dropping
/// the sender counts as delivering the signal.
pub async fn with_cancel<T, F>(op: F, cancel: oneshot::Receiver<()>) -> Result<T, NegotiationError>
where
    F: Future<Output = Result<T, NegotiationError>>,
{
    let op = op.fuse();
    let mut cancel = cancel.fuse();
    futures::pin_mut!(op);
    futures::select! {
        res = op => res,
        _ = cancel => Err(NegotiationError::Cancelled),
    }
}

/// The ways a negotiation can fail.
#[derive(Debug)]
pub enum NegotiationError {
    /// The token layer failed.
    ProtocolError(ProtocolError),

    /// The first token received was not the expected version header. The
    /// stream is unusable for negotiation.
    VersionMismatch,

    /// No protocol could be agreed upon; carries the attempted set.
    NotSupported(Vec<String>),

    /// The listener answered a proposal with something that is neither the
    /// echoed protocol nor `na`.
    UnexpectedToken(String),

    /// The cancellation signal fired mid-operation.
    Cancelled,
}

impl From<ProtocolError> for NegotiationError {
    fn from(err: ProtocolError) -> NegotiationError {
        NegotiationError::ProtocolError(err)
    }
}

impl From<io::Error> for NegotiationError {
    fn from(err: io::Error) -> NegotiationError {
        ProtocolError::from(err).into()
    }
}

impl From<NegotiationError> for io::Error {
    fn from(err: NegotiationError) -> io::Error {
        if let NegotiationError::ProtocolError(e) = err {
            return e.into();
        }
        io::Error::new(io::ErrorKind::Other, err.to_string())
    }
}

impl std::error::Error for NegotiationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NegotiationError::ProtocolError(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationError::ProtocolError(p) => write!(f, "protocol error: {}", p),
            NegotiationError::VersionMismatch => f.write_str("unsupported multistream version received"),
            NegotiationError::NotSupported(ps) => write!(f, "protocol not supported: {:?}", ps),
            NegotiationError::UnexpectedToken(t) => write!(f, "unexpected token: {}", t),
            NegotiationError::Cancelled => f.write_str("negotiation cancelled"),
        }
    }
}
