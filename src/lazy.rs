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

//! A stream proxy that defers the dialer-side negotiation until the first
//! read or write.
//!
//! A caller may wrap a freshly connected transport and immediately start
//! issuing application I/O; the wrapper guarantees the negotiation for the
//! pre-chosen protocol completes before any application byte crosses the
//! wire. Once negotiated, every operation is a pass-through to the
//! underlying stream.

use std::convert::TryFrom;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::lock::Mutex;
use log::debug;

use crate::negotiator;
use crate::protocol::{Protocol, ProtocolError};
use crate::traits::{ReadEx, WriteEx};

enum State<TSocket> {
    /// Nothing has been sent yet.
    NotYet { proto: Protocol, socket: TSocket },
    /// Placeholder while a handshake is in flight; observed only if the
    /// operation driving the handshake was dropped mid-way.
    Handshaking,
    /// Negotiation succeeded; the stream belongs to the selected protocol.
    Ready(TSocket),
    /// Negotiation failed; every operation reproduces the stored error.
    Failed { kind: io::ErrorKind, message: String },
}

/// A duplex stream wrapping `TSocket` that negotiates a pre-chosen protocol
/// on first use.
///
/// Clones share state: when several operations race on the first I/O,
/// exactly one performs the handshake while the rest wait on the shared lock
/// and then find the stream `Ready` (or `Failed`). Operations on one wrapper
/// serialize on that lock.
pub struct LazyStream<TSocket> {
    state: Arc<Mutex<State<TSocket>>>,
}

impl<TSocket> Clone for LazyStream<TSocket> {
    fn clone(&self) -> Self {
        LazyStream {
            state: self.state.clone(),
        }
    }
}

impl<TSocket> LazyStream<TSocket> {
    /// Wraps `socket`, arranging for `proto` to be negotiated before the
    /// first read or write goes through.
    pub fn create_select<TProto>(socket: TSocket, proto: TProto) -> Result<Self, ProtocolError>
    where
        Protocol: TryFrom<TProto, Error = ProtocolError>,
    {
        let proto = Protocol::try_from(proto)?;
        Ok(LazyStream {
            state: Arc::new(Mutex::new(State::NotYet { proto, socket })),
        })
    }
}

/// Runs the deferred handshake if it has not happened yet. On return the
/// state is `Ready` unless the handshake failed (now or previously).
async fn ensure_negotiated<TSocket>(state: &mut State<TSocket>) -> io::Result<()>
where
    TSocket: ReadEx + WriteEx + Send + Unpin,
{
    match std::mem::replace(state, State::Handshaking) {
        State::NotYet { proto, socket } => {
            debug!("lazy stream: negotiating {} before first i/o", proto);
            match negotiator::select_protocol(proto, socket).await {
                Ok(socket) => {
                    *state = State::Ready(socket);
                    Ok(())
                }
                Err(e) => {
                    let err: io::Error = e.into();
                    *state = State::Failed {
                        kind: err.kind(),
                        message: err.to_string(),
                    };
                    Err(err)
                }
            }
        }
        State::Ready(socket) => {
            *state = State::Ready(socket);
            Ok(())
        }
        State::Failed { kind, message } => {
            let err = io::Error::new(kind, message.clone());
            *state = State::Failed { kind, message };
            Err(err)
        }
        State::Handshaking => Err(io::Error::new(
            io::ErrorKind::Other,
            "negotiation was interrupted; stream unusable",
        )),
    }
}

#[async_trait]
impl<TSocket> ReadEx for LazyStream<TSocket>
where
    TSocket: ReadEx + WriteEx + Send + Unpin,
{
    async fn read2<'a>(&'a mut self, buf: &'a mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().await;
        ensure_negotiated(&mut *state).await?;
        match &mut *state {
            State::Ready(socket) => socket.read2(buf).await,
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

#[async_trait]
impl<TSocket> WriteEx for LazyStream<TSocket>
where
    TSocket: ReadEx + WriteEx + Send + Unpin,
{
    async fn write2(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().await;
        ensure_negotiated(&mut *state).await?;
        match &mut *state {
            State::Ready(socket) => socket.write2(buf).await,
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    async fn flush2(&mut self) -> io::Result<()> {
        let mut state = self.state.lock().await;
        ensure_negotiated(&mut *state).await?;
        match &mut *state {
            State::Ready(socket) => socket.flush2().await,
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Closes the underlying stream. Closing does not trigger the deferred
    /// handshake; a stream that never carried application bytes never
    /// negotiates.
    async fn close2(&mut self) -> io::Result<()> {
        let mut state = self.state.lock().await;
        match &mut *state {
            State::NotYet { socket, .. } => socket.close2().await,
            State::Ready(socket) => socket.close2().await,
            State::Handshaking | State::Failed { .. } => Ok(()),
        }
    }
}
