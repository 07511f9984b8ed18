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

//! Synchronous façade over the negotiation.
//!
//! Each function blocks the calling thread on the corresponding async
//! operation, so both surfaces are wire-identical by construction. Callers
//! that live on an async runtime should use the async surface directly.

use futures::executor::block_on;
use std::convert::TryFrom;

use crate::muxer::{IProtocolHandler, Muxer};
use crate::negotiator::NegotiationError;
use crate::protocol::{Protocol, ProtocolError};
use crate::traits::{ReadEx, WriteEx};

/// Blocking form of [`Muxer::negotiate`].
pub fn negotiate<TSocket>(
    muxer: &Muxer<TSocket>,
    socket: TSocket,
) -> Result<Option<(Protocol, IProtocolHandler<TSocket>, TSocket)>, NegotiationError>
where
    TSocket: ReadEx + WriteEx + Send + Unpin,
{
    block_on(muxer.negotiate(socket))
}

/// Blocking form of [`Muxer::handle`].
pub fn handle<TSocket>(muxer: &Muxer<TSocket>, socket: TSocket) -> Result<bool, NegotiationError>
where
    TSocket: ReadEx + WriteEx + Send + Unpin,
{
    block_on(muxer.handle(socket))
}

/// Blocking form of [`Muxer::ls`].
pub fn ls<TSocket>(muxer: &Muxer<TSocket>, socket: &mut TSocket) -> Result<(), NegotiationError>
where
    TSocket: ReadEx + WriteEx + Send + Unpin,
{
    block_on(muxer.ls(socket))
}

/// Blocking form of [`crate::select_proto_or_fail`].
pub fn select_proto_or_fail<TSocket, TProto>(proto: TProto, socket: TSocket) -> Result<TSocket, NegotiationError>
where
    TSocket: ReadEx + WriteEx + Send + Unpin,
    Protocol: TryFrom<TProto, Error = ProtocolError>,
{
    block_on(crate::negotiator::select_proto_or_fail(proto, socket))
}

/// Blocking form of [`crate::select_one_of`].
pub fn select_one_of<TSocket, TProto, I>(protos: I, socket: TSocket) -> Result<(Protocol, TSocket), NegotiationError>
where
    TSocket: ReadEx + WriteEx + Send + Unpin,
    I: IntoIterator<Item = TProto>,
    Protocol: TryFrom<TProto, Error = ProtocolError>,
{
    block_on(crate::negotiator::select_one_of(protos, socket))
}

/// Blocking form of [`crate::read_next_token`].
pub fn read_next_token<TSocket>(socket: &mut TSocket) -> Result<Option<String>, ProtocolError>
where
    TSocket: ReadEx + WriteEx + Send + Unpin,
{
    block_on(crate::protocol::read_next_token(socket))
}
