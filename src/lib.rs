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

//! # Multistream-select protocol negotiation
//!
//! This crate implements the `multistream-select` wire protocol
//! (`/multistream/1.0.0`): two peers holding the ends of a bidirectional
//! byte stream agree on which sub-protocol will be spoken over it. Once a
//! protocol is settled, the negotiation steps aside and every subsequent
//! byte belongs to the selected protocol.
//!
//! ## Roles
//!
//! The two sides of a negotiation are the *dialer* (initiator) and the
//! *listener* (responder). The listener owns a registry of protocol
//! handlers ([`Muxer`]) and writes its version header as soon as a stream
//! arrives. The dialer reads that header, presents its own, and then
//! proposes protocols -- either a single one ([`select_proto_or_fail`]) or
//! an ordered list of candidates ([`select_one_of`]), where the first one
//! the listener accepts wins. A dialer may also probe the listener's
//! registry with the `ls` request before committing.
//!
//! ## Deferred negotiation
//!
//! [`LazyStream`] wraps a stream together with a pre-chosen protocol and
//! runs the dialer-side negotiation on the first read or write, so callers
//! can treat the handshake as opportunistic while it is still guaranteed to
//! complete before any application byte crosses the wire.
//!
//! ## Example
//!
//! ```no_run
//! use futures::executor::block_on;
//! use futures::io::Cursor;
//! use libp2prs_multistream::select_proto_or_fail;
//!
//! let socket = Cursor::new(Vec::new());
//! let _io = block_on(select_proto_or_fail("/echo/1.0.0", socket)).unwrap();
//! // The returned stream now speaks /echo/1.0.0.
//! ```

pub mod blocking;
mod lazy;
mod muxer;
mod negotiator;
mod protocol;
mod traits;

pub use crate::lazy::LazyStream;
pub use crate::muxer::{AsyncHandlerFn, FuncHandler, IProtocolHandler, Muxer, ProtocolHandler, SyncHandlerFn};
pub use crate::negotiator::{select_one_of, select_proto_or_fail, with_cancel, NegotiationError};
pub use crate::protocol::{
    read_next_token, Message, MessageIO, Protocol, ProtocolError, MAX_TOKEN_PAYLOAD, PROTOCOL_ID,
};
pub use crate::traits::{ReadEx, WriteEx};
