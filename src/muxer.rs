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

//! Listener-side negotiation and the protocol handler registry.

use std::convert::TryFrom;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use log::debug;
use parking_lot::RwLock;

use crate::negotiator::NegotiationError;
use crate::protocol::{Message, MessageIO, Protocol, ProtocolError};
use crate::traits::{ReadEx, WriteEx};

/// A protocol handler, invoked once its protocol has been negotiated on a
/// stream.
///
/// The returned boolean is handler-defined success and is surfaced to the
/// caller of [`Muxer::handle`] unchanged.
#[async_trait]
pub trait ProtocolHandler<TSocket>: Send + Sync {
    async fn handle(&self, proto: &Protocol, socket: &mut TSocket) -> bool;
}

/// Shared, dispatchable handler.
pub type IProtocolHandler<TSocket> = Arc<dyn ProtocolHandler<TSocket> + Send + Sync>;

#[async_trait]
impl<TSocket, F> ProtocolHandler<TSocket> for F
where
    TSocket: Send + 'static,
    F: for<'a> Fn(&'a Protocol, &'a mut TSocket) -> BoxFuture<'a, bool> + Send + Sync,
{
    async fn handle(&self, proto: &Protocol, socket: &mut TSocket) -> bool {
        self(proto, socket).await
    }
}

/// Synchronous callback form of a handler.
pub type SyncHandlerFn<TSocket> = Box<dyn Fn(&Protocol, &mut TSocket) -> bool + Send + Sync>;

/// Asynchronous callback form of a handler.
pub type AsyncHandlerFn<TSocket> =
    Box<dyn for<'a> Fn(&'a Protocol, &'a mut TSocket) -> BoxFuture<'a, bool> + Send + Sync>;

/// Handler assembled from plain callbacks.
///
/// Dispatch prefers the asynchronous callback and falls back to the
/// synchronous one; with neither present the handler reports failure.
pub struct FuncHandler<TSocket> {
    sync_fn: Option<SyncHandlerFn<TSocket>>,
    async_fn: Option<AsyncHandlerFn<TSocket>>,
}

impl<TSocket> FuncHandler<TSocket> {
    pub fn new(sync_fn: Option<SyncHandlerFn<TSocket>>, async_fn: Option<AsyncHandlerFn<TSocket>>) -> Self {
        FuncHandler { sync_fn, async_fn }
    }
}

#[async_trait]
impl<TSocket: Send + 'static> ProtocolHandler<TSocket> for FuncHandler<TSocket> {
    async fn handle(&self, proto: &Protocol, socket: &mut TSocket) -> bool {
        if let Some(f) = &self.async_fn {
            return f(proto, socket).await;
        }
        if let Some(f) = &self.sync_fn {
            return f(proto, socket);
        }
        false
    }
}

struct HandlerEntry<TSocket: 'static> {
    proto: Protocol,
    handler: IProtocolHandler<TSocket>,
}

/// The listener side of multistream-select: a registry of protocol handlers
/// and the negotiation that matches an incoming stream against it.
///
/// `Muxer` is a cheap clone; clones share the registry. The registry lock is
/// never held across handler invocations or stream I/O, so a handler is free
/// to register or remove handlers itself -- such changes apply to future
/// negotiations only.
pub struct Muxer<TSocket: 'static> {
    handlers: Arc<RwLock<Vec<HandlerEntry<TSocket>>>>,
}

impl<TSocket> Clone for Muxer<TSocket> {
    fn clone(&self) -> Self {
        Muxer {
            handlers: self.handlers.clone(),
        }
    }
}

impl<TSocket> Default for Muxer<TSocket> {
    fn default() -> Self {
        Self::new()
    }
}

impl<TSocket> Muxer<TSocket> {
    pub fn new() -> Self {
        Muxer {
            handlers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Registers `handler` for `proto`, replacing any handler previously
    /// registered under the same identifier.
    pub fn add_handler<TProto>(&self, proto: TProto, handler: IProtocolHandler<TSocket>) -> Result<(), ProtocolError>
    where
        Protocol: TryFrom<TProto, Error = ProtocolError>,
    {
        let proto = Protocol::try_from(proto)?;
        let mut handlers = self.handlers.write();
        handlers.retain(|e| e.proto != proto);
        handlers.push(HandlerEntry { proto, handler });
        Ok(())
    }

    /// Registers a [`FuncHandler`] built from the given callbacks.
    pub fn add_handler_func<TProto>(
        &self,
        proto: TProto,
        sync_fn: Option<SyncHandlerFn<TSocket>>,
        async_fn: Option<AsyncHandlerFn<TSocket>>,
    ) -> Result<(), ProtocolError>
    where
        Protocol: TryFrom<TProto, Error = ProtocolError>,
        TSocket: Send,
    {
        self.add_handler(proto, Arc::new(FuncHandler::new(sync_fn, async_fn)))
    }

    /// Removes the handler registered for `proto`, if any.
    pub fn remove_handler<TProto>(&self, proto: TProto)
    where
        Protocol: TryFrom<TProto, Error = ProtocolError>,
    {
        if let Ok(proto) = Protocol::try_from(proto) {
            self.handlers.write().retain(|e| e.proto != proto);
        }
    }

    /// Snapshot of the registered protocol identifiers, in registration
    /// order.
    pub fn protocols(&self) -> Vec<String> {
        self.handlers.read().iter().map(|e| e.proto.to_string()).collect()
    }

    fn snapshot(&self) -> Vec<Protocol> {
        self.handlers.read().iter().map(|e| e.proto.clone()).collect()
    }

    fn find_handler(&self, proto: &Protocol) -> Option<IProtocolHandler<TSocket>> {
        self.handlers
            .read()
            .iter()
            .find(|e| &e.proto == proto)
            .map(|e| e.handler.clone())
    }
}

impl<TSocket> Muxer<TSocket>
where
    TSocket: ReadEx + WriteEx + Send + Unpin,
{
    /// Negotiates one protocol on `socket`.
    ///
    /// Writes our version header before reading anything, then serves `ls`
    /// requests and rejects unknown proposals until the peer either selects
    /// a registered protocol or goes away. At most one protocol is accepted
    /// per stream.
    ///
    /// `Ok(None)` when the peer disconnected at a token boundary without
    /// selecting anything; that is a normal end of the exchange, not an
    /// error.
    pub async fn negotiate(
        &self,
        socket: TSocket,
    ) -> Result<Option<(Protocol, IProtocolHandler<TSocket>, TSocket)>, NegotiationError> {
        let mut io = MessageIO::new(socket);
        io.send_message(Message::Header).await?;

        match io.recv_message().await? {
            Some(Message::Header) => {}
            Some(_) => {
                let mut socket = io.into_inner();
                let _ = socket.close2().await;
                return Err(NegotiationError::VersionMismatch);
            }
            None => return Ok(None),
        }

        loop {
            match io.recv_message().await? {
                Some(Message::ListProtocols) => {
                    let supported = self.snapshot();
                    debug!("Listener: listing {} protocol(s)", supported.len());
                    io.send_message(Message::Protocols(supported)).await?;
                }
                Some(Message::Protocol(p)) => {
                    if let Some(handler) = self.find_handler(&p) {
                        debug!("Listener: confirming protocol: {}", p);
                        io.send_message(Message::Protocol(p.clone())).await?;
                        return Ok(Some((p, handler, io.into_inner())));
                    }
                    debug!("Listener: rejecting protocol: {}", p);
                    io.send_message(Message::NotAvailable).await?;
                }
                Some(_) => return Err(ProtocolError::InvalidMessage.into()),
                None => return Ok(None),
            }
        }
    }

    /// Negotiates on `socket` and dispatches to the selected handler.
    ///
    /// `false` when the peer disconnected without selecting a protocol;
    /// otherwise the handler's own verdict.
    pub async fn handle(&self, socket: TSocket) -> Result<bool, NegotiationError> {
        match self.negotiate(socket).await? {
            Some((proto, handler, mut socket)) => Ok(handler.handle(&proto, &mut socket).await),
            None => Ok(false),
        }
    }

    /// Writes the protocol listing to `socket`, outside of a negotiation.
    pub async fn ls(&self, socket: &mut TSocket) -> Result<(), NegotiationError> {
        let supported = self.snapshot();
        crate::protocol::send_listing(socket, &supported).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::io::Cursor;

    type TestSocket = Cursor<Vec<u8>>;

    struct Fixed(bool);

    #[async_trait]
    impl ProtocolHandler<TestSocket> for Fixed {
        async fn handle(&self, _proto: &Protocol, _socket: &mut TestSocket) -> bool {
            self.0
        }
    }

    #[test]
    fn registration_order_is_preserved() {
        let muxer = Muxer::<TestSocket>::new();
        for p in &["a", "b", "c"] {
            muxer.add_handler(*p, Arc::new(Fixed(true))).unwrap();
        }
        assert_eq!(muxer.protocols(), vec!["a", "b", "c"]);
    }

    #[test]
    fn replacement_keeps_a_single_entry() {
        let muxer = Muxer::<TestSocket>::new();
        muxer.add_handler("/foo", Arc::new(Fixed(false))).unwrap();
        muxer.add_handler("/foo", Arc::new(Fixed(true))).unwrap();

        assert_eq!(muxer.protocols(), vec!["/foo"]);
        let proto = Protocol::try_from("/foo").unwrap();
        let handler = muxer.find_handler(&proto).unwrap();
        let mut socket = Cursor::new(Vec::new());
        assert!(block_on(handler.handle(&proto, &mut socket)));
    }

    #[test]
    fn remove_handler_is_a_silent_noop_when_absent() {
        let muxer = Muxer::<TestSocket>::new();
        muxer.add_handler("a", Arc::new(Fixed(true))).unwrap();
        muxer.remove_handler("zz");
        assert_eq!(muxer.protocols(), vec!["a"]);
        muxer.remove_handler("a");
        assert!(muxer.protocols().is_empty());
    }

    #[test]
    fn invalid_protocol_id_is_rejected() {
        let muxer = Muxer::<TestSocket>::new();
        assert!(muxer.add_handler("bad\nid", Arc::new(Fixed(true))).is_err());
        assert!(muxer.add_handler("", Arc::new(Fixed(true))).is_err());
    }

    #[test]
    fn func_handler_without_callbacks_reports_failure() {
        let handler = FuncHandler::<TestSocket>::new(None, None);
        let proto = Protocol::try_from("/foo").unwrap();
        let mut socket = Cursor::new(Vec::new());
        assert!(!block_on(handler.handle(&proto, &mut socket)));
    }

    #[test]
    fn func_handler_falls_back_to_sync_callback() {
        let handler = FuncHandler::<TestSocket>::new(Some(Box::new(|_, _| true)), None);
        let proto = Protocol::try_from("/foo").unwrap();
        let mut socket = Cursor::new(Vec::new());
        assert!(block_on(handler.handle(&proto, &mut socket)));
    }
}
