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

//! The suspending byte source/sink abstraction the negotiation runs over.
//!
//! Every operation of the crate is written once, against [`ReadEx`] and
//! [`WriteEx`], and works with any duplex stream that implements them. The
//! blanket impls below cover everything that already speaks
//! `futures::io::AsyncRead`/`AsyncWrite` (TCP sockets, in-memory duplexes,
//! cursors), while stream types of our own can implement the traits directly.

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use std::io;
use std::io::ErrorKind;

/// Read half of a duplex byte stream.
#[async_trait]
pub trait ReadEx {
    /// Reads some bytes into `buf`, suspending until at least one byte is
    /// available.
    ///
    /// Returns the number of bytes read. `Ok(0)` on a non-empty `buf` means
    /// the remote closed its writing side.
    async fn read2<'a>(&'a mut self, buf: &'a mut [u8]) -> io::Result<usize>;

    /// Fills `buf` completely, looping over short reads.
    ///
    /// End of stream before `buf` is full yields `UnexpectedEof`. Each
    /// iteration awaits the underlying read, so the loop yields to the
    /// scheduler instead of spinning on a slow source.
    async fn read_exact2<'a>(&'a mut self, buf: &'a mut [u8]) -> io::Result<()> {
        let mut buf_piece = buf;
        while !buf_piece.is_empty() {
            let n = self.read2(buf_piece).await?;
            if n == 0 {
                return Err(ErrorKind::UnexpectedEof.into());
            }

            let (_, rest) = buf_piece.split_at_mut(n);
            buf_piece = rest;
        }
        Ok(())
    }
}

/// Write half of a duplex byte stream.
#[async_trait]
pub trait WriteEx {
    /// Writes the whole of `buf` to the stream.
    async fn write2(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Flushes buffered data towards the remote.
    async fn flush2(&mut self) -> io::Result<()>;

    /// Closes the writing side of the stream.
    async fn close2(&mut self) -> io::Result<()>;
}

#[async_trait]
impl<T: AsyncRead + Unpin + Send> ReadEx for T {
    async fn read2<'a>(&'a mut self, buf: &'a mut [u8]) -> io::Result<usize> {
        let n = AsyncReadExt::read(self, buf).await?;
        Ok(n)
    }
}

#[async_trait]
impl<T: AsyncWrite + Unpin + Send> WriteEx for T {
    async fn write2(&mut self, buf: &[u8]) -> io::Result<()> {
        AsyncWriteExt::write_all(self, buf).await
    }

    async fn flush2(&mut self) -> io::Result<()> {
        AsyncWriteExt::flush(self).await
    }

    async fn close2(&mut self) -> io::Result<()> {
        AsyncWriteExt::close(self).await
    }
}
