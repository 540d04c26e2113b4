//! Replay of sniffed bytes.
//!
//! # Responsibilities
//! - Read a bounded lookahead from a fresh connection for classification
//! - Hand the connection on with the lookahead replayed in front of it
//!
//! # Design Decisions
//! - The protocol handler observes the exact original byte stream
//! - A read may span the replay boundary (prefix tail + fresh socket bytes)
//! - Writes pass straight through; sniffing never writes

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::mux::matcher::{Classification, RuleSet};

/// Initial capacity of the sniff buffer; grows up to the lookahead budget.
const INITIAL_SNIFF_CAPACITY: usize = 512;

/// A stream that yields `prefix` before reading from `inner`.
#[derive(Debug)]
pub struct ReplayStream<S> {
    prefix: Bytes,
    inner: S,
    deferred_error: Option<io::Error>,
}

impl<S> ReplayStream<S> {
    pub fn new(inner: S, prefix: Bytes) -> Self {
        Self {
            prefix,
            inner,
            deferred_error: None,
        }
    }

    /// Bytes captured during sniffing that have not been read yet.
    pub fn buffered(&self) -> &[u8] {
        &self.prefix
    }

    /// Split into the inner stream and the unread prefix.
    pub fn into_parts(self) -> (S, Bytes) {
        (self.inner, self.prefix)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(err) = this.deferred_error.take() {
            return Poll::Ready(Err(err));
        }

        if this.prefix.is_empty() {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        let n = this.prefix.len().min(buf.remaining());
        buf.put_slice(&this.prefix[..n]);
        this.prefix.advance(n);

        if this.prefix.is_empty() && buf.remaining() > 0 {
            // Top up from the socket without waiting; prefix bytes are
            // already in `buf`, so a pending inner read is not an error.
            match Pin::new(&mut this.inner).poll_read(cx, buf) {
                Poll::Ready(Ok(())) | Poll::Pending => {}
                Poll::Ready(Err(err)) => this.deferred_error = Some(err),
            }
        }

        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Read from `stream` until `rules` decide, the lookahead budget is spent or
/// the peer stops sending. Every byte read is kept in the returned stream.
pub async fn sniff<S>(
    mut stream: S,
    rules: &RuleSet,
    lookahead: usize,
) -> io::Result<(Classification, ReplayStream<S>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(INITIAL_SNIFF_CAPACITY.min(lookahead));
    let mut eof = false;

    loop {
        let exhausted = eof || buf.len() >= lookahead;
        let classification = rules.classify(&buf, exhausted);
        if classification != Classification::Undecided {
            return Ok((classification, ReplayStream::new(stream, buf.freeze())));
        }

        let budget = (lookahead - buf.len()) as u64;
        let n = (&mut stream).take(budget).read_buf(&mut buf).await?;
        if n == 0 {
            eof = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::matcher::{Http1Matcher, PrefixMatcher, HTTP2_PREFACE};
    use crate::mux::Protocol;
    use std::io::Cursor;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn replays_prefix_then_inner() {
        let mut stream = ReplayStream::new(Cursor::new(b"world".to_vec()), Bytes::from_static(b"hello "));
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn small_reads_drain_prefix_in_order() {
        let mut stream = ReplayStream::new(Cursor::new(b"def".to_vec()), Bytes::from_static(b"abc"));
        let mut byte = [0u8; 2];
        let mut out = Vec::new();
        loop {
            let n = stream.read(&mut byte).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&byte[..n]);
        }
        assert_eq!(out, b"abcdef");
    }

    #[tokio::test]
    async fn first_read_spans_the_boundary() {
        let mut stream = ReplayStream::new(Cursor::new(b"XYZ".to_vec()), Bytes::from_static(b"ab"));
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abXYZ");
    }

    #[tokio::test]
    async fn writes_pass_through() {
        let mut stream = ReplayStream::new(Cursor::new(Vec::new()), Bytes::from_static(b"ignored"));
        stream.write_all(b"pong").await.unwrap();
        let (inner, prefix) = stream.into_parts();
        assert_eq!(inner.into_inner(), b"pong");
        assert_eq!(&prefix[..], b"ignored");
    }

    #[tokio::test]
    async fn sniff_keeps_every_byte() {
        let rules = RuleSet::preface_default();
        let payload = b"GET /api/v1/echo HTTP/1.1\r\nHost: x\r\n\r\n".to_vec();
        let (class, mut stream) = sniff(Cursor::new(payload.clone()), &rules, 4096).await.unwrap();
        assert_eq!(class, Classification::Matched(Protocol::Http));

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn sniff_stops_at_lookahead_budget() {
        let rules = RuleSet::new().rule(PrefixMatcher::new(vec![b'a'; 64]), Protocol::Rpc);
        let payload = vec![b'a'; 40];
        let (class, stream) = sniff(Cursor::new(payload.clone()), &rules, 16).await.unwrap();
        assert_eq!(class, Classification::Unmatched);
        assert_eq!(stream.buffered().len(), 16);
    }

    #[tokio::test]
    async fn sniff_decides_on_eof() {
        let rules = RuleSet::new()
            .rule(PrefixMatcher::http2_preface(), Protocol::Rpc)
            .rule(Http1Matcher, Protocol::Http);
        let (class, stream) = sniff(Cursor::new(HTTP2_PREFACE[..10].to_vec()), &rules, 4096)
            .await
            .unwrap();
        assert_eq!(class, Classification::Unmatched);
        assert_eq!(stream.buffered(), &HTTP2_PREFACE[..10]);
    }
}
