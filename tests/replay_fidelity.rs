//! Bytes consumed while classifying are replayed unchanged, however the
//! peer splits its writes.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use proptest::prelude::*;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use svc_mux::mux::matcher::HTTP2_PREFACE;
use svc_mux::mux::{sniff, Classification, RuleSet};
use svc_mux::Protocol;

/// Reader that hands out `data` in the given chunk sizes, cycling through
/// them, to mimic arbitrary TCP segmentation.
struct ChunkedReader {
    data: Vec<u8>,
    pos: usize,
    chunks: Vec<usize>,
    next: usize,
}

impl ChunkedReader {
    fn new(data: Vec<u8>, chunks: Vec<usize>) -> Self {
        Self {
            data,
            pos: 0,
            chunks,
            next: 0,
        }
    }
}

impl AsyncRead for ChunkedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let chunk = this.chunks[this.next % this.chunks.len()];
        this.next += 1;
        let end = (this.pos + chunk).min(this.data.len());
        let n = (end - this.pos).min(buf.remaining());
        buf.put_slice(&this.data[this.pos..this.pos + n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

fn payload() -> impl Strategy<Value = (Vec<u8>, Option<Protocol>)> {
    let body = proptest::collection::vec(any::<u8>(), 0..2048);
    prop_oneof![
        body.clone().prop_map(|tail| {
            let mut data = HTTP2_PREFACE.to_vec();
            data.extend(tail);
            (data, Some(Protocol::Rpc))
        }),
        body.clone().prop_map(|tail| {
            let mut data = b"POST /api/v1/echo HTTP/1.1\r\nHost: localhost\r\n\r\n".to_vec();
            data.extend(tail);
            (data, Some(Protocol::Http))
        }),
        body.prop_map(|tail| {
            let mut data = vec![0x16, 0x03, 0x01];
            data.extend(tail);
            (data, None)
        }),
    ]
}

proptest! {
    #[test]
    fn sniffed_bytes_are_replayed(
        (data, expected) in payload(),
        chunks in proptest::collection::vec(1usize..64, 1..8),
        lookahead in 64usize..512,
    ) {
        let rules = RuleSet::preface_default();
        let (classification, replayed) = runtime().block_on(async {
            let reader = ChunkedReader::new(data.clone(), chunks);
            let (classification, mut stream) = sniff(reader, &rules, lookahead).await.unwrap();
            let mut out = Vec::new();
            stream.read_to_end(&mut out).await.unwrap();
            (classification, out)
        });

        match expected {
            Some(protocol) => prop_assert_eq!(classification, Classification::Matched(protocol)),
            None => prop_assert_eq!(classification, Classification::Unmatched),
        }
        prop_assert_eq!(replayed, data);
    }
}
