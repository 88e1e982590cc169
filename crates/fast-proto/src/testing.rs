//! Testing-only support: an in-memory full-duplex byte pipe.
//!
//! The multiplexer and dispatcher crates exercise whole connections in
//! their tests; this module gives them a pair of connected
//! `AsyncRead + AsyncWrite` endpoints with no runtime dependency.

use std::collections::VecDeque;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::io::{AsyncRead, AsyncWrite};
use futures::stream::StreamExt as _;

/// Create a connected pair of in-memory byte streams.
///
/// Bytes written on either endpoint become readable on the other.
/// Closing an endpoint delivers EOF to its peer's reader; writing to a
/// dropped peer fails with `BrokenPipe`.
pub fn duplex() -> (LocalStream, LocalStream) {
    let (tx_a, rx_a) = mpsc::unbounded();
    let (tx_b, rx_b) = mpsc::unbounded();
    (
        LocalStream {
            tx: tx_a,
            rx: rx_b,
            pending: VecDeque::new(),
        },
        LocalStream {
            tx: tx_b,
            rx: rx_a,
            pending: VecDeque::new(),
        },
    )
}

/// One endpoint of an in-memory duplex connection.
pub struct LocalStream {
    /// Chunks we have written, in transit to the peer.
    tx: mpsc::UnboundedSender<Vec<u8>>,
    /// Chunks the peer has written to us.
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Bytes taken off `rx` but not yet claimed by a read.
    pending: VecDeque<u8>,
}

impl AsyncRead for LocalStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        loop {
            if !self.pending.is_empty() {
                let n = std::cmp::min(buf.len(), self.pending.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = self.pending.pop_front().expect("length just checked");
                }
                return Poll::Ready(Ok(n));
            }
            match self.rx.poll_next_unpin(cx) {
                Poll::Ready(Some(chunk)) => {
                    self.pending.extend(chunk);
                    // Tolerate empty chunks: loop rather than return
                    // a misleading Ok(0).
                }
                Poll::Ready(None) => return Poll::Ready(Ok(0)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for LocalStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<IoResult<usize>> {
        match self.tx.unbounded_send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(IoError::new(ErrorKind::BrokenPipe, "peer closed"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        self.tx.close_channel();
        Poll::Ready(Ok(()))
    }
}
