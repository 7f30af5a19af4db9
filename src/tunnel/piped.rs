//! In-memory sockets handed to the originator

use super::session::TunnelSession;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

/// Byte stream of an established tunnel
///
/// One end of an in-memory pipe whose other end is wired to the session's
/// channels. Dropping it (or shutting it down) closes the session.
#[derive(Debug)]
pub struct TunnelStream {
    inner: DuplexStream,
    session: Arc<TunnelSession>,
}

impl TunnelStream {
    pub(crate) fn new(inner: DuplexStream, session: Arc<TunnelSession>) -> Self {
        TunnelStream { inner, session }
    }

    /// Address the remote side reported for this tunnel, if any
    pub fn remote_addr(&self) -> Option<(String, u16)> {
        self.session.remote()
    }

    pub fn session(&self) -> &Arc<TunnelSession> {
        &self.session
    }

    /// Close the tunnel without waiting for the pipe to drain
    pub async fn close(&self) {
        self.session.close().await
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
