//! Stream wrappers over a child's stdio pipes
//!
//! Readable ends (stdout, stderr, extra pipes) report to the lifecycle
//! tracker once they are finished: on end-of-stream or when dropped,
//! whichever comes first. Stdin does not count toward the aggregate close.

use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// One-shot "this stream is closed" signal for the lifecycle tracker
pub(crate) struct CloseNotice {
    tx: Option<mpsc::UnboundedSender<()>>,
}

impl CloseNotice {
    pub(crate) fn new(tx: mpsc::UnboundedSender<()>) -> Self {
        Self { tx: Some(tx) }
    }

    pub(crate) fn fire(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for CloseNotice {
    fn drop(&mut self) {
        self.fire();
    }
}

fn poll_read_tracked<R>(
    reader: Pin<&mut R>,
    notice: &mut CloseNotice,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
) -> Poll<io::Result<()>>
where
    R: AsyncRead + ?Sized,
{
    let had_room = buf.remaining() > 0;
    let before = buf.filled().len();
    let poll = reader.poll_read(cx, buf);
    if let Poll::Ready(Ok(())) = poll {
        if had_room && buf.filled().len() == before {
            notice.fire();
        }
    }
    poll
}

/// Readable end of a child's stdout, stderr or extra pipe
pub struct ChildReadable {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    notice: CloseNotice,
}

impl ChildReadable {
    pub(crate) fn new<R>(reader: R, notice: CloseNotice) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            inner: Box::new(reader),
            notice,
        }
    }
}

impl AsyncRead for ChildReadable {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        poll_read_tracked(Pin::new(&mut this.inner), &mut this.notice, cx, buf)
    }
}

impl fmt::Debug for ChildReadable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildReadable").finish_non_exhaustive()
    }
}

type SharedWriter = Arc<Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>>;

/// Writable end of a child's stdin
///
/// `kill` closes it even after it was handed out; writes then fail with
/// `BrokenPipe`.
pub struct ChildWritable {
    inner: SharedWriter,
}

impl ChildWritable {
    pub(crate) fn new<W>(writer: W) -> (Self, StdinCloser)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let inner: SharedWriter = Arc::new(Mutex::new(Some(Box::new(writer))));
        let closer = StdinCloser {
            inner: Arc::downgrade(&inner),
        };
        (Self { inner }, closer)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stdin was closed")
}

impl AsyncWrite for ChildWritable {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.inner.lock().as_mut() {
            Some(writer) => Pin::new(writer).poll_write(cx, buf),
            None => Poll::Ready(Err(closed_pipe())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.inner.lock().as_mut() {
            Some(writer) => Pin::new(writer).poll_flush(cx),
            None => Poll::Ready(Err(closed_pipe())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut guard = self.inner.lock();
        let result = match guard.as_mut() {
            Some(writer) => Pin::new(writer).poll_shutdown(cx),
            None => return Poll::Ready(Ok(())),
        };
        if let Poll::Ready(Ok(())) = result {
            *guard = None;
        }
        result
    }
}

impl fmt::Debug for ChildWritable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildWritable")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Closes stdin from the owning `ChildProcess`, wherever the writer went
#[derive(Debug, Clone)]
pub(crate) struct StdinCloser {
    inner: Weak<Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>>,
}

impl StdinCloser {
    pub(crate) fn close(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().take();
        }
    }
}

/// Duplex extra pipe (slot 3 and up) backed by a socket pair
#[cfg(unix)]
pub struct ChildPipe {
    inner: tokio::net::UnixStream,
    notice: CloseNotice,
}

#[cfg(unix)]
impl ChildPipe {
    pub(crate) fn new(inner: tokio::net::UnixStream, notice: CloseNotice) -> Self {
        Self { inner, notice }
    }
}

#[cfg(unix)]
impl AsyncRead for ChildPipe {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        poll_read_tracked(Pin::new(&mut this.inner), &mut this.notice, cx, buf)
    }
}

#[cfg(unix)]
impl AsyncWrite for ChildPipe {
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

#[cfg(unix)]
impl fmt::Debug for ChildPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildPipe").finish_non_exhaustive()
    }
}

/// Stream occupying one stdio slot
#[derive(Debug)]
pub enum StdioStream {
    Writable(ChildWritable),
    Readable(ChildReadable),
    #[cfg(unix)]
    Pipe(ChildPipe),
}

impl StdioStream {
    pub fn into_readable(self) -> Option<ChildReadable> {
        match self {
            StdioStream::Readable(readable) => Some(readable),
            _ => None,
        }
    }

    pub fn into_writable(self) -> Option<ChildWritable> {
        match self {
            StdioStream::Writable(writable) => Some(writable),
            _ => None,
        }
    }

    #[cfg(unix)]
    pub fn into_pipe(self) -> Option<ChildPipe> {
        match self {
            StdioStream::Pipe(pipe) => Some(pipe),
            _ => None,
        }
    }

    /// Read to end-of-stream and discard, so the tracker hears the close
    pub(crate) async fn drain(self) {
        let result = match self {
            StdioStream::Writable(_) => return,
            StdioStream::Readable(mut readable) => {
                tokio::io::copy(&mut readable, &mut tokio::io::sink()).await
            }
            #[cfg(unix)]
            StdioStream::Pipe(mut pipe) => tokio::io::copy(&mut pipe, &mut tokio::io::sink()).await,
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "Stdio drain ended with error");
        }
    }
}
