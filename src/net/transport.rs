//! Byte transports under a connection
//!
//! All operations are non-blocking: `WouldBlock` means "arm the reactor and
//! try again once ready".

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};

pub trait Transport: Send {
    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send up to `len` bytes of `file` starting at `offset`.
    fn try_sendfile(&mut self, file: &File, offset: u64, len: usize) -> io::Result<usize> {
        let mut chunk = [0u8; 16 * 1024];
        let want = len.min(chunk.len());
        let mut reader = file;
        reader.seek(SeekFrom::Start(offset))?;
        let read = reader.read(&mut chunk[..want])?;
        if read == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "file shorter than expected"));
        }
        self.try_send(&chunk[..read])
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()>;

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn local_addr(&self) -> Option<SocketAddr>;

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

/// A non-blocking TCP stream.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

impl Transport for TcpTransport {
    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    #[cfg(target_os = "linux")]
    fn try_sendfile(&mut self, file: &File, offset: u64, len: usize) -> io::Result<usize> {
        let mut off = offset as libc::off_t;
        let n = unsafe { libc::sendfile(self.stream.as_raw_fd(), file.as_raw_fd(), &mut off, len) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n == 0 && len > 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "file shorter than expected"));
        }
        Ok(n as usize)
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        self.stream.shutdown(how)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr().ok()
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.stream.as_raw_fd())
    }
}

#[derive(Debug, Default)]
struct Pipe {
    inbound: VecDeque<u8>,
    inbound_closed: bool,
    outbound: Vec<u8>,
    write_shut: bool,
    send_limit: Option<usize>,
    inflate: usize,
    fail_next: Option<io::ErrorKind>,
}

/// In-memory transport for driving connections without sockets.
#[derive(Debug)]
pub struct MemoryTransport {
    pipe: Arc<Mutex<Pipe>>,
}

/// The test side of a [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct MemoryHandle {
    pipe: Arc<Mutex<Pipe>>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryHandle) {
        let pipe = Arc::new(Mutex::new(Pipe::default()));
        (
            MemoryTransport {
                pipe: Arc::clone(&pipe),
            },
            MemoryHandle { pipe },
        )
    }
}

impl MemoryHandle {
    /// Make `data` available to the connection's next receive.
    pub fn push_inbound(&self, data: &[u8]) {
        self.pipe.lock().inbound.extend(data);
    }

    /// Make the connection's next empty receive report end of stream.
    pub fn close_inbound(&self) {
        self.pipe.lock().inbound_closed = true;
    }

    /// Everything the connection sent so far.
    pub fn take_outbound(&self) -> Vec<u8> {
        std::mem::take(&mut self.pipe.lock().outbound)
    }

    /// Accept at most `limit` bytes per send; `Some(0)` blocks sends.
    pub fn set_send_limit(&self, limit: Option<usize>) {
        self.pipe.lock().send_limit = limit;
    }

    /// Over-report every send completion by `extra` bytes.
    pub fn inflate_completions(&self, extra: usize) {
        self.pipe.lock().inflate = extra;
    }

    /// Fail the next operation with `kind`.
    pub fn fail_next(&self, kind: io::ErrorKind) {
        self.pipe.lock().fail_next = Some(kind);
    }

    pub fn is_write_shut(&self) -> bool {
        self.pipe.lock().write_shut
    }
}

impl Transport for MemoryTransport {
    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut pipe = self.pipe.lock();
        if let Some(kind) = pipe.fail_next.take() {
            return Err(kind.into());
        }
        if pipe.write_shut {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = pipe.send_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        pipe.outbound.extend_from_slice(&buf[..n]);
        Ok(n + pipe.inflate)
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pipe = self.pipe.lock();
        if let Some(kind) = pipe.fail_next.take() {
            return Err(kind.into());
        }
        if pipe.inbound.is_empty() {
            return if pipe.inbound_closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(pipe.inbound.len());
        for (dst, src) in buf.iter_mut().zip(pipe.inbound.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        if matches!(how, Shutdown::Write | Shutdown::Both) {
            self.pipe.lock().write_shut = true;
        }
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}
