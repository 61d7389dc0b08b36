//! One server-side connection point of the capture channel.
//!
//! ```text
//! Created ──arm──▶ Connecting ──client──▶ Ready ──arm──▶ Reading ──data──▶ Ready …
//!    │                 │                                    │
//!    └──accept error───┴──▶ ConnectError                    └──EOF/reset──▶ EndOfStream
//! ```
//!
//! The endpoint never blocks: every accept and read is attempted on a
//! non-blocking handle, and "pending" means the multiplexer should wait for the
//! handle returned by [`Endpoint::wait_fd`] to become readable. When an
//! operation completes during [`Endpoint::arm`] the result is stashed and the
//! endpoint reports itself pre-signaled, so the next poll cycle picks it up
//! without blocking.

use std::io::{self, Read};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;

use svchost_core::Level;

use crate::error::CaptureError;

pub type EndpointId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Created,
    Connecting,
    ConnectError,
    Ready,
    Reading,
    EndOfStream,
}

/// What [`Endpoint::arm`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Armed {
    /// An operation is outstanding; wait on [`Endpoint::wait_fd`].
    Waiting,
    /// The operation completed immediately; collect it next cycle.
    Signaled,
    /// A client was already waiting and is now connected (`Ready`).
    Connected,
    /// The endpoint reached end of stream and should be retired.
    Closed,
}

/// Outcome of the last operation, from [`Endpoint::collect_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Pending,
    Connected,
    /// `n` bytes landed after the buffered region; commit with [`Endpoint::advance`].
    Read(usize),
    EndOfStream,
}

#[derive(Debug)]
pub struct Endpoint {
    id: EndpointId,
    level: Level,
    state: EndpointState,
    listener: Option<Arc<UnixListener>>,
    stream: Option<UnixStream>,
    buf: Box<[u8]>,
    len: usize,
    stashed: Option<Completion>,
}

impl Endpoint {
    /// A fresh endpoint that will accept its client from `listener`.
    ///
    /// `listener` must be in non-blocking mode.
    pub fn listening(
        id: EndpointId,
        listener: Arc<UnixListener>,
        capacity: usize,
        level: Level,
    ) -> Self {
        Self {
            id,
            level,
            state: EndpointState::Created,
            listener: Some(listener),
            stream: None,
            buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
            len: 0,
            stashed: None,
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes committed to the buffer and not yet compacted away.
    pub fn buffered(&self) -> usize {
        self.len
    }

    pub fn free(&self) -> usize {
        self.buf.len() - self.len
    }

    /// The committed bytes.
    pub fn buffer(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Whether a stashed completion is waiting to be collected.
    pub fn is_signaled(&self) -> bool {
        self.stashed.is_some()
    }

    /// Whether this endpoint is the one waiting for the next client.
    pub fn is_listening(&self) -> bool {
        matches!(
            self.state,
            EndpointState::Created | EndpointState::Connecting
        )
    }

    /// Handle whose readability wakes this endpoint, if it has one right now.
    pub fn wait_fd(&self) -> Option<BorrowedFd<'_>> {
        match self.state {
            EndpointState::Connecting => self.listener.as_deref().map(AsFd::as_fd),
            EndpointState::Ready | EndpointState::Reading => {
                self.stream.as_ref().map(AsFd::as_fd)
            }
            _ => None,
        }
    }

    /// Advance the state machine one step.
    pub fn arm(&mut self) -> Result<Armed, CaptureError> {
        match self.state {
            EndpointState::Created | EndpointState::ConnectError => {
                if self.try_accept()? {
                    Ok(Armed::Connected)
                } else {
                    self.state = EndpointState::Connecting;
                    Ok(Armed::Waiting)
                }
            }
            EndpointState::Ready => {
                self.state = EndpointState::Reading;
                let completion = if self.free() == 0 {
                    Completion::Read(0)
                } else {
                    self.try_read()?
                };
                if completion == Completion::Pending {
                    Ok(Armed::Waiting)
                } else {
                    self.stashed = Some(completion);
                    Ok(Armed::Signaled)
                }
            }
            EndpointState::Connecting | EndpointState::Reading => Ok(if self.is_signaled() {
                Armed::Signaled
            } else {
                Armed::Waiting
            }),
            EndpointState::EndOfStream => Ok(Armed::Closed),
        }
    }

    /// Query the outcome of the outstanding operation.
    pub fn collect_result(&mut self) -> Result<Completion, CaptureError> {
        let completion = match self.stashed.take() {
            Some(completion) => completion,
            None => match self.state {
                EndpointState::Connecting => {
                    if self.try_accept()? {
                        Completion::Connected
                    } else {
                        Completion::Pending
                    }
                }
                EndpointState::Reading => self.try_read()?,
                EndpointState::EndOfStream => Completion::EndOfStream,
                _ => Completion::Pending,
            },
        };

        match completion {
            Completion::Read(_) => self.state = EndpointState::Ready,
            Completion::EndOfStream => self.close(),
            Completion::Connected | Completion::Pending => {}
        }
        Ok(completion)
    }

    /// Commit `n` bytes delivered by a [`Completion::Read`].
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.free(), "read past the buffer end");
        self.len += n.min(self.free());
    }

    /// Drop the leading `consumed` bytes, shifting the remainder to the front.
    pub fn compact(&mut self, consumed: usize) {
        let consumed = consumed.min(self.len);
        if consumed == self.len {
            self.len = 0;
        } else if consumed > 0 {
            self.buf.copy_within(consumed..self.len, 0);
            self.len -= consumed;
        }
    }

    fn try_accept(&mut self) -> Result<bool, CaptureError> {
        let Some(listener) = self.listener.as_ref() else {
            self.state = EndpointState::ConnectError;
            return Err(CaptureError::Accept(io::Error::new(
                io::ErrorKind::NotConnected,
                "endpoint has no listener",
            )));
        };

        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        self.state = EndpointState::ConnectError;
                        return Err(CaptureError::Accept(err));
                    }
                    self.stream = Some(stream);
                    self.listener = None;
                    self.state = EndpointState::Ready;
                    return Ok(true);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(err) => {
                    self.state = EndpointState::ConnectError;
                    return Err(CaptureError::Accept(err));
                }
            }
        }
    }

    fn try_read(&mut self) -> Result<Completion, CaptureError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Completion::EndOfStream);
        };

        loop {
            match stream.read(&mut self.buf[self.len..]) {
                Ok(0) => return Ok(Completion::EndOfStream),
                Ok(n) => return Ok(Completion::Read(n)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Completion::Pending)
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if is_end_of_stream(&err) => return Ok(Completion::EndOfStream),
                Err(source) => {
                    self.close();
                    return Err(CaptureError::Read {
                        endpoint: self.id,
                        source,
                    });
                }
            }
        }
    }

    fn close(&mut self) {
        self.state = EndpointState::EndOfStream;
        self.stream = None;
        self.listener = None;
    }
}

/// Disconnect conditions that are a normal end of stream, not a fault.
fn is_end_of_stream(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn listener(dir: &TempDir) -> (PathBuf, Arc<UnixListener>) {
        let path = dir.path().join("capture.sock");
        let listener = UnixListener::bind(&path).expect("bind");
        listener.set_nonblocking(true).expect("nonblocking");
        (path, Arc::new(listener))
    }

    #[test]
    fn connect_read_and_end_of_stream() {
        let dir = TempDir::new().unwrap();
        let (path, listener) = listener(&dir);
        let mut endpoint = Endpoint::listening(1, listener, 16, Level::Info);

        assert_eq!(endpoint.arm().unwrap(), Armed::Waiting);
        assert_eq!(endpoint.state(), EndpointState::Connecting);
        assert!(endpoint.wait_fd().is_some());
        assert_eq!(endpoint.collect_result().unwrap(), Completion::Pending);

        let mut client = UnixStream::connect(&path).expect("connect");
        assert_eq!(endpoint.collect_result().unwrap(), Completion::Connected);
        assert_eq!(endpoint.state(), EndpointState::Ready);

        assert_eq!(endpoint.arm().unwrap(), Armed::Waiting);
        assert_eq!(endpoint.state(), EndpointState::Reading);

        client.write_all(b"hi\n").unwrap();
        assert_eq!(endpoint.collect_result().unwrap(), Completion::Read(3));
        endpoint.advance(3);
        assert_eq!(endpoint.buffer(), b"hi\n");
        assert_eq!(endpoint.state(), EndpointState::Ready);

        drop(client);
        assert_eq!(endpoint.arm().unwrap(), Armed::Signaled);
        assert_eq!(endpoint.collect_result().unwrap(), Completion::EndOfStream);
        assert_eq!(endpoint.state(), EndpointState::EndOfStream);
        assert_eq!(endpoint.arm().unwrap(), Armed::Closed);
        assert!(endpoint.wait_fd().is_none());
    }

    #[test]
    fn waiting_client_connects_immediately() {
        let dir = TempDir::new().unwrap();
        let (path, listener) = listener(&dir);
        let _client = UnixStream::connect(&path).expect("connect");

        let mut endpoint = Endpoint::listening(7, listener, 16, Level::Warning);
        assert_eq!(endpoint.arm().unwrap(), Armed::Connected);
        assert_eq!(endpoint.state(), EndpointState::Ready);
        assert!(!endpoint.is_listening());
    }

    #[test]
    fn immediate_read_is_stashed_and_signaled() {
        let dir = TempDir::new().unwrap();
        let (path, listener) = listener(&dir);
        let mut client = UnixStream::connect(&path).expect("connect");
        client.write_all(b"ready\n").unwrap();

        let mut endpoint = Endpoint::listening(2, listener, 16, Level::Info);
        assert_eq!(endpoint.arm().unwrap(), Armed::Connected);
        assert_eq!(endpoint.arm().unwrap(), Armed::Signaled);
        assert!(endpoint.is_signaled());
        assert_eq!(endpoint.arm().unwrap(), Armed::Signaled, "no second read");

        assert_eq!(endpoint.collect_result().unwrap(), Completion::Read(6));
        assert!(!endpoint.is_signaled());
    }

    #[test]
    fn buffer_accounting_and_compaction() {
        let dir = TempDir::new().unwrap();
        let (path, listener) = listener(&dir);
        let mut client = UnixStream::connect(&path).expect("connect");
        let mut endpoint = Endpoint::listening(3, listener, 8, Level::Info);
        endpoint.arm().unwrap();

        client.write_all(b"abcdefghij").unwrap();
        endpoint.arm().unwrap();
        let Completion::Read(n) = endpoint.collect_result().unwrap() else {
            panic!("expected a read");
        };
        assert_eq!(n, 8, "a read never exceeds the fixed capacity");
        endpoint.advance(n);
        assert_eq!(endpoint.free() + endpoint.buffered(), endpoint.capacity());
        assert_eq!(endpoint.free(), 0);

        endpoint.compact(3);
        assert_eq!(endpoint.buffer(), b"defgh");
        assert_eq!(endpoint.free() + endpoint.buffered(), endpoint.capacity());

        endpoint.compact(5);
        assert_eq!(endpoint.buffered(), 0);
        assert_eq!(endpoint.free(), 8);
    }
}
