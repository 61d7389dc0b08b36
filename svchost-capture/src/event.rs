//! Manual-reset events that can be waited on together with I/O handles.
//!
//! An [`Event`] is a connected socket pair: setting it writes one byte,
//! resetting it drains the read side, and "signaled" means the read side is
//! readable. That makes it a plain file descriptor for `poll(2)`, so one wait
//! call can cover events and sockets alike.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

#[derive(Debug)]
pub struct Event {
    reader: UnixStream,
    writer: UnixStream,
}

impl Event {
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self { reader, writer })
    }

    /// Signal the event. Setting an already-signaled event is a no-op.
    pub fn set(&self) -> io::Result<()> {
        match (&self.writer).write(&[1]) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Return the event to the non-signaled state.
    pub fn reset(&self) -> io::Result<()> {
        let mut scratch = [0u8; 64];
        loop {
            match (&self.reader).read(&mut scratch) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    pub fn is_set(&self) -> io::Result<bool> {
        self.wait(Some(Duration::ZERO))
    }

    /// Block until signaled or until `timeout` elapses (`None` waits forever).
    /// Returns whether the event is signaled. The event stays signaled.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        Ok(Self::wait_any(&[self], timeout)?.is_some())
    }

    /// Block until any of `events` is signaled; returns the lowest signaled
    /// index, or `None` on timeout.
    pub fn wait_any(events: &[&Event], timeout: Option<Duration>) -> io::Result<Option<usize>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let mut fds: Vec<PollFd<'_>> = events
                .iter()
                .map(|event| PollFd::new(event.as_fd(), PollFlags::POLLIN))
                .collect();

            match poll(&mut fds, poll_timeout(remaining)) {
                Ok(0) => {}
                Ok(_) => {
                    let signaled = fds.iter().position(|fd| {
                        fd.revents()
                            .is_some_and(|revents| revents.intersects(PollFlags::POLLIN))
                    });
                    if signaled.is_some() {
                        return Ok(signaled);
                    }
                }
                Err(Errno::EINTR) => {}
                Err(errno) => return Err(io::Error::from(errno)),
            }

            if remaining.is_some_and(|r| r.is_zero()) {
                return Ok(None);
            }
        }
    }

    /// A duplicate of the write side, for registering as a signal self-pipe.
    pub fn writer(&self) -> io::Result<UnixStream> {
        self.writer.try_clone()
    }
}

impl AsFd for Event {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}

/// Sets the wrapped event when dropped, so a thread signals its exit on every
/// return path, unwinding included.
#[derive(Debug)]
pub struct SetOnDrop(Arc<Event>);

impl SetOnDrop {
    pub fn new(event: Arc<Event>) -> Self {
        Self(event)
    }
}

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        if let Err(err) = self.0.set() {
            tracing::error!(error = %err, "failed to signal thread exit");
        }
    }
}

/// Convert an optional remaining duration into a `poll` timeout, rounding up
/// so a sub-millisecond remainder does not spin at zero.
pub(crate) fn poll_timeout(remaining: Option<Duration>) -> PollTimeout {
    match remaining {
        None => PollTimeout::NONE,
        Some(remaining) => {
            let mut millis = remaining.as_millis();
            if Duration::from_millis(millis as u64) < remaining {
                millis += 1;
            }
            PollTimeout::from(millis.min(u128::from(u16::MAX)) as u16)
        }
    }
}
