//! The capture channel: a Unix socket bound at a per-run path, plus the
//! client side that takes over the process's standard streams.

use std::fs;
use std::io::{self, ErrorKind, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::unistd::dup2;

use crate::error::{io_err, CaptureError};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Unique channel file name for this run of `service`.
///
/// The suffix mixes the process id with the wall-clock tick so a restarted
/// service never collides with a predecessor still tearing down.
pub fn channel_name(service: &str) -> String {
    let tick = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let pid = u64::from(std::process::id());
    format!("{service}_service_stdlog.{}", pid.wrapping_mul(tick))
}

/// Server side of the channel. Dropping it removes the socket file.
#[derive(Debug)]
pub struct CaptureChannel {
    path: PathBuf,
    listener: Arc<UnixListener>,
}

impl CaptureChannel {
    /// Bind a fresh channel for `service` inside `dir`.
    pub fn open(dir: &Path, service: &str) -> Result<Self, CaptureError> {
        Self::bind(dir.join(channel_name(service)))
    }

    pub fn bind(path: impl Into<PathBuf>) -> Result<Self, CaptureError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        prepare_socket_for_bind(&path)?;

        let listener = UnixListener::bind(&path).map_err(|e| io_err(&path, e))?;
        set_socket_permissions(&path)?;
        listener
            .set_nonblocking(true)
            .map_err(|e| io_err(&path, e))?;

        tracing::debug!(channel = %path.display(), "capture channel bound");
        Ok(Self {
            path,
            listener: Arc::new(listener),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn listener(&self) -> Arc<UnixListener> {
        Arc::clone(&self.listener)
    }

    /// Open a client connection, waiting up to `timeout` for the channel.
    pub fn connect(&self, timeout: Duration) -> Result<UnixStream, CaptureError> {
        connect(&self.path, timeout)
    }
}

impl Drop for CaptureChannel {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(
                channel = %self.path.display(),
                error = %err,
                "failed to remove capture channel",
            ),
        }
    }
}

/// Connect to the channel at `path`, retrying until it is reachable or
/// `timeout` elapses. The returned stream is blocking.
pub fn connect(path: &Path, timeout: Duration) -> Result<UnixStream, CaptureError> {
    let deadline = Instant::now() + timeout;
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => return Ok(stream),
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::NotFound
                        | ErrorKind::ConnectionRefused
                        | ErrorKind::WouldBlock
                        | ErrorKind::Interrupted
                ) =>
            {
                if Instant::now() >= deadline {
                    return Err(CaptureError::Unreachable {
                        path: path.to_path_buf(),
                        timeout_ms: timeout.as_millis(),
                    });
                }
                thread::sleep(CONNECT_RETRY_INTERVAL);
            }
            Err(err) => return Err(io_err(path, err)),
        }
    }
}

/// A stale socket left by a crashed run refuses connections; remove it. A
/// live one means another instance owns the path.
fn prepare_socket_for_bind(socket: &Path) -> Result<(), CaptureError> {
    if !socket.exists() {
        return Ok(());
    }

    match UnixStream::connect(socket) {
        Ok(_) => {
            return Err(CaptureError::InUse {
                path: socket.to_path_buf(),
            });
        }
        Err(err) => {
            tracing::warn!(
                channel = %socket.display(),
                error = %err,
                "removing stale capture channel before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn set_socket_permissions(path: &Path) -> Result<(), CaptureError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

/// One of the process's standard output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Stdout,
    Stderr,
}

impl StdStream {
    pub fn name(self) -> &'static str {
        match self {
            StdStream::Stdout => "stdout",
            StdStream::Stderr => "stderr",
        }
    }

    fn raw_fd(self) -> RawFd {
        match self {
            StdStream::Stdout => io::stdout().as_raw_fd(),
            StdStream::Stderr => io::stderr().as_raw_fd(),
        }
    }

    /// Push anything buffered in the Rust-side handle out to the descriptor.
    pub fn flush(self) {
        let flushed = match self {
            StdStream::Stdout => io::stdout().flush(),
            StdStream::Stderr => io::stderr().flush(),
        };
        if let Err(err) = flushed {
            tracing::warn!(stream = self.name(), error = %err, "failed to flush standard stream");
        }
    }

    /// A new descriptor for whatever the stream currently points at.
    pub fn duplicate(self) -> io::Result<OwnedFd> {
        match self {
            StdStream::Stdout => io::stdout().as_fd().try_clone_to_owned(),
            StdStream::Stderr => io::stderr().as_fd().try_clone_to_owned(),
        }
    }
}

/// A standard stream pointed at a capture channel client. The original
/// descriptor is put back by [`StreamRedirect::restore`] or on drop.
#[derive(Debug)]
pub struct StreamRedirect {
    stream: StdStream,
    saved: Option<OwnedFd>,
    client: Option<UnixStream>,
}

impl StreamRedirect {
    pub fn install(stream: StdStream, client: UnixStream) -> Result<Self, CaptureError> {
        let redirect_err = |source| CaptureError::Redirect {
            stream: stream.name(),
            source,
        };

        stream.flush();
        let saved = stream.duplicate().map_err(redirect_err)?;
        dup_onto(client.as_raw_fd(), stream.raw_fd()).map_err(redirect_err)?;

        tracing::debug!(stream = stream.name(), "standard stream redirected into capture channel");
        Ok(Self {
            stream,
            saved: Some(saved),
            client: Some(client),
        })
    }

    pub fn stream(&self) -> StdStream {
        self.stream
    }

    /// Flush and point the stream back at its original descriptor. Closing
    /// our client handle lets the capture side see end of stream once every
    /// other copy is gone.
    pub fn restore(mut self) -> Result<(), CaptureError> {
        self.restore_inner().map_err(|source| CaptureError::Redirect {
            stream: self.stream.name(),
            source,
        })
    }

    fn restore_inner(&mut self) -> io::Result<()> {
        let Some(saved) = self.saved.take() else {
            return Ok(());
        };
        self.stream.flush();
        let restored = dup_onto(saved.as_raw_fd(), self.stream.raw_fd());
        self.client = None;
        restored
    }
}

impl Drop for StreamRedirect {
    fn drop(&mut self) {
        if let Err(err) = self.restore_inner() {
            tracing::warn!(stream = self.stream.name(), error = %err, "failed to restore standard stream");
        }
    }
}

fn dup_onto(source: RawFd, target: RawFd) -> io::Result<()> {
    loop {
        match dup2(source, target) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn channel_names_are_scoped_to_the_service() {
        let name = channel_name("myservice");
        assert!(name.starts_with("myservice_service_stdlog."));
        let suffix = name.rsplit('.').next().unwrap();
        assert!(suffix.parse::<u64>().is_ok(), "suffix {suffix} is numeric");
    }

    #[test]
    fn bind_connect_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let channel = CaptureChannel::open(dir.path(), "svc").unwrap();
        let path = channel.path().to_path_buf();
        assert!(path.exists());

        let mode = {
            use std::os::unix::fs::PermissionsExt;
            fs::metadata(&path).unwrap().permissions().mode() & 0o777
        };
        assert_eq!(mode, 0o600);

        let mut client = channel.connect(Duration::from_millis(200)).unwrap();
        client.write_all(b"x").unwrap();
        let (mut accepted, _) = loop {
            match channel.listener().accept() {
                Ok(pair) => break pair,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5))
                }
                Err(err) => panic!("accept failed: {err}"),
            }
        };
        accepted.set_nonblocking(false).unwrap();
        let mut byte = [0u8; 1];
        accepted.read_exact(&mut byte).unwrap();
        assert_eq!(&byte, b"x");

        drop(channel);
        assert!(!path.exists(), "socket file removed on drop");
    }

    #[test]
    fn stale_socket_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stale.sock");
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let channel = CaptureChannel::bind(&path).unwrap();
        assert_eq!(channel.path(), path);
    }

    #[test]
    fn live_socket_is_reported_in_use() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("live.sock");
        let _live = UnixListener::bind(&path).unwrap();

        let err = CaptureChannel::bind(&path).unwrap_err();
        assert!(matches!(err, CaptureError::InUse { .. }));
    }

    #[test]
    fn dup_onto_points_a_descriptor_at_another_socket() {
        let (source, mut source_peer) = UnixStream::pair().unwrap();
        let (mut target, _target_peer) = UnixStream::pair().unwrap();

        dup_onto(source.as_raw_fd(), target.as_raw_fd()).unwrap();
        target.write_all(b"moved").unwrap();
        drop(target);
        drop(source);

        let mut received = String::new();
        source_peer.read_to_string(&mut received).unwrap();
        assert_eq!(received, "moved");
    }

    #[test]
    fn dup_onto_reports_a_bad_source() {
        let (target, _peer) = UnixStream::pair().unwrap();
        let err = dup_onto(-1, target.as_raw_fd()).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(Errno::EBADF as i32));
    }

    #[test]
    fn connect_times_out_when_nothing_listens() {
        let dir = TempDir::new().unwrap();
        let err = connect(&dir.path().join("absent.sock"), Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, CaptureError::Unreachable { timeout_ms: 30, .. }));
    }
}
