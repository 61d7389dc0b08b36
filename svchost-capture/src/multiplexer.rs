//! The capture thread: one `poll(2)` loop over every endpoint of the channel.
//!
//! Each cycle arms the endpoints queued by the previous dispatch, polls the
//! shutdown event plus a bounded window of endpoints starting at a rotating
//! cursor, then dispatches every handle that became ready. A fresh listening
//! endpoint is opened whenever a client connects, so a writer reconnecting
//! after its own restart never waits on `connect()`.

use std::io::{self, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixListener;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use svchost_core::{DiagnosticsSink, Level};

use crate::endpoint::{Armed, Completion, Endpoint, EndpointId, EndpointState};
use crate::error::CaptureError;
use crate::event::{poll_timeout, Event, SetOnDrop};
use crate::reassembler::{self, Flush};

/// Default per-endpoint receive buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Endpoints polled per cycle; one slot of the classic 64-handle wait limit
/// goes to the shutdown event.
pub const DEFAULT_MAX_WAIT: usize = 63;

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Consecutive listener failures tolerated before the loop stops replacing it.
const MAX_CONNECT_FAILURES: u32 = 8;

/// Where captured records are copied besides the diagnostics sink.
pub type Mirror = Box<dyn Write + Send>;

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub buffer_size: usize,
    pub max_wait: usize,
    pub drain_timeout: Duration,
    /// Level every captured record is logged at.
    pub level: Level,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_wait: DEFAULT_MAX_WAIT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            level: Level::Info,
        }
    }
}

/// Result of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    Continue,
    Exit,
}

pub struct Multiplexer {
    listener: Arc<UnixListener>,
    sink: Arc<dyn DiagnosticsSink>,
    options: CaptureOptions,
    shutdown: Arc<Event>,
    mirror: Option<Mirror>,
    endpoints: Vec<Endpoint>,
    to_arm: Vec<EndpointId>,
    next_id: EndpointId,
    cursor: usize,
    terminating: bool,
    quiet_cycles: usize,
    connect_failures: u32,
}

impl Multiplexer {
    /// Build the loop around `listener` with one listening endpoint.
    pub fn new(
        listener: Arc<UnixListener>,
        sink: Arc<dyn DiagnosticsSink>,
        options: CaptureOptions,
    ) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let mut mux = Self {
            listener,
            sink,
            options,
            shutdown: Arc::new(Event::new()?),
            mirror: None,
            endpoints: Vec::new(),
            to_arm: Vec::new(),
            next_id: 1,
            cursor: 0,
            terminating: false,
            quiet_cycles: 0,
            connect_failures: 0,
        };
        mux.open_listener();
        Ok(mux)
    }

    /// Copy every captured record to `mirror` as well.
    pub fn with_mirror(mut self, mirror: Mirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Setting this event asks the loop to drain and exit.
    pub fn shutdown_event(&self) -> Arc<Event> {
        Arc::clone(&self.shutdown)
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Endpoints waiting for the next client.
    pub fn listening_count(&self) -> usize {
        self.endpoints.iter().filter(|e| e.is_listening()).count()
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating
    }

    /// Run the loop on a thread named `capture`. `stopped` is set when the
    /// thread returns, whichever way it exits.
    pub fn spawn(self, stopped: Arc<Event>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let _stopped = SetOnDrop::new(stopped);
                self.run();
            })
    }

    /// Loop until shutdown has been requested and a drain cycle comes up
    /// empty, then flush what is left.
    pub fn run(mut self) {
        tracing::info!(
            max_wait = self.options.max_wait,
            buffer_size = self.options.buffer_size,
            "capture loop started",
        );
        while self.cycle() == Cycle::Continue {}
        self.finish();
        tracing::info!("capture loop stopped");
    }

    /// One iteration: arm, poll, dispatch.
    pub fn cycle(&mut self) -> Cycle {
        self.arm_pending();
        self.ensure_listener();

        let count = self.endpoints.len();
        let take = count.min(self.options.max_wait.max(1));
        if self.cursor >= count {
            self.cursor = 0;
        }
        let window: Vec<usize> = (0..take).map(|i| (self.cursor + i) % count).collect();
        let rotating = take < count;

        // Endpoints outside the window cannot wake the poll, so a partial
        // window only waits as long as a drain pass would.
        let timeout = if window.iter().any(|&i| self.endpoints[i].is_signaled()) {
            PollTimeout::ZERO
        } else if self.terminating || rotating {
            poll_timeout(Some(self.options.drain_timeout))
        } else {
            PollTimeout::NONE
        };

        let (shutdown_fired, ready) = match self.wait(&window, timeout) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return Cycle::Continue,
            Err(errno) => {
                let err = CaptureError::Wait(errno.into());
                tracing::error!(error = %err, "stopping the capture loop");
                return Cycle::Exit;
            }
        };

        // Step a whole window so ceil(count / take) cycles cover every endpoint.
        if count > 0 {
            self.cursor = (self.cursor + take) % count;
        }

        if shutdown_fired {
            if let Err(err) = self.shutdown.reset() {
                tracing::warn!(error = %err, "failed to reset the capture shutdown event");
            }
            if !self.terminating {
                tracing::debug!("capture shutdown requested; draining");
                self.terminating = true;
            }
        }

        if ready.is_empty() {
            if self.terminating && !shutdown_fired {
                // Exit only after a full sweep of the set came up empty.
                self.quiet_cycles += 1;
                if self.quiet_cycles >= count.div_ceil(take.max(1)).max(1) {
                    return Cycle::Exit;
                }
            }
            return Cycle::Continue;
        }
        self.quiet_cycles = 0;

        for index in ready {
            self.dispatch(index);
        }
        self.retire();
        Cycle::Continue
    }

    /// Poll the shutdown event and the window. `Ok(None)` means interrupted.
    fn wait(
        &self,
        window: &[usize],
        timeout: PollTimeout,
    ) -> Result<Option<(bool, Vec<usize>)>, Errno> {
        let mut fds = Vec::with_capacity(window.len() + 1);
        fds.push(PollFd::new(self.shutdown.as_fd(), PollFlags::POLLIN));
        let mut polled = Vec::with_capacity(window.len());
        for &index in window {
            if let Some(fd) = self.endpoints[index].wait_fd() {
                fds.push(PollFd::new(fd, PollFlags::POLLIN));
                polled.push(index);
            }
        }

        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(None),
            Err(errno) => return Err(errno),
        }

        let revents: Vec<PollFlags> = fds
            .iter()
            .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
            .collect();
        if revents.iter().any(|r| r.contains(PollFlags::POLLNVAL)) {
            return Err(Errno::EBADF);
        }

        let wake = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        let shutdown_fired = revents[0].intersects(wake);
        let woken: Vec<usize> = polled
            .iter()
            .zip(&revents[1..])
            .filter(|(_, r)| r.intersects(wake))
            .map(|(&index, _)| index)
            .collect();

        let ready = window
            .iter()
            .copied()
            .filter(|index| woken.contains(index) || self.endpoints[*index].is_signaled())
            .collect();
        Ok(Some((shutdown_fired, ready)))
    }

    /// Arm everything queued, including listeners opened while arming.
    fn arm_pending(&mut self) {
        while !self.to_arm.is_empty() {
            let ids = std::mem::take(&mut self.to_arm);
            for id in ids {
                if let Some(index) = self.position(id) {
                    self.arm(index);
                }
            }
        }
        self.retire();
    }

    fn arm(&mut self, index: usize) {
        let endpoint = &mut self.endpoints[index];
        let id = endpoint.id();
        match endpoint.arm() {
            Ok(Armed::Waiting) | Ok(Armed::Signaled) | Ok(Armed::Closed) => {}
            Ok(Armed::Connected) => {
                tracing::debug!(endpoint = id, "client was already waiting");
                self.connected(index);
            }
            Err(err) => self.endpoint_failed(id, &err),
        }
    }

    fn dispatch(&mut self, index: usize) {
        let endpoint = &mut self.endpoints[index];
        let id = endpoint.id();
        match endpoint.collect_result() {
            Ok(Completion::Pending) => {}
            Ok(Completion::Connected) => {
                tracing::debug!(endpoint = id, "client connected");
                self.connected(index);
            }
            Ok(Completion::Read(n)) => {
                endpoint.advance(n);
                self.deliver(index, n, Flush::Incremental);
                self.to_arm.push(id);
            }
            Ok(Completion::EndOfStream) => {
                tracing::debug!(endpoint = id, "client disconnected");
            }
            Err(err) => self.endpoint_failed(id, &err),
        }
    }

    /// The endpoint at `index` just got its client: start reading and put a
    /// new listener in its place.
    fn connected(&mut self, index: usize) {
        self.connect_failures = 0;
        self.open_listener();
        self.arm(index);
    }

    fn endpoint_failed(&mut self, id: EndpointId, err: &CaptureError) {
        let listening = self
            .position(id)
            .map(|index| self.endpoints[index].state() == EndpointState::ConnectError)
            .unwrap_or(false);
        if listening {
            self.connect_failures += 1;
        }
        tracing::error!(endpoint = id, error = %err, "capture endpoint failed; retiring it");
    }

    fn open_listener(&mut self) {
        let id = self.next_id;
        self.next_id += 1;
        self.endpoints.push(Endpoint::listening(
            id,
            Arc::clone(&self.listener),
            self.options.buffer_size,
            self.options.level,
        ));
        self.to_arm.push(id);
    }

    fn ensure_listener(&mut self) {
        if self.listening_count() > 0 {
            return;
        }
        if self.connect_failures >= MAX_CONNECT_FAILURES {
            if self.connect_failures == MAX_CONNECT_FAILURES {
                tracing::error!(
                    failures = self.connect_failures,
                    "capture channel keeps failing to accept; no longer listening",
                );
                self.connect_failures += 1;
            }
            return;
        }
        self.open_listener();
        self.arm_pending();
    }

    /// Run the reassembler over the endpoint's buffer and emit its records.
    fn deliver(&mut self, index: usize, appended: usize, flush: Flush) {
        let endpoint = &mut self.endpoints[index];
        let extracted = reassembler::extract(
            endpoint.buffer(),
            appended,
            endpoint.capacity(),
            flush,
        );

        for record in &extracted.records {
            self.sink.push(endpoint.level(), record);
            if let Some(mirror) = self.mirror.as_mut() {
                let written = mirror
                    .write_all(record)
                    .and_then(|()| mirror.write_all(b"\n"))
                    .and_then(|()| mirror.flush());
                if let Err(err) = written {
                    tracing::warn!(error = %err, "console mirror failed; detaching it");
                    self.mirror = None;
                }
            }
        }
        if extracted.overflowed {
            tracing::debug!(
                endpoint = endpoint.id(),
                capacity = endpoint.capacity(),
                "buffer filled without a line boundary; flushed whole",
            );
        }

        let consumed = extracted.consumed;
        endpoint.compact(consumed);
    }

    /// Drop endpoints that can make no further progress, draining any tail.
    fn retire(&mut self) {
        let dead: Vec<usize> = self
            .endpoints
            .iter()
            .enumerate()
            .filter(|(_, e)| is_dead(e) && e.buffered() > 0)
            .map(|(index, _)| index)
            .collect();
        for index in dead {
            self.deliver(index, 0, Flush::Final);
        }
        self.endpoints.retain(|e| !is_dead(e));
    }

    fn finish(&mut self) {
        for index in 0..self.endpoints.len() {
            if self.endpoints[index].buffered() > 0 {
                self.deliver(index, 0, Flush::Final);
            }
        }
        if let Some(mut mirror) = self.mirror.take() {
            if let Err(err) = mirror.flush() {
                tracing::warn!(error = %err, "failed to flush the console mirror");
            }
        }
    }

    fn position(&self, id: EndpointId) -> Option<usize> {
        self.endpoints.iter().position(|e| e.id() == id)
    }
}

fn is_dead(endpoint: &Endpoint) -> bool {
    matches!(
        endpoint.state(),
        EndpointState::EndOfStream | EndpointState::ConnectError
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(Level, String)>>);

    impl DiagnosticsSink for Recorder {
        fn push(&self, level: Level, text: &[u8]) {
            self.0
                .lock()
                .unwrap()
                .push((level, String::from_utf8_lossy(text).into_owned()));
        }
    }

    impl Recorder {
        fn lines(&self) -> Vec<String> {
            self.0.lock().unwrap().iter().map(|(_, l)| l.clone()).collect()
        }
    }

    fn setup(options: CaptureOptions) -> (TempDir, std::path::PathBuf, Arc<Recorder>, Multiplexer) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mux.sock");
        let listener = Arc::new(UnixListener::bind(&path).unwrap());
        let recorder = Arc::new(Recorder::default());
        let mux = Multiplexer::new(listener, recorder.clone(), options).unwrap();
        (dir, path, recorder, mux)
    }

    #[test]
    fn starts_with_one_listener() {
        let (_dir, _path, _recorder, mux) = setup(CaptureOptions::default());
        assert_eq!(mux.endpoint_count(), 1);
        assert_eq!(mux.listening_count(), 1);
        assert!(!mux.is_terminating());
    }

    #[test]
    fn connection_is_replaced_by_a_new_listener() {
        let (_dir, path, recorder, mut mux) = setup(CaptureOptions::default());
        let mut first = UnixStream::connect(&path).unwrap();
        first.write_all(b"hello\n").unwrap();

        assert_eq!(mux.cycle(), Cycle::Continue);
        assert_eq!(mux.endpoint_count(), 2);
        assert_eq!(mux.listening_count(), 1);
        assert_eq!(recorder.lines(), vec!["hello"]);

        let _second = UnixStream::connect(&path).unwrap();
        assert_eq!(mux.cycle(), Cycle::Continue);
        assert_eq!(mux.endpoint_count(), 3);
        assert_eq!(mux.listening_count(), 1);
    }

    #[test]
    fn records_carry_the_configured_level() {
        let options = CaptureOptions {
            level: Level::Warning,
            ..CaptureOptions::default()
        };
        let (_dir, path, recorder, mut mux) = setup(options);
        let mut client = UnixStream::connect(&path).unwrap();
        client.write_all(b"careful\n").unwrap();
        assert_eq!(mux.cycle(), Cycle::Continue);

        let records = recorder.0.lock().unwrap().clone();
        assert_eq!(records, vec![(Level::Warning, "careful".to_string())]);
    }

    #[test]
    fn shutdown_sweep_covers_endpoints_behind_the_cursor() {
        let options = CaptureOptions {
            max_wait: 2,
            drain_timeout: Duration::from_millis(20),
            ..CaptureOptions::default()
        };
        let (_dir, path, recorder, mut mux) = setup(options);
        let mut clients: Vec<UnixStream> =
            (0..6).map(|_| UnixStream::connect(&path).unwrap()).collect();
        while mux.endpoint_count() < 7 {
            assert_eq!(mux.cycle(), Cycle::Continue);
        }

        // The first client's endpoint sits just behind the window.
        mux.cursor = 1;
        clients[0].write_all(b"behind\n").unwrap();
        mux.shutdown_event().set().unwrap();

        let mut cycles = 0;
        while mux.cycle() == Cycle::Continue {
            cycles += 1;
            assert!(cycles < 50, "loop never exited");
        }
        mux.finish();
        assert_eq!(recorder.lines(), vec!["behind"]);
    }

    struct FailingFlush;

    impl Write for FailingFlush {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "console gone"))
        }
    }

    #[test]
    fn mirror_flush_failure_at_exit_is_not_fatal() {
        let options = CaptureOptions {
            drain_timeout: Duration::from_millis(20),
            ..CaptureOptions::default()
        };
        let (_dir, _path, recorder, mux) = setup(options);
        let mut mux = mux.with_mirror(Box::new(FailingFlush));

        mux.shutdown_event().set().unwrap();
        while mux.cycle() == Cycle::Continue {}
        mux.finish();
        assert!(mux.mirror.is_none());
        assert!(recorder.lines().is_empty());
    }

    #[test]
    fn shutdown_drains_then_exits() {
        let options = CaptureOptions {
            drain_timeout: Duration::from_millis(20),
            ..CaptureOptions::default()
        };
        let (_dir, path, recorder, mut mux) = setup(options);
        let mut client = UnixStream::connect(&path).unwrap();
        client.write_all(b"one\ntail without newline").unwrap();
        drop(client);

        mux.shutdown_event().set().unwrap();
        let mut cycles = 0;
        while mux.cycle() == Cycle::Continue {
            cycles += 1;
            assert!(cycles < 50, "loop never exited");
        }
        assert!(mux.is_terminating());
        mux.finish();
        assert_eq!(recorder.lines(), vec!["one", "tail without newline"]);
    }
}
