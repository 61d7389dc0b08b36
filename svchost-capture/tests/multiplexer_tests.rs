use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use svchost_capture::{CaptureChannel, CaptureOptions, Cycle, Event, Multiplexer};
use svchost_core::{DiagnosticsSink, Level};
use tempfile::TempDir;

#[derive(Default)]
struct MemorySink(Mutex<Vec<String>>);

impl DiagnosticsSink for MemorySink {
    fn push(&self, _level: Level, text: &[u8]) {
        self.0
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(text).into_owned());
    }
}

impl MemorySink {
    fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct Running {
    _dir: TempDir,
    channel: CaptureChannel,
    sink: Arc<MemorySink>,
    shutdown: Arc<Event>,
    stopped: Arc<Event>,
    handle: std::thread::JoinHandle<()>,
}

fn start(options: CaptureOptions, mirror: Option<SharedBuffer>) -> Running {
    let dir = TempDir::new().expect("tempdir");
    let channel = CaptureChannel::open(dir.path(), "test").expect("open channel");
    let sink = Arc::new(MemorySink::default());
    let mut mux = Multiplexer::new(channel.listener(), sink.clone(), options).expect("mux");
    if let Some(mirror) = mirror {
        mux = mux.with_mirror(Box::new(mirror));
    }
    let shutdown = mux.shutdown_event();
    let stopped = Arc::new(Event::new().expect("event"));
    let handle = mux.spawn(Arc::clone(&stopped)).expect("spawn capture");
    Running {
        _dir: dir,
        channel,
        sink,
        shutdown,
        stopped,
        handle,
    }
}

impl Running {
    fn client(&self) -> UnixStream {
        self.channel
            .connect(Duration::from_secs(2))
            .expect("connect client")
    }

    fn stop(self) -> Arc<MemorySink> {
        self.shutdown.set().expect("signal shutdown");
        assert!(
            self.stopped.wait(Some(Duration::from_secs(10))).unwrap(),
            "capture thread did not stop"
        );
        self.handle.join().expect("capture thread panicked");
        self.sink
    }
}

fn options() -> CaptureOptions {
    CaptureOptions {
        drain_timeout: Duration::from_millis(50),
        ..CaptureOptions::default()
    }
}

#[test]
fn lines_written_before_shutdown_reach_the_sink() {
    let running = start(options(), None);
    let mut client = running.client();
    client.write_all(b"line1\nline2\n").unwrap();
    drop(client);

    let sink = running.stop();
    assert_eq!(sink.lines(), vec!["line1", "line2"]);
}

#[test]
fn unterminated_tail_is_flushed_at_end_of_stream() {
    let running = start(options(), None);
    let mut client = running.client();
    client.write_all(b"first\r\nsecond half").unwrap();
    drop(client);

    let sink = running.stop();
    assert_eq!(sink.lines(), vec!["first", "second half"]);
}

#[test]
fn open_client_is_drained_on_shutdown() {
    let running = start(options(), None);
    let mut client = running.client();
    client.write_all(b"still connected\npartial").unwrap();

    let sink = running.stop();
    drop(client);
    assert_eq!(sink.lines(), vec!["still connected", "partial"]);
}

#[test]
fn rotation_services_every_connection() {
    let running = start(
        CaptureOptions {
            max_wait: 1,
            ..options()
        },
        None,
    );

    let mut a = running.client();
    let mut b = running.client();
    for i in 0..20 {
        writeln!(a, "a{i}").unwrap();
        writeln!(b, "b{i}").unwrap();
    }
    drop(a);
    drop(b);

    let lines = running.stop().lines();
    let from = |prefix: char| -> Vec<String> {
        lines
            .iter()
            .filter(|l| l.starts_with(prefix))
            .cloned()
            .collect()
    };
    let expected = |prefix: char| -> Vec<String> { (0..20).map(|i| format!("{prefix}{i}")).collect() };
    assert_eq!(from('a'), expected('a'));
    assert_eq!(from('b'), expected('b'));
}

#[test]
fn reconnecting_writer_is_accepted() {
    let running = start(options(), None);
    for round in 0..3 {
        let mut client = running.client();
        writeln!(client, "round {round}").unwrap();
    }

    let mut lines = running.stop().lines();
    lines.sort();
    assert_eq!(lines, vec!["round 0", "round 1", "round 2"]);
}

#[test]
fn records_are_mirrored_line_by_line() {
    let mirror = SharedBuffer::default();
    let running = start(options(), Some(mirror.clone()));
    let mut client = running.client();
    client.write_all(b"to console\r\n").unwrap();
    drop(client);

    running.stop();
    assert_eq!(&*mirror.0.lock().unwrap(), b"to console\n");
}

#[test]
fn late_writes_on_a_partial_window_are_drained() {
    let dir = TempDir::new().unwrap();
    let channel = CaptureChannel::open(dir.path(), "test").unwrap();
    let sink = Arc::new(MemorySink::default());
    let options = CaptureOptions {
        max_wait: 2,
        drain_timeout: Duration::from_millis(20),
        ..CaptureOptions::default()
    };
    let mut mux = Multiplexer::new(channel.listener(), sink.clone(), options).unwrap();

    let mut clients: Vec<UnixStream> = (0..6)
        .map(|_| UnixStream::connect(channel.path()).unwrap())
        .collect();
    let mut cycles = 0;
    while mux.endpoint_count() < 7 {
        assert_eq!(mux.cycle(), Cycle::Continue);
        cycles += 1;
        assert!(cycles < 50, "clients were never accepted");
    }

    mux.shutdown_event().set().unwrap();
    assert_eq!(mux.cycle(), Cycle::Continue);
    assert!(mux.is_terminating());

    for (i, client) in clients.iter_mut().enumerate() {
        writeln!(client, "late {i}").unwrap();
    }
    while mux.cycle() == Cycle::Continue {
        cycles += 1;
        assert!(cycles < 200, "loop never exited");
    }

    let mut lines = sink.lines();
    lines.sort();
    let expected: Vec<String> = (0..6).map(|i| format!("late {i}")).collect();
    assert_eq!(lines, expected);
}
