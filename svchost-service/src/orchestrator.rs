//! One service run, from configuration to a drained shutdown.
//!
//! ```text
//! Init → ConfigLoaded → LoggerStarted → StreamsRedirected → Running → ShuttingDown → Stopped
//! ```
//!
//! Shutdown is two-phase and strictly ordered: the worker is stopped (or given
//! up on) first, the standard streams are handed back, and only then is the
//! capture thread told to drain and exit. Output the daemon produced on its
//! way out is therefore still read and logged.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use svchost_capture::{CaptureChannel, Event, Mirror, Multiplexer, StdStream, StreamRedirect};
use svchost_core::DiagnosticsSink;

use crate::console;
use crate::error::{io_err, ServiceError};
use crate::hosted::HostedDaemon;
use crate::logging::{self, TracingSink};
use crate::settings::{self, ServiceOptions, ServiceSettings};
use crate::signals::SignalRoute;
use crate::worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Init,
    ConfigLoaded,
    LoggerStarted,
    StreamsRedirected,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// An operator, signal or [`StopHandle`] asked the service to stop.
    Requested,
    /// The hosted daemon returned on its own.
    DaemonExited,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub service: String,
    pub stop_reason: StopReason,
    /// `None` when the worker was abandoned or panicked.
    pub exit_code: Option<i32>,
    pub worker_timed_out: bool,
    pub capture_timed_out: bool,
}

/// Requests a stop of a running service from any thread.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<Event>);

impl StopHandle {
    pub fn stop(&self) -> io::Result<()> {
        self.0.set()
    }
}

pub struct Orchestrator {
    settings: ServiceSettings,
    config_source: Option<PathBuf>,
    state: ServiceState,
    stop: Arc<Event>,
    sink: Option<Arc<dyn DiagnosticsSink>>,
    route_signals: bool,
}

impl Orchestrator {
    /// `Init → ConfigLoaded`: load and resolve the configuration. Errors here
    /// are reported before anything is started.
    pub fn configure(options: ServiceOptions) -> Result<Self, ServiceError> {
        let config = settings::load_config(&options)?;
        let settings = ServiceSettings::resolve(&config, &options)?;
        let mut orchestrator = Self::from_settings(settings)?;
        orchestrator.config_source = config.source().map(|p| p.to_path_buf());
        Ok(orchestrator)
    }

    pub fn from_settings(settings: ServiceSettings) -> Result<Self, ServiceError> {
        Ok(Self {
            settings,
            config_source: None,
            state: ServiceState::ConfigLoaded,
            stop: Arc::new(Event::new().map_err(ServiceError::Event)?),
            sink: None,
            route_signals: false,
        })
    }

    /// Send captured records to `sink` instead of the log.
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Turn SIGTERM, SIGINT and SIGHUP into stop requests while running.
    pub fn with_signal_routing(mut self, enabled: bool) -> Self {
        self.route_signals = enabled;
        self
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    /// Host `daemon` until it exits or a stop is requested.
    pub fn run(mut self, daemon: Arc<dyn HostedDaemon>) -> Result<RunReport, ServiceError> {
        let result = self.run_inner(daemon);
        if let Err(err) = &result {
            tracing::error!(service = %self.settings.name, state = ?self.state, error = %err, "service run failed");
        }
        result
    }

    fn run_inner(&mut self, daemon: Arc<dyn HostedDaemon>) -> Result<RunReport, ServiceError> {
        logging::start(&self.settings.log)?;
        self.advance(ServiceState::LoggerStarted);
        tracing::info!(
            service = %self.settings.name,
            config = ?self.config_source,
            log = %self.settings.log.file.display(),
            "service starting",
        );

        let _signals = if self.route_signals {
            Some(SignalRoute::install(&self.stop)?)
        } else {
            None
        };

        let sink = self
            .sink
            .clone()
            .unwrap_or_else(|| Arc::new(TracingSink) as Arc<dyn DiagnosticsSink>);
        let mirror = console::attach(self.settings.console_mirror);
        let capture = CaptureThread::start(&self.settings, sink, mirror)?;

        let redirects = match Redirects::install(&capture.channel, self.settings.connect_timeout) {
            Ok(redirects) => redirects,
            Err(err) => {
                capture.stop(self.settings.shutdown_timeout);
                return Err(err);
            }
        };
        self.advance(ServiceState::StreamsRedirected);

        let worker_stopped = match Event::new() {
            Ok(event) => Arc::new(event),
            Err(err) => {
                redirects.restore();
                capture.stop(self.settings.shutdown_timeout);
                return Err(ServiceError::Event(err));
            }
        };
        let worker = match worker::spawn(
            Arc::clone(&daemon),
            self.settings.argv.clone(),
            Arc::clone(&worker_stopped),
        ) {
            Ok(handle) => handle,
            Err(err) => {
                redirects.restore();
                capture.stop(self.settings.shutdown_timeout);
                return Err(err);
            }
        };
        self.advance(ServiceState::Running);

        let stop_reason = match Event::wait_any(&[self.stop.as_ref(), worker_stopped.as_ref()], None) {
            Ok(Some(0)) => {
                tracing::info!("stop requested; shutting down");
                StopReason::Requested
            }
            Ok(_) => {
                tracing::info!("hosted daemon exited on its own; shutting down");
                StopReason::DaemonExited
            }
            Err(err) => {
                tracing::error!(error = %err, "waiting for stop failed; shutting down");
                StopReason::Requested
            }
        };

        self.advance(ServiceState::ShuttingDown);
        let (exit_code, worker_timed_out) =
            self.stop_worker(daemon.as_ref(), stop_reason, &worker_stopped, worker);

        redirects.restore();
        let capture_timed_out = capture.stop(self.settings.shutdown_timeout);
        self.advance(ServiceState::Stopped);

        if let Err(err) = self.stop.reset() {
            tracing::warn!(error = %err, "failed to reset the stop event");
        }
        tracing::info!(service = %self.settings.name, ?stop_reason, ?exit_code, "service stopped");

        Ok(RunReport {
            service: self.settings.name.clone(),
            stop_reason,
            exit_code,
            worker_timed_out,
            capture_timed_out,
        })
    }

    /// Ask the daemon to stop if it did not already, and wait a bounded time.
    fn stop_worker(
        &self,
        daemon: &dyn HostedDaemon,
        reason: StopReason,
        stopped: &Event,
        worker: JoinHandle<i32>,
    ) -> (Option<i32>, bool) {
        if reason == StopReason::Requested && !daemon.request_stop() {
            tracing::info!("hosted daemon took no stop request; waiting for it to exit");
        }

        let timeout = self.settings.shutdown_timeout;
        let done = match stopped.wait(Some(timeout)) {
            Ok(done) => done,
            Err(err) => {
                tracing::error!(error = %err, "waiting for the worker failed");
                false
            }
        };
        if !done {
            tracing::warn!(
                timeout_secs = timeout.as_secs_f64(),
                "hosted daemon did not stop in time; detaching the worker",
            );
            return (None, true);
        }

        match worker.join() {
            Ok(code) => (Some(code), false),
            Err(_) => {
                tracing::error!("worker thread panicked");
                (None, false)
            }
        }
    }

    fn advance(&mut self, next: ServiceState) {
        tracing::debug!(from = ?self.state, to = ?next, "service state");
        self.state = next;
    }
}

/// The capture channel and the thread draining it.
struct CaptureThread {
    channel: CaptureChannel,
    shutdown: Arc<Event>,
    stopped: Arc<Event>,
    handle: JoinHandle<()>,
}

impl CaptureThread {
    fn start(
        settings: &ServiceSettings,
        sink: Arc<dyn DiagnosticsSink>,
        mirror: Option<Mirror>,
    ) -> Result<Self, ServiceError> {
        let channel = CaptureChannel::open(&settings.runtime_dir, &settings.name)?;
        let mut mux = Multiplexer::new(channel.listener(), sink, settings.capture.clone())
            .map_err(|e| io_err(channel.path(), e))?;
        if let Some(mirror) = mirror {
            mux = mux.with_mirror(mirror);
        }
        let shutdown = mux.shutdown_event();
        let stopped = Arc::new(Event::new().map_err(ServiceError::Event)?);
        let handle = mux
            .spawn(Arc::clone(&stopped))
            .map_err(|source| ServiceError::Spawn {
                what: "capture thread",
                source,
            })?;

        tracing::info!(channel = %channel.path().display(), "capture started");
        Ok(Self {
            channel,
            shutdown,
            stopped,
            handle,
        })
    }

    /// Signal shutdown and wait up to `timeout`. Returns whether it timed out.
    fn stop(self, timeout: Duration) -> bool {
        if let Err(err) = self.shutdown.set() {
            tracing::error!(error = %err, "failed to signal capture shutdown");
        }
        let done = self.stopped.wait(Some(timeout)).unwrap_or(false);
        if !done {
            tracing::warn!(
                timeout_secs = timeout.as_secs_f64(),
                "capture thread did not stop in time; detaching it",
            );
            return true;
        }
        if self.handle.join().is_err() {
            tracing::error!("capture thread panicked");
        }
        false
    }
}

/// stderr then stdout, each pointed at its own channel connection.
struct Redirects(Vec<StreamRedirect>);

impl Redirects {
    fn install(channel: &CaptureChannel, timeout: Duration) -> Result<Self, ServiceError> {
        let mut installed = Vec::with_capacity(2);
        for stream in [StdStream::Stderr, StdStream::Stdout] {
            let client = channel.connect(timeout)?;
            installed.push(StreamRedirect::install(stream, client)?);
        }
        Ok(Self(installed))
    }

    fn restore(self) {
        for redirect in self.0.into_iter().rev() {
            let stream = redirect.stream();
            if let Err(err) = redirect.restore() {
                tracing::warn!(stream = stream.name(), error = %err, "failed to restore standard stream");
            }
        }
    }
}
