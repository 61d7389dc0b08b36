//! Routing of termination signals into the service's stop-request event.

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::SigId;
use svchost_capture::Event;

use crate::error::ServiceError;

pub const STOP_SIGNALS: [i32; 3] = [SIGTERM, SIGINT, SIGHUP];

/// While alive, each of [`STOP_SIGNALS`] sets the stop event through a
/// self-pipe write, which is async-signal-safe.
#[derive(Debug)]
pub struct SignalRoute {
    ids: Vec<SigId>,
}

impl SignalRoute {
    pub fn install(stop: &Event) -> Result<Self, ServiceError> {
        let mut route = Self { ids: Vec::new() };
        for signal in STOP_SIGNALS {
            let writer = stop.writer().map_err(ServiceError::Signal)?;
            let id = signal_hook::low_level::pipe::register(signal, writer)
                .map_err(ServiceError::Signal)?;
            route.ids.push(id);
        }
        tracing::debug!(signals = ?STOP_SIGNALS, "stop signals routed");
        Ok(route)
    }
}

impl Drop for SignalRoute {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}
