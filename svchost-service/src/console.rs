//! Mirroring captured records onto the terminal the service was started from.

use std::fs::File;
use std::io::{self, IsTerminal};

use svchost_capture::{Mirror, StdStream};

/// A writer onto the current stdout, taken before stdout is redirected.
///
/// Returns `None` unless mirroring is `enabled` and stdout is a terminal; a
/// service started by a supervisor has nobody watching its console.
pub fn attach(enabled: bool) -> Option<Mirror> {
    if !enabled {
        return None;
    }
    if !io::stdout().is_terminal() {
        tracing::debug!("stdout is not a terminal; console mirror disabled");
        return None;
    }
    match StdStream::Stdout.duplicate() {
        Ok(fd) => Some(Box::new(File::from(fd))),
        Err(err) => {
            tracing::warn!(error = %err, "could not attach console mirror");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_mirror_is_never_attached() {
        assert!(attach(false).is_none());
    }
}
