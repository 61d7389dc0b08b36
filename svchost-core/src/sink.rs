//! Diagnostic levels and the sink every captured record is pushed into.

use std::fmt;
use std::str::FromStr;

/// Severity attached to a pushed record.
///
/// `None` means "do not emit": a sink receiving it drops the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Level {
    None,
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::None => "none",
            Level::Error => "error",
            Level::Warning => "warning",
            Level::Info => "info",
            Level::Debug => "debug",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Level::None),
            "error" => Ok(Level::Error),
            "warning" | "warn" => Ok(Level::Warning),
            "info" => Ok(Level::Info),
            "debug" => Ok(Level::Debug),
            other => Err(format!(
                "unknown level '{other}'; expected: none, error, warning, info, debug"
            )),
        }
    }
}

/// Destination for already-delimited diagnostic messages.
///
/// Implementations are shared between the worker and capture threads, so they
/// must accept concurrent appends and must not block a caller for longer than
/// a bounded write.
pub trait DiagnosticsSink: Send + Sync {
    /// Append one message. `text` carries no trailing newline.
    fn push(&self, level: Level, text: &[u8]);

    fn error(&self, text: &str) {
        self.push(Level::Error, text.as_bytes());
    }

    fn warning(&self, text: &str) {
        self.push(Level::Warning, text.as_bytes());
    }

    fn info(&self, text: &str) {
        self.push(Level::Info, text.as_bytes());
    }

    fn debug(&self, text: &str) {
        self.push(Level::Debug, text.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

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

    #[test]
    fn level_parses_case_insensitively_with_aliases() {
        assert_eq!("WARN".parse::<Level>().unwrap(), Level::Warning);
        assert_eq!(" Debug ".parse::<Level>().unwrap(), Level::Debug);
        assert_eq!("off".parse::<Level>().unwrap(), Level::None);
        assert!("verbose".parse::<Level>().is_err());
    }

    #[test]
    fn level_display_round_trips() {
        for level in [
            Level::None,
            Level::Error,
            Level::Warning,
            Level::Info,
            Level::Debug,
        ] {
            assert_eq!(level.to_string().parse::<Level>().unwrap(), level);
        }
    }

    #[test]
    fn capability_helpers_route_through_push() {
        let sink = Recorder::default();
        sink.error("boom");
        sink.warning("careful");
        sink.info("hello");
        sink.debug("detail");

        let seen = sink.0.lock().unwrap();
        let levels: Vec<Level> = seen.iter().map(|(level, _)| *level).collect();
        assert_eq!(
            levels,
            vec![Level::Error, Level::Warning, Level::Info, Level::Debug]
        );
        assert_eq!(seen[0].1, "boom");
    }
}
