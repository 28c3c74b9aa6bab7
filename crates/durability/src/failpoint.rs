//! Named fault-injection switches for the checkpoint path
//!
//! A `FailpointRegistry` is created by test wiring and handed to the server
//! at construction; a server without one never consults a failpoint. The
//! checkpoint engine calls [`FailpointRegistry::fire`] at exactly two hook
//! points:
//!
//! - [`CHECKPOINT_BEFORE_SYNC`]: layer file written, not yet fsynced
//! - [`CHECKPOINT_AFTER_SYNC`]: layer file durable, MANIFEST not yet updated
//!
//! The registry can be driven programmatically or with the frontend's
//! configuration string:
//!
//! ```text
//! checkpoint-before-sync=sleep(2000);checkpoint-after-sync=panic
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info};

/// Hook between writing a layer file and syncing it
pub const CHECKPOINT_BEFORE_SYNC: &str = "checkpoint-before-sync";

/// Hook between syncing a layer file and publishing it
pub const CHECKPOINT_AFTER_SYNC: &str = "checkpoint-after-sync";

/// All recognised hook points
pub const KNOWN_FAILPOINTS: [&str; 2] = [CHECKPOINT_BEFORE_SYNC, CHECKPOINT_AFTER_SYNC];

/// What a hook does when reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailAction {
    /// Nothing
    #[default]
    Off,
    /// Block the calling thread
    Sleep(Duration),
    /// Terminate the process immediately, without unwinding or destructors
    Abort,
    /// Make the hook fail with an injected I/O error
    ReturnError,
}

impl fmt::Display for FailAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailAction::Off => write!(f, "off"),
            FailAction::Sleep(d) => write!(f, "sleep({})", d.as_millis()),
            FailAction::Abort => write!(f, "panic"),
            FailAction::ReturnError => write!(f, "return"),
        }
    }
}

impl FromStr for FailAction {
    type Err = FailpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "off" => return Ok(FailAction::Off),
            "panic" | "abort" => return Ok(FailAction::Abort),
            "return" => return Ok(FailAction::ReturnError),
            _ => {}
        }

        let millis = s
            .strip_prefix("sleep(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| FailpointParseError::UnknownAction(s.to_string()))?;
        let millis: u64 = millis
            .trim()
            .parse()
            .map_err(|_| FailpointParseError::InvalidSleep(s.to_string()))?;
        Ok(FailAction::Sleep(Duration::from_millis(millis)))
    }
}

#[derive(Debug, Default)]
struct Entry {
    action: FailAction,
    hits: u64,
}

/// Table of armed failpoints
#[derive(Debug, Default)]
pub struct FailpointRegistry {
    entries: Mutex<HashMap<&'static str, Entry>>,
}

impl FailpointRegistry {
    /// Registry with every failpoint off
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or disarm, with `FailAction::Off`) one failpoint
    pub fn set_fault(&self, name: &str, action: FailAction) -> Result<(), FailpointParseError> {
        let name = canonical_name(name)?;
        info!(target: "pagestore::failpoint", name, action = %action, "Failpoint configured");
        self.entries.lock().entry(name).or_default().action = action;
        Ok(())
    }

    /// Disarm every failpoint. Hit counters are kept.
    pub fn clear_faults(&self) {
        for entry in self.entries.lock().values_mut() {
            entry.action = FailAction::Off;
        }
    }

    /// Apply a `name=action;name=action` configuration string
    ///
    /// The whole string is validated before anything is armed.
    pub fn configure(&self, config: &str) -> Result<(), FailpointParseError> {
        let mut parsed = Vec::new();
        for part in config.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, action) = part
                .split_once('=')
                .ok_or_else(|| FailpointParseError::MissingAction(part.to_string()))?;
            parsed.push((canonical_name(name.trim())?, action.parse::<FailAction>()?));
        }
        for (name, action) in parsed {
            self.set_fault(name, action)?;
        }
        Ok(())
    }

    /// Current action for a failpoint
    pub fn action(&self, name: &str) -> FailAction {
        self.entries
            .lock()
            .get(name)
            .map(|e| e.action)
            .unwrap_or_default()
    }

    /// How many times the hook has been reached
    pub fn hits(&self, name: &str) -> u64 {
        self.entries.lock().get(name).map(|e| e.hits).unwrap_or(0)
    }

    /// Run the action armed at `name`
    ///
    /// Sleeps happen without holding the registry lock. `Abort` does not
    /// return.
    pub fn fire(&self, name: &str) -> std::io::Result<()> {
        let action = {
            let mut entries = self.entries.lock();
            match canonical_name(name) {
                Ok(key) => {
                    let entry = entries.entry(key).or_default();
                    entry.hits += 1;
                    entry.action
                }
                Err(_) => FailAction::Off,
            }
        };

        match action {
            FailAction::Off => Ok(()),
            FailAction::Sleep(duration) => {
                info!(
                    target: "pagestore::failpoint",
                    name,
                    millis = duration.as_millis() as u64,
                    "Failpoint sleeping"
                );
                std::thread::sleep(duration);
                Ok(())
            }
            FailAction::Abort => {
                error!(target: "pagestore::failpoint", name, "Failpoint aborting process");
                std::process::abort()
            }
            FailAction::ReturnError => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("failpoint {} injected error", name),
            )),
        }
    }
}

fn canonical_name(name: &str) -> Result<&'static str, FailpointParseError> {
    KNOWN_FAILPOINTS
        .iter()
        .copied()
        .find(|known| *known == name)
        .ok_or_else(|| FailpointParseError::UnknownFailpoint(name.to_string()))
}

/// Failpoint configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailpointParseError {
    /// Name is not a recognised hook point
    #[error("Unknown failpoint: {0}")]
    UnknownFailpoint(String),

    /// `name=action` pair without `=`
    #[error("Missing action in failpoint setting: {0}")]
    MissingAction(String),

    /// Action not recognised
    #[error("Unknown failpoint action: {0}")]
    UnknownAction(String),

    /// `sleep(..)` without a millisecond count
    #[error("Invalid sleep action: {0}")]
    InvalidSleep(String),
}
