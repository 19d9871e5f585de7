//! Error taxonomy for the daemon core (§7)
//!
//! Each subsystem gets its own `thiserror` enum; [`StatusCode`] is the
//! wire-facing vocabulary surfaced to frontends as `status-message`
//! events, and [`DaemonError`] is the top-level type whose
//! [`DaemonError::exit_code`] backs the fatal-error process exit codes
//! from §7(f).

use thiserror::Error;

/// Errors raised while validating or resolving a share/control-channel path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path contains a null byte")]
    NullByte,

    #[error("path too long: {len} bytes (max {max})")]
    TooLong { len: usize, max: usize },

    #[error("filename too long: {len} bytes (max {max})")]
    FilenameTooLong { len: usize, max: usize },

    #[error("absolute paths are not allowed")]
    Absolute,

    #[error("parent directory (..) not allowed")]
    ParentDir,

    #[error("path escapes the mountpoint")]
    Escapes,

    #[error("empty filename")]
    EmptyFilename,

    #[error("filename contains a path separator")]
    FilenameHasSeparator,

    #[error("unknown virtual root: {0}")]
    UnknownVirtualRoot(String),
}

/// Errors in NMDC lock/key/escape handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NmdcError {
    #[error("lock too short to derive a key ({0} bytes)")]
    LockTooShort(usize),

    #[error("malformed command: {0}")]
    Malformed(String),

    #[error("unsupported legacy encoding: {0}")]
    UnsupportedEncoding(String),
}

/// Errors loading/saving the daemon's TOML configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("could not determine a config directory for this platform")]
    NoConfigDir,
}

/// Wire-level status vocabulary (§6, `status-message` event payloads).
///
/// This is deliberately coarse — frontends display the accompanying
/// human-readable text; the code exists so they can group/filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    FileNotAvailable,
    DirectoryNotAvailable,
    ConfigInvalid,
    ProtocolViolation,
    IntegrityRepaired,
    BothPassive,
    TransferAborted,
}

/// Fatal, process-ending errors (§7(f)).
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("cannot open working directory {path}: {source}")]
    WorkingDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("another instance is already running (pid {0})")]
    AlreadyRunning(i32),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("control socket bind failed: {0}")]
    ControlBind(std::io::Error),
}

impl DaemonError {
    /// Distinct non-zero exit codes per failure class, so supervisors
    /// (launchd/systemd/the CLI frontend) can distinguish causes
    /// without parsing stderr.
    pub fn exit_code(&self) -> i32 {
        match self {
            DaemonError::WorkingDirectory { .. } => 1,
            DaemonError::AlreadyRunning(_) => 2,
            DaemonError::Config(_) => 3,
            DaemonError::ControlBind(_) => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let errs: Vec<DaemonError> = vec![
            DaemonError::WorkingDirectory {
                path: "/tmp/x".into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "x"),
            },
            DaemonError::AlreadyRunning(123),
            DaemonError::ControlBind(std::io::Error::new(std::io::ErrorKind::Other, "x")),
        ];
        let codes: std::collections::HashSet<i32> = errs.iter().map(|e| e.exit_code()).collect();
        assert_eq!(codes.len(), errs.len());
    }
}
