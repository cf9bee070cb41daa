//! Session configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::codec::DEFAULT_MAX_LINE_BYTES;
use crate::bridge::protocol::PayloadEncoding;
use crate::supervisor::{
    CommandSpawner, DaemonSpawner, LaunchSpec, SERVE_ARG, SupervisorOptions,
};

/// Per-request timeout used by `format_default`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest request text accepted (16 MiB).
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

/// Time allowed for stdout to drain after the daemon exits.
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_millis(250);

pub const EXECUTABLE_ENV: &str = "RD_FORMAT_PATH";
pub const ENCODING_ENV: &str = "FORMATD_ENCODING";
pub const TIMEOUT_ENV: &str = "FORMATD_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("RD_FORMAT_PATH is not set")]
    MissingExecutable,
    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

pub struct SessionConfig {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub encoding: PayloadEncoding,
    /// Default request timeout. Zero disables it.
    pub timeout: Duration,
    pub max_request_bytes: usize,
    pub max_line_bytes: usize,
    pub exit_grace: Duration,
    pub spawner: Arc<dyn DaemonSpawner>,
}

impl SessionConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: vec![SERVE_ARG.to_string()],
            envs: Vec::new(),
            encoding: PayloadEncoding::default(),
            timeout: DEFAULT_TIMEOUT,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            exit_grace: DEFAULT_EXIT_GRACE,
            spawner: Arc::new(CommandSpawner),
        }
    }

    /// Build from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    ///
    /// Empty or whitespace-only values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let executable = get(EXECUTABLE_ENV).ok_or(ConfigError::MissingExecutable)?;
        let mut config = Self::new(executable);

        if let Some(encoding) = get(ENCODING_ENV) {
            config.encoding = encoding.parse().map_err(|reason| ConfigError::Invalid {
                var: ENCODING_ENV,
                reason,
            })?;
        }

        if let Some(ms) = get(TIMEOUT_ENV) {
            let ms: u64 = ms.parse().map_err(|e| ConfigError::Invalid {
                var: TIMEOUT_ENV,
                reason: format!("{e}"),
            })?;
            config.timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }

    pub fn with_encoding(mut self, encoding: PayloadEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_request_bytes(mut self, max: usize) -> Self {
        self.max_request_bytes = max;
        self
    }

    pub fn with_max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max;
        self
    }

    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    /// Append an argument after `--serve`.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn DaemonSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn effective_timeout(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            executable: self.executable.clone(),
            args: self.args.clone(),
            envs: self.envs.clone(),
        }
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            max_line_bytes: self.max_line_bytes,
            exit_grace: self.exit_grace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = SessionConfig::new("/opt/rd-format/rd-format");
        assert_eq!(config.args, vec!["--serve".to_string()]);
        assert_eq!(config.encoding, PayloadEncoding::Text);
        assert_eq!(config.effective_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.max_request_bytes, 16 * 1024 * 1024);
        assert_eq!(config.exit_grace, Duration::from_millis(250));
    }

    #[test]
    fn from_lookup_reads_all_vars() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("RD_FORMAT_PATH", " /usr/bin/rd-format "),
            ("FORMATD_ENCODING", "b64"),
            ("FORMATD_TIMEOUT_MS", "2500"),
        ]))
        .unwrap();
        assert_eq!(config.executable, PathBuf::from("/usr/bin/rd-format"));
        assert_eq!(config.encoding, PayloadEncoding::B64);
        assert_eq!(config.timeout, Duration::from_millis(2500));
    }

    #[test]
    fn blank_executable_is_missing() {
        let err = SessionConfig::from_lookup(lookup(&[("RD_FORMAT_PATH", "   ")]))
            .err()
            .unwrap();
        assert_eq!(err, ConfigError::MissingExecutable);
        assert_eq!(err.to_string(), "RD_FORMAT_PATH is not set");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = SessionConfig::from_lookup(lookup(&[
            ("RD_FORMAT_PATH", "/x"),
            ("FORMATD_ENCODING", "utf16"),
        ]))
        .err()
        .unwrap();
        assert!(matches!(err, ConfigError::Invalid { var: "FORMATD_ENCODING", .. }));

        let err = SessionConfig::from_lookup(lookup(&[
            ("RD_FORMAT_PATH", "/x"),
            ("FORMATD_TIMEOUT_MS", "soon"),
        ]))
        .err()
        .unwrap();
        assert!(matches!(err, ConfigError::Invalid { var: "FORMATD_TIMEOUT_MS", .. }));
    }

    #[test]
    fn zero_timeout_disables_it() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("RD_FORMAT_PATH", "/x"),
            ("FORMATD_TIMEOUT_MS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.effective_timeout(), None);
    }

    #[test]
    fn launch_spec_carries_args_and_env() {
        let spec = SessionConfig::new("/x")
            .with_arg("--verbose")
            .with_env("FORMATD_ECHO_MODE", "upper")
            .launch_spec();
        assert_eq!(spec.args, vec!["--serve".to_string(), "--verbose".to_string()]);
        assert_eq!(
            spec.envs,
            vec![("FORMATD_ECHO_MODE".to_string(), "upper".to_string())]
        );
    }
}
