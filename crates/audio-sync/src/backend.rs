//! Output route auto-detection.
//!
//! On Linux a running shared audio server (PipeWire by default) means the device has
//! to be reached through it; otherwise playback goes straight to the first hardware
//! device. The choice is published through an environment variable that the device
//! binding reads when it picks an output.

use std::process::{Command, Stdio};
use std::sync::OnceLock;

use crate::config::BackendConfig;

/// Where output should be routed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendChoice {
    /// Through a shared audio server, with its device identifier.
    Shared(String),
    /// Directly to hardware, with its device identifier.
    Direct(String),
    /// Detection does not apply; the host default is used untouched.
    HostDefault,
}

impl BackendChoice {
    pub fn device_id(&self) -> Option<&str> {
        match self {
            BackendChoice::Shared(id) | BackendChoice::Direct(id) => Some(id),
            BackendChoice::HostDefault => None,
        }
    }

    /// Publish the device identifier through `env_var`.
    ///
    /// No-op for [`BackendChoice::HostDefault`].
    pub fn apply(&self, env_var: &str) {
        let Some(id) = self.device_id() else {
            return;
        };
        // SAFETY: written at most once per process, from `detect_cached` during
        // session construction on the caller's thread, before any output opened by
        // this crate reads it. The host must not touch the environment from other
        // threads while a session is being constructed.
        unsafe { std::env::set_var(env_var, id) };
        tracing::debug!(env_var, device = id, "output route applied");
    }
}

/// Probe for a running shared audio server.
///
/// Any probing failure falls through to [`BackendChoice::Direct`].
pub fn detect(config: &BackendConfig) -> BackendChoice {
    if !cfg!(target_os = "linux") || !config.enabled {
        tracing::debug!("output route detection skipped");
        return BackendChoice::HostDefault;
    }

    if shared_server_running(config) {
        tracing::info!(
            server = %config.shared_server,
            device = %config.shared_device,
            "shared audio server detected"
        );
        return BackendChoice::Shared(config.shared_device.clone());
    }

    tracing::info!(
        device = %config.direct_device,
        "no shared audio server; using direct output"
    );
    BackendChoice::Direct(config.direct_device.clone())
}

static CHOICE: OnceLock<BackendChoice> = OnceLock::new();

/// The route chosen by [`detect_cached`], if it has run.
pub fn cached() -> Option<BackendChoice> {
    CHOICE.get().cloned()
}

/// [`detect`] once per process, applying the result before returning it.
///
/// Later calls return the first result regardless of `config`.
pub fn detect_cached(config: &BackendConfig) -> BackendChoice {
    CHOICE
        .get_or_init(|| {
            let choice = detect(config);
            choice.apply(&config.env_var);
            choice
        })
        .clone()
}

fn shared_server_running(config: &BackendConfig) -> bool {
    let output = Command::new(&config.probe_program)
        .arg("-f")
        .arg(&config.shared_server)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output();
    match output {
        Ok(out) => out.status.success() && !String::from_utf8_lossy(&out.stdout).trim().is_empty(),
        Err(e) => {
            tracing::debug!(
                program = %config.probe_program.display(),
                "shared server check failed: {e}"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::path::PathBuf;

    fn config_with_probe(program: &str) -> BackendConfig {
        BackendConfig {
            probe_program: PathBuf::from(program),
            ..BackendConfig::default()
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn missing_probe_tool_falls_back_to_direct() {
        let choice = detect(&config_with_probe("/nonexistent/pgrep"));
        assert_eq!(choice, BackendChoice::Direct("plughw:0,0".to_string()));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn empty_match_output_is_not_found() {
        // `true` exits 0 but prints nothing.
        let choice = detect(&config_with_probe("true"));
        assert_eq!(choice, BackendChoice::Direct("plughw:0,0".to_string()));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn matching_process_selects_shared() {
        // `echo` exits 0 and prints its arguments, like a pgrep hit.
        let choice = detect(&config_with_probe("echo"));
        assert_eq!(choice, BackendChoice::Shared("pipewire".to_string()));
    }

    #[test]
    fn disabled_detection_uses_host_default() {
        let cfg = BackendConfig {
            enabled: false,
            ..BackendConfig::default()
        };
        assert_eq!(detect(&cfg), BackendChoice::HostDefault);
    }

    #[test]
    #[serial]
    fn apply_sets_environment() {
        let var = "AUDIO_SYNC_TEST_ROUTE";
        BackendChoice::Direct("plughw:1,0".to_string()).apply(var);
        assert_eq!(std::env::var(var).unwrap(), "plughw:1,0");
        unsafe { std::env::remove_var(var) };
    }

    #[test]
    #[serial]
    fn host_default_leaves_environment_alone() {
        let var = "AUDIO_SYNC_TEST_ROUTE_UNSET";
        BackendChoice::HostDefault.apply(var);
        assert!(std::env::var(var).is_err());
    }
}
