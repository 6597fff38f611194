//! Per-invocation environment contract.
//!
//! - locale pinned so output parsing is deterministic
//! - credential and passphrase prompts suppressed unless the invocation wants them
//! - `SSH_AUTH_SOCK` passed through from the host
//! - `GPG_TTY` filled in when attached to a terminal so commit signing can prompt
//! - `GIT_OPTIONAL_LOCKS=0` for reads so they never take `index.lock`

use std::sync::OnceLock;

use sha2::{Digest, Sha256};

/// Variables whose values change which credentials git ends up using.
const CREDENTIAL_VARS: &[&str] = &[
    "SSH_AUTH_SOCK",
    "GIT_SSH",
    "GIT_SSH_COMMAND",
    "GIT_ASKPASS",
    "SSH_ASKPASS",
    "GIT_CONFIG_GLOBAL",
    "GIT_CONFIG_SYSTEM",
    "HOME",
];

pub fn base_environment(interactive: bool, read_only: bool) -> Vec<(String, String)> {
    let mut env = vec![
        ("LC_ALL".to_string(), "C".to_string()),
        ("LANGUAGE".to_string(), "C".to_string()),
    ];

    if !interactive {
        env.push(("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()));
        env.push(("GCM_INTERACTIVE".to_string(), "never".to_string()));
        env.push(("SSH_ASKPASS_REQUIRE".to_string(), "never".to_string()));
        if std::env::var_os("GIT_SSH_COMMAND").is_none() && std::env::var_os("GIT_SSH").is_none() {
            env.push((
                "GIT_SSH_COMMAND".to_string(),
                "ssh -o BatchMode=yes".to_string(),
            ));
        }
    }

    if read_only {
        env.push(("GIT_OPTIONAL_LOCKS".to_string(), "0".to_string()));
    }

    if let Ok(sock) = std::env::var("SSH_AUTH_SOCK") {
        env.push(("SSH_AUTH_SOCK".to_string(), sock));
    }

    if std::env::var_os("GPG_TTY").is_none() {
        if let Some(tty) = terminal_name() {
            env.push(("GPG_TTY".to_string(), tty.clone()));
        }
    }

    env
}

/// SHA-256 over the credential-relevant environment as git would see it.
pub fn credential_fingerprint(overrides: &[(String, String)]) -> String {
    let mut hasher = Sha256::new();
    for var in CREDENTIAL_VARS {
        let value = overrides
            .iter()
            .rev()
            .find(|(k, _)| k == var)
            .map(|(_, v)| v.clone())
            .or_else(|| std::env::var(var).ok())
            .unwrap_or_default();
        hasher.update(var.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Terminal attached to stdin, resolved once per process.
fn terminal_name() -> Option<&'static String> {
    static TTY: OnceLock<Option<String>> = OnceLock::new();
    TTY.get_or_init(detect_terminal).as_ref()
}

#[cfg(unix)]
fn detect_terminal() -> Option<String> {
    use std::io::IsTerminal;

    if !std::io::stdin().is_terminal() {
        return None;
    }
    // SAFETY: ttyname returns a pointer into a static buffer or null; it is
    // copied out immediately and only called once per process.
    let ptr = unsafe { libc::ttyname(libc::STDIN_FILENO) };
    if ptr.is_null() {
        return None;
    }
    let name = unsafe { std::ffi::CStr::from_ptr(ptr) };
    Some(name.to_string_lossy().into_owned())
}

#[cfg(not(unix))]
fn detect_terminal() -> Option<String> {
    None
}
