//! Classification of git's free-text stderr.
//!
//! All substring knowledge about git's messages lives here so it can be
//! unit-tested in one place. Callers prefer direct filesystem checks (see
//! `retry::active_lock`) and only fall back to these lists.

/// What a failed command's stderr tells us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Another git process holds a lock; worth retrying.
    Contention,
    /// Remote access needs credentials that were not available.
    Credentials,
    Other,
}

const CONTENTION_MARKERS: &[&str] = &[
    "index.lock",
    ".lock': file exists",
    "another git process seems to be running",
    "cannot lock ref",
    "unable to lock",
    "could not lock config file",
    "failed to lock",
];

const CREDENTIAL_MARKERS: &[&str] = &[
    "could not read username",
    "could not read password",
    "authentication failed",
    "terminal prompts disabled",
    "permission denied (publickey",
    "host key verification failed",
    "invalid username or password",
    "could not read from remote repository",
];

const NOISE_PREFIXES: &[&str] = &[
    "hint:",
    "enumerating objects",
    "counting objects",
    "compressing objects",
    "receiving objects",
    "resolving deltas",
    "writing objects",
    "delta compression using",
    "updating files",
    "unpacking objects",
];

pub fn classify_failure(stderr: &str) -> FailureKind {
    let lower = stderr.to_lowercase();
    if CREDENTIAL_MARKERS.iter().any(|m| lower.contains(m)) {
        return FailureKind::Credentials;
    }
    if CONTENTION_MARKERS.iter().any(|m| lower.contains(m)) || lower.lines().any(creates_lock_file)
    {
        return FailureKind::Contention;
    }
    FailureKind::Other
}

/// "unable to create '<path>.lock'" on one line; other create failures are not contention.
fn creates_lock_file(line: &str) -> bool {
    line.split_once("unable to create '")
        .is_some_and(|(_, rest)| rest.contains(".lock'"))
}

/// Progress chatter and hints that never belong in an error message.
pub fn is_noise_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lower = trimmed.to_lowercase();
    let body = lower.strip_prefix("remote:").map(str::trim_start).unwrap_or(&lower);

    if NOISE_PREFIXES.iter().any(|p| body.starts_with(p)) {
        return true;
    }
    if body.starts_with("total ") && body.contains("(delta") {
        return true;
    }
    has_progress_percentage(body)
}

/// Matches "<label>:  42% (21/50)" style progress lines.
fn has_progress_percentage(line: &str) -> bool {
    line.split_whitespace().any(|token| {
        token
            .strip_suffix('%')
            .is_some_and(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
    }) && line.contains('(')
}

/// Stderr with noise removed, for error messages. Git rewrites progress lines
/// in place with `\r`, so both separators split lines.
pub fn error_text(stderr: &str) -> String {
    stderr
        .split(['\n', '\r'])
        .filter(|line| !is_noise_line(line))
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Actionable text for a credential failure.
pub fn credential_hint(stderr: &str) -> String {
    let lower = stderr.to_lowercase();
    if lower.contains("publickey") || lower.contains("host key") {
        "Load an SSH key into ssh-agent (SSH_AUTH_SOCK) or add the host to known_hosts.".to_string()
    } else {
        "Configure a credential helper (git config credential.helper) or use an access token."
            .to_string()
    }
}
