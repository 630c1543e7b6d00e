//! Fail2ban-compatible security event log.
//!
//! One line per event, in a stable grep-friendly shape consumed by external
//! intrusion-prevention tooling:
//!
//! ```text
//! 2025-12-26 10:15:25 [SECURITY] RATE_LIMIT ip=192.168.1.100 count=150
//! 2025-12-26 10:15:26 [SECURITY] PATTERN_DETECTED ip=192.168.1.100 pattern=sqli path=/search/ matched="union select"
//! ```
//!
//! Field order and key names are a load-bearing contract. Free-text fields
//! are quote-escaped and length-capped so a malicious payload cannot break
//! the external parser's line framing. Writes never fail the request
//! pipeline: an unwritable sink degrades to stderr.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// Longest free-text fragment reproduced in a log line.
const MAX_FIELD_LEN: usize = 100;

/// Action the firewall took for a security event row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionTaken {
    Logged,
    Blocked,
    Banned,
}

/// Durable audit row mirroring a logged event, appended to the external
/// store for administrative listing. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub event_type: String,
    pub ip_address: String,
    pub path: String,
    pub method: String,
    pub user_agent: String,
    pub details: String,
    pub action_taken: ActionTaken,
    pub timestamp: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(
        event_type: &str,
        ip_address: &str,
        path: &str,
        method: &str,
        action_taken: ActionTaken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            ip_address: ip_address.to_string(),
            path: path.to_string(),
            method: method.to_string(),
            user_agent: String::new(),
            details: String::new(),
            action_taken,
            timestamp: Utc::now(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = sanitize(user_agent);
        self
    }

    pub fn with_details(mut self, details: &str) -> Self {
        self.details = sanitize(details);
        self
    }
}

enum Sink {
    File(File),
    Stderr,
}

pub struct SecurityLogger {
    sink: Mutex<Sink>,
}

impl SecurityLogger {
    /// Open an append-only log at `path`, creating parent directories as
    /// needed. Falls back to stderr if the path is unwritable.
    pub fn to_file(path: &Path) -> Self {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(dir);
            }
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Self {
                sink: Mutex::new(Sink::File(file)),
            },
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "security log unwritable, falling back to stderr"
                );
                Self::stderr()
            }
        }
    }

    pub fn stderr() -> Self {
        Self {
            sink: Mutex::new(Sink::Stderr),
        }
    }

    pub fn rate_limit(&self, ip: &str, count: u64, path: &str) {
        self.write_line(&format!("RATE_LIMIT ip={ip} count={count} path={path}"));
    }

    pub fn pattern_detected(&self, ip: &str, pattern: &str, path: &str, matched: &str) {
        self.write_line(&format!(
            "PATTERN_DETECTED ip={ip} pattern={pattern} path={path} matched=\"{}\"",
            sanitize(matched)
        ));
    }

    pub fn ip_banned(&self, ip: &str, reason: &str, duration_secs: Option<u64>) {
        let mut msg = format!("IP_BANNED ip={ip} reason={}", sanitize(reason));
        if let Some(duration) = duration_secs {
            msg.push_str(&format!(" duration={duration}s"));
        }
        self.write_line(&msg);
    }

    pub fn banned_access(&self, ip: &str, path: &str) {
        self.write_line(&format!("BANNED_ACCESS ip={ip} path={path}"));
    }

    pub fn data_leak_blocked(&self, ip: &str, pattern: &str, path: &str, matched: &str) {
        self.write_line(&format!(
            "DATA_LEAK_BLOCKED ip={ip} pattern={pattern} path={path} matched=\"{}\"",
            sanitize(matched)
        ));
    }

    /// Generic event: `EVENT_TYPE ip=<ip> key=value ...`.
    pub fn event(&self, event_type: &str, ip: &str, fields: &[(&str, &str)]) {
        let mut msg = format!("{event_type} ip={ip}");
        for (key, value) in fields {
            msg.push_str(&format!(" {key}={}", sanitize(value)));
        }
        self.write_line(&msg);
    }

    fn write_line(&self, msg: &str) {
        let line = format!("{} [SECURITY] {msg}", Utc::now().format("%Y-%m-%d %H:%M:%S"));
        let mut sink = match self.sink.lock() {
            Ok(sink) => sink,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Sink::File(file) = &mut *sink {
            if writeln!(file, "{line}").is_ok() {
                return;
            }
            tracing::warn!("security log write failed, degrading to stderr");
            *sink = Sink::Stderr;
        }
        eprintln!("{line}");
    }
}

/// Escape quotes and backslashes, flatten line breaks, and cap length so a
/// hostile fragment cannot smuggle extra log lines or unbounded text.
fn sanitize(value: &str) -> String {
    let mut out = String::with_capacity(value.len().min(MAX_FIELD_LEN));
    for c in value.chars().take(MAX_FIELD_LEN) {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' | '\r' => out.push(' '),
            _ => out.push(c),
        }
    }
    out
}
