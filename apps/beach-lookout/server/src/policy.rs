//! Allow/deny gate in front of every command the gateway runs.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;

use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_ALLOWED: &[&str] = &["tail", "ls", "journalctl", "tcpdump"];

pub const DEFAULT_DENIED: &[&str] = &[
    "rm", "sudo", "su", "systemctl", "reboot", "shutdown", "halt", "poweroff", "mkfs", "dd",
    "kill", "chmod", "chown", "mv", "&&", "||", ";", "|",
];

/// Characters that let a single whitespace token smuggle in a second command.
const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '<', '>', '(', ')', '$', '`'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(Denial),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Denial {
    #[error("empty command")]
    Empty,
    #[error("blacklisted token: {0}")]
    Blacklisted(String),
    #[error("command not allowed: {0}")]
    NotAllowed(String),
}

impl Denial {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Denial::Empty => "empty",
            Denial::Blacklisted(_) => "blacklisted",
            Denial::NotAllowed(_) => "not_allowed",
        }
    }
}

/// The command policy. Constructed once at startup and shared by every
/// session; reads never block each other and the admin routes are the only
/// writers.
pub struct CommandPolicy {
    allowed: RwLock<BTreeSet<String>>,
    denied: RwLock<Vec<String>>,
}

impl CommandPolicy {
    pub fn new<A, D>(allowed: A, denied: D) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let allowed = allowed
            .into_iter()
            .map(Into::into)
            .filter(|cmd: &String| !cmd.trim().is_empty())
            .collect();
        let mut denied: Vec<String> = denied
            .into_iter()
            .map(|entry| entry.into().trim().to_lowercase())
            .filter(|entry| !entry.is_empty())
            .collect();
        denied.sort();
        denied.dedup();
        Self {
            allowed: RwLock::new(allowed),
            denied: RwLock::new(denied),
        }
    }

    pub fn evaluate(&self, raw: &str) -> Verdict {
        if raw.trim().is_empty() {
            return Verdict::Deny(Denial::Empty);
        }
        // A line break ends a command for the shell just like `;` does.
        let normalized = raw
            .trim()
            .to_lowercase()
            .replace("\r\n", " ; ")
            .replace(['\r', '\n'], " ; ");

        // Deny first so an allow-listed base command can never carry a
        // blacklisted token through.
        {
            let denied = self.denied.read();
            for token in normalized.split_whitespace() {
                if let Some(hit) = denied_match(&denied, token) {
                    return Verdict::Deny(Denial::Blacklisted(hit.to_string()));
                }
            }
        }

        let base = match raw.split_whitespace().next() {
            Some(base) => base,
            None => return Verdict::Deny(Denial::Empty),
        };
        if !self.allowed.read().contains(base) {
            return Verdict::Deny(Denial::NotAllowed(base.to_string()));
        }

        Verdict::Allow
    }

    /// Allowed base commands, sorted.
    pub fn allowed_commands(&self) -> Vec<String> {
        self.allowed.read().iter().cloned().collect()
    }

    pub fn denied_tokens(&self) -> Vec<String> {
        self.denied.read().clone()
    }

    /// Returns `false` when the command was already allowed.
    pub fn allow(&self, command: &str) -> bool {
        let command = command.trim();
        if command.is_empty() || command.contains(char::is_whitespace) {
            return false;
        }
        self.allowed.write().insert(command.to_string())
    }

    /// Returns `false` when the command was not allowed to begin with.
    pub fn revoke(&self, command: &str) -> bool {
        self.allowed.write().remove(command.trim())
    }
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED.iter().copied(), DEFAULT_DENIED.iter().copied())
    }
}

impl fmt::Debug for CommandPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandPolicy")
            .field("allowed", &*self.allowed.read())
            .field("denied", &*self.denied.read())
            .finish()
    }
}

fn denied_match<'a>(denied: &'a [String], token: &str) -> Option<&'a str> {
    for entry in denied {
        if entry == token {
            return Some(entry);
        }
        if is_operator(entry) {
            if token.contains(entry.as_str()) {
                return Some(entry);
            }
        } else if token
            .split(SHELL_METACHARACTERS)
            .any(|fragment| fragment == entry)
        {
            return Some(entry);
        }
    }
    None
}

fn is_operator(entry: &str) -> bool {
    entry.chars().all(|ch| SHELL_METACHARACTERS.contains(&ch))
}

#[derive(Debug, Error)]
pub enum PolicyFileError {
    #[error("failed to read policy file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse policy file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
struct PolicySection {
    #[serde(default)]
    allowed_cmds: Option<Vec<String>>,
    #[serde(default)]
    blacklist_cmds: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct PolicyDocument {
    #[serde(default)]
    websocket: Option<PolicySection>,
    #[serde(flatten)]
    flat: PolicySection,
}

impl CommandPolicy {
    /// Loads `{"websocket": {"allowed_cmds": [..], "blacklist_cmds": [..]}}`
    /// (or the same keys at the top level). A missing list falls back to the
    /// built-in default for that list.
    pub fn from_file(path: &Path) -> Result<Self, PolicyFileError> {
        let display = path.display().to_string();
        let contents = fs::read_to_string(path).map_err(|source| PolicyFileError::Read {
            path: display.clone(),
            source,
        })?;
        Self::from_json(&contents).map_err(|source| PolicyFileError::Parse {
            path: display,
            source,
        })
    }

    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        let document: PolicyDocument = serde_json::from_str(contents)?;
        let section = match document.websocket {
            Some(section) => section,
            None => document.flat,
        };
        let allowed = section
            .allowed_cmds
            .unwrap_or_else(|| DEFAULT_ALLOWED.iter().map(|s| s.to_string()).collect());
        let denied = section
            .blacklist_cmds
            .unwrap_or_else(|| DEFAULT_DENIED.iter().map(|s| s.to_string()).collect());
        Ok(Self::new(allowed, denied))
    }
}
