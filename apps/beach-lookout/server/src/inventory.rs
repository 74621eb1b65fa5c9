use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("failed to read inventory {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("inventory line {line}: invalid port in target {target:?}")]
    InvalidPort { line: usize, target: String },
    #[error("inventory line {line}: invalid timeout {value:?}")]
    InvalidTimeout { line: usize, value: String },
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    PrivateKey(PathBuf),
}

// Hand-written so passwords never reach a log line.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            Credential::PrivateKey(path) => f.debug_tuple("PrivateKey").field(path).finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credential: Credential,
    pub connect_timeout: Option<Duration>,
}

/// Remote hosts the gateway may dial, keyed by host name without port.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    hosts: HashMap<String, HostEntry>,
}

impl Inventory {
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let contents = fs::read_to_string(path).map_err(|source| InventoryError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, InventoryError> {
        let mut hosts = HashMap::new();
        for (index, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
                continue;
            }
            if let Some(entry) = parse_line(index + 1, line)? {
                hosts.insert(entry.host.clone(), entry);
            }
        }
        Ok(Self { hosts })
    }

    pub fn get(&self, host: &str) -> Option<&HostEntry> {
        self.hosts.get(host)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

fn parse_line(line_no: usize, line: &str) -> Result<Option<HostEntry>, InventoryError> {
    let mut target = None;
    let mut user = None;
    let mut password = None;
    let mut key = None;
    let mut timeout = None;

    for field in line.split_whitespace() {
        let Some((name, value)) = field.split_once('=') else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        match name.to_ascii_lowercase().as_str() {
            "target" => target = Some(value),
            "user" => user = Some(value),
            "password" => password = Some(value),
            "key" => key = Some(value),
            "timeout" => timeout = Some(value),
            _ => {}
        }
    }

    let credential = match (key, password) {
        (Some(key), _) => Some(Credential::PrivateKey(PathBuf::from(key))),
        (None, Some(password)) => Some(Credential::Password(password.to_string())),
        (None, None) => None,
    };

    let (Some(target), Some(user), Some(credential)) = (target, user, credential) else {
        // Only the first token is logged; the rest may carry a password.
        let head = line.split_whitespace().next().unwrap_or_default();
        warn!(line = line_no, first_field = %head, "skipping incomplete inventory line");
        return Ok(None);
    };

    let (host, port) = split_target(line_no, target)?;
    let connect_timeout = match timeout {
        Some(value) => {
            let secs: u64 = value.parse().map_err(|_| InventoryError::InvalidTimeout {
                line: line_no,
                value: value.to_string(),
            })?;
            Some(Duration::from_secs(secs))
        }
        None => None,
    };

    Ok(Some(HostEntry {
        host,
        port,
        user: user.to_string(),
        credential,
        connect_timeout,
    }))
}

fn split_target(line_no: usize, target: &str) -> Result<(String, u16), InventoryError> {
    match target.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            let port = port.parse().map_err(|_| InventoryError::InvalidPort {
                line: line_no,
                target: target.to_string(),
            })?;
            Ok((host.to_string(), port))
        }
        _ => Ok((target.to_string(), DEFAULT_SSH_PORT)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
# edge routers
[routers]
target=10.0.0.1 user=ops password=hunter2
target=10.0.0.2:2222 user=ops key=/etc/lookout/id_ed25519 password=ignored timeout=3

target=10.0.0.3 user=ops
not-a-pair target=10.0.0.4 user=ops key=/k
"#;

    #[test_timeout::timeout]
    fn parses_hosts_and_skips_noise() {
        let inventory = Inventory::parse(SAMPLE).unwrap();
        assert_eq!(inventory.len(), 3);

        let first = inventory.get("10.0.0.1").unwrap();
        assert_eq!(first.port, DEFAULT_SSH_PORT);
        assert_eq!(first.user, "ops");
        assert_eq!(first.credential, Credential::Password("hunter2".into()));
        assert_eq!(first.connect_timeout, None);

        let second = inventory.get("10.0.0.2").unwrap();
        assert_eq!(second.port, 2222);
        assert_eq!(
            second.credential,
            Credential::PrivateKey(PathBuf::from("/etc/lookout/id_ed25519"))
        );
        assert_eq!(second.connect_timeout, Some(Duration::from_secs(3)));

        assert!(inventory.get("10.0.0.3").is_none());
        assert!(inventory.get("10.0.0.4").is_some());
    }

    #[test_timeout::timeout]
    fn rejects_malformed_values() {
        let err = Inventory::parse("target=h:abc user=u password=p").unwrap_err();
        assert!(matches!(err, InventoryError::InvalidPort { line: 1, .. }));

        let err = Inventory::parse("\ntarget=h user=u password=p timeout=soon").unwrap_err();
        assert!(matches!(err, InventoryError::InvalidTimeout { line: 2, .. }));
    }

    #[test_timeout::timeout]
    fn passwords_are_redacted_in_debug_output() {
        let inventory = Inventory::parse("target=db user=root password=s3cret").unwrap();
        let rendered = format!("{inventory:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test_timeout::timeout]
    fn loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "target=app01 user=deploy key=/keys/app01").unwrap();
        let inventory = Inventory::load(file.path()).unwrap();
        assert!(!inventory.is_empty());
        assert_eq!(inventory.get("app01").unwrap().user, "deploy");

        assert!(matches!(
            Inventory::load(Path::new("/nonexistent/inventory")),
            Err(InventoryError::Read { .. })
        ));
    }
}
