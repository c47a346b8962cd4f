//! Credential store for WebDAV Basic Authentication
//! Loads `username:bcrypt-hash` records from an htpasswd-style file

use crate::error::CredentialError;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// bcrypt cost used when hashing new passwords
pub const DEFAULT_COST: u32 = bcrypt::DEFAULT_COST;

/// A single username and its password hash
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password_hash: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password_hash: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password_hash: password_hash.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Immutable username -> hash mapping, read once at startup
pub struct CredentialStore {
    users: HashMap<String, Credential>,
}

impl CredentialStore {
    /// Load the credential file at `path`
    ///
    /// Lines are trimmed; blank lines and lines starting with `#` are skipped.
    /// Every other line must hold exactly two `:`-separated fields. A username
    /// that appears twice keeps its last hash.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CredentialError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| CredentialError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut records = Vec::new();
        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split(':').map(str::trim_start).collect();
            if fields.len() != 2 {
                return Err(CredentialError::FieldCount {
                    path: path.to_path_buf(),
                    line: index + 1,
                    fields: fields.len(),
                });
            }
            if fields[0].is_empty() {
                return Err(CredentialError::EmptyUsername {
                    path: path.to_path_buf(),
                    line: index + 1,
                });
            }

            records.push(Credential::new(fields[0], fields[1]));
        }

        let store = Self::from_records(records);
        info!(path = %path.display(), users = store.len(), "Loaded credentials");
        Ok(store)
    }

    /// Build a store from already-parsed records (last duplicate wins)
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = Credential>,
    {
        let mut users = HashMap::new();
        for record in records {
            if users.insert(record.username.clone(), record).is_some() {
                debug!("Duplicate credential record, keeping the last one");
            }
        }
        Self { users }
    }

    /// Check a username/password pair against the stored bcrypt hash
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        let Some(credential) = self.users.get(username) else {
            return false;
        };

        match bcrypt::verify(password, &credential.password_hash) {
            Ok(valid) => valid,
            Err(e) => {
                warn!(user = %username, error = %e, "Stored password hash is unusable");
                false
            }
        }
    }

    /// Whether a username is present
    pub fn contains(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    /// Known usernames, sorted
    pub fn usernames(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.users.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("users", &self.users.len())
            .finish()
    }
}

/// Hash a password with bcrypt at the given cost
pub fn hash_password(password: &str, cost: u32) -> Result<String, CredentialError> {
    Ok(bcrypt::hash(password, cost)?)
}

/// Render a credential file record
pub fn format_record(username: &str, password_hash: &str) -> String {
    format!("{}:{}", username, password_hash)
}

/// Insert or replace the record for `username` in the credential file
///
/// Comments and other records are kept as they are. Returns `true` when an
/// existing record was replaced.
pub fn upsert_record<P: AsRef<Path>>(
    path: P,
    username: &str,
    password_hash: &str,
) -> Result<bool, CredentialError> {
    let path = path.as_ref();
    let record = format_record(username, password_hash);
    let mut replaced = false;

    let mut lines: Vec<String> = read_lines(path)?
        .into_iter()
        .map(|line| {
            if record_owner(&line) == Some(username) {
                replaced = true;
                record.clone()
            } else {
                line
            }
        })
        .collect();

    if !replaced {
        lines.push(record);
    }

    write_lines(path, &lines)?;
    Ok(replaced)
}

/// Delete every record for `username`; returns `true` if one was found
pub fn remove_record<P: AsRef<Path>>(path: P, username: &str) -> Result<bool, CredentialError> {
    let path = path.as_ref();
    let lines = read_lines(path)?;
    let before = lines.len();

    let kept: Vec<String> = lines
        .into_iter()
        .filter(|line| record_owner(line) != Some(username))
        .collect();

    if kept.len() == before {
        return Ok(false);
    }
    write_lines(path, &kept)?;
    Ok(true)
}

/// Username of a record line, `None` for comments and blank lines
fn record_owner(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    trimmed.split(':').next()
}

fn read_lines(path: &Path) -> Result<Vec<String>, CredentialError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(source) => Err(CredentialError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_lines(path: &Path, lines: &[String]) -> Result<(), CredentialError> {
    let mut output = lines.join("\n");
    output.push('\n');
    fs::write(path, output).map_err(|source| CredentialError::Write {
        path: path.to_path_buf(),
        source,
    })
}
