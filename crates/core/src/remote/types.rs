//! Types describing a remote install target.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A string that never shows up in logs or serialized output.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the underlying value.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// How to authenticate against a remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials<'a> {
    Password(&'a Secret),
    KeyFile(&'a PathBuf),
    /// Whatever the local ssh agent or default identity provides.
    Agent,
}

/// A second machine reached over ssh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default, skip_serializing)]
    pub password: Option<Secret>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,

    /// The remote `steamapps/common` directory.
    #[serde(default = "default_remote_library")]
    pub library_dir: String,
}

fn default_port() -> u16 {
    22
}

fn default_username() -> String {
    "deck".to_string()
}

fn default_remote_library() -> String {
    "/home/deck/.local/share/Steam/steamapps/common".to_string()
}

impl RemoteEndpoint {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        library_dir: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            password: None,
            private_key_path: None,
            library_dir: library_dir.into(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Secret::new(password));
        self
    }

    pub fn with_private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key_path = Some(path.into());
        self
    }

    /// A password wins over a key file when both are set.
    pub fn credentials(&self) -> Credentials<'_> {
        match (&self.password, &self.private_key_path) {
            (Some(password), _) if !password.expose().is_empty() => Credentials::Password(password),
            (_, Some(key)) => Credentials::KeyFile(key),
            _ => Credentials::Agent,
        }
    }

    /// `user@host` as used by ssh and rsync.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// An event reported while pushing a directory.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// A file is about to be written at this remote path.
    FileStarted { remote_path: String },
    /// Aggregate counters for the whole push.
    Progress {
        bytes_done: u64,
        bytes_total: u64,
        files_done: u64,
        files_total: u64,
        rate: Option<f64>,
    },
}

/// Result of a completed push.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushSummary {
    pub files: u64,
    pub bytes: u64,
}

/// Quote a path for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Join a remote directory and a relative component.
pub fn remote_join(base: &str, relative: &str) -> String {
    let base = base.trim_end_matches('/');
    let relative = relative.trim_start_matches("./").trim_start_matches('/');
    if base.is_empty() {
        format!("/{}", relative)
    } else if relative.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, relative)
    }
}

/// Parent of a remote path, if it has one.
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}
