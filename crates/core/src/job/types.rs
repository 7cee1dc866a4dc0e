//! Job identity and construction.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use super::error::JobError;
use crate::config::LibraryConfig;
use crate::remote::{remote_join, RemoteEndpoint};

/// Identifier handed out by the queue for one submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Where the installed content ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Content lands on the machine running the pipeline.
    Local,
    /// Content is staged locally, then pushed to a second machine.
    Remote,
}

/// One content unit of a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepotItem {
    pub depot_id: String,
    pub manifest_id: String,
    /// Local manifest file handed to the download tool.
    pub manifest_path: PathBuf,
    #[serde(skip_serializing)]
    pub decryption_key: String,
    /// Declared size, used to weight progress across items.
    #[serde(default)]
    pub size_bytes: u64,
}

impl DepotItem {
    pub fn new(
        depot_id: impl Into<String>,
        manifest_id: impl Into<String>,
        manifest_path: impl Into<PathBuf>,
        decryption_key: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            depot_id: depot_id.into(),
            manifest_id: manifest_id.into(),
            manifest_path: manifest_path.into(),
            decryption_key: decryption_key.into(),
            size_bytes,
        }
    }
}

/// An install request as submitted by a caller.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub app_id: String,
    pub display_name: String,
    pub depot_items: Vec<DepotItem>,
    pub topology: Topology,
    #[serde(default)]
    pub remote_endpoint: Option<RemoteEndpoint>,
    #[serde(default)]
    pub app_token: Option<String>,
    /// Run the patch stage when a patch tool is configured.
    #[serde(default = "default_patch")]
    pub patch: bool,
    /// Overrides the folder name derived from the display name.
    #[serde(default)]
    pub install_folder: Option<String>,
}

fn default_patch() -> bool {
    true
}

impl JobSpec {
    pub fn new(
        app_id: impl Into<String>,
        display_name: impl Into<String>,
        depot_items: Vec<DepotItem>,
        topology: Topology,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            display_name: display_name.into(),
            depot_items,
            topology,
            remote_endpoint: None,
            app_token: None,
            patch: true,
            install_folder: None,
        }
    }

    pub fn with_remote(mut self, endpoint: RemoteEndpoint) -> Self {
        self.remote_endpoint = Some(endpoint);
        self
    }

    pub fn with_app_token(mut self, token: impl Into<String>) -> Self {
        self.app_token = Some(token.into());
        self
    }

    pub fn with_patch(mut self, patch: bool) -> Self {
        self.patch = patch;
        self
    }
}

/// Target of an install: a local directory or a path on a remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstallTarget {
    Local { dir: PathBuf },
    Remote { endpoint: RemoteEndpoint, dir: String },
}

impl InstallTarget {
    pub fn display(&self) -> String {
        match self {
            Self::Local { dir } => dir.display().to_string(),
            Self::Remote { endpoint, dir } => format!("{}:{}", endpoint.destination(), dir),
        }
    }
}

/// A fully resolved, immutable unit of installation work.
#[derive(Debug, Clone, Serialize)]
pub struct InstallJob {
    pub id: JobId,
    pub app_id: String,
    pub display_name: String,
    pub depot_items: Vec<DepotItem>,
    pub staging_dir: PathBuf,
    pub target: InstallTarget,
    /// Folder name under the library directory.
    pub install_folder: String,
    #[serde(skip_serializing)]
    pub app_token: Option<String>,
    pub patch: bool,
}

impl InstallJob {
    /// Resolves a spec against the library layout.
    ///
    /// Remote jobs without their own endpoint use `default_remote`.
    pub fn from_spec(
        spec: JobSpec,
        library: &LibraryConfig,
        default_remote: Option<&RemoteEndpoint>,
    ) -> Result<Self, JobError> {
        if spec.app_id.trim().is_empty() {
            return Err(JobError::invalid("app_id cannot be empty"));
        }
        if !is_plain_id(&spec.app_id) {
            return Err(JobError::invalid(format!(
                "app_id {:?} may only contain letters, digits, '-' and '_'",
                spec.app_id
            )));
        }
        if spec.depot_items.is_empty() {
            return Err(JobError::invalid("a job needs at least one depot item"));
        }
        if let Some(item) = spec
            .depot_items
            .iter()
            .find(|item| !is_plain_id(&item.depot_id) || !is_plain_id(&item.manifest_id))
        {
            return Err(JobError::invalid(format!(
                "depot {:?} has a malformed depot or manifest id",
                item.depot_id
            )));
        }

        let install_folder = spec
            .install_folder
            .as_deref()
            .map(sanitize_folder_name)
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| folder_name(&spec.display_name, &spec.app_id));

        let target = match (spec.topology, spec.remote_endpoint) {
            (Topology::Local, None) => InstallTarget::Local {
                dir: library.library_dir.join(&install_folder),
            },
            (Topology::Local, Some(_)) => {
                return Err(JobError::invalid("a local job cannot name a remote endpoint"))
            }
            (Topology::Remote, endpoint) => {
                let endpoint = endpoint.or_else(|| default_remote.cloned()).ok_or_else(|| {
                    JobError::invalid("a remote job needs a remote endpoint")
                })?;
                let dir = remote_join(&endpoint.library_dir, &install_folder);
                InstallTarget::Remote { endpoint, dir }
            }
        };

        Ok(Self {
            id: JobId::new(),
            staging_dir: library
                .staging_root
                .join(format!("install_{}", spec.app_id)),
            app_id: spec.app_id,
            display_name: spec.display_name,
            depot_items: spec.depot_items,
            target,
            install_folder,
            app_token: spec.app_token,
            patch: spec.patch,
        })
    }

    pub fn topology(&self) -> Topology {
        match self.target {
            InstallTarget::Local { .. } => Topology::Local,
            InstallTarget::Remote { .. } => Topology::Remote,
        }
    }

    pub fn remote_endpoint(&self) -> Option<&RemoteEndpoint> {
        match &self.target {
            InstallTarget::Remote { endpoint, .. } => Some(endpoint),
            InstallTarget::Local { .. } => None,
        }
    }

    /// Sum of the declared depot sizes.
    pub fn declared_bytes(&self) -> u64 {
        self.depot_items.iter().map(|item| item.size_bytes).sum()
    }
}

/// Keeps alphanumerics, spaces, `-` and `_`.
pub fn sanitize_folder_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Ids end up in file and directory names, so they stay within `[A-Za-z0-9_-]`.
pub fn is_plain_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

/// Folder name for a package, falling back to its id.
pub fn folder_name(display_name: &str, app_id: &str) -> String {
    let sanitized = sanitize_folder_name(display_name);
    if sanitized.is_empty() {
        sanitize_folder_name(app_id)
    } else {
        sanitized
    }
}
