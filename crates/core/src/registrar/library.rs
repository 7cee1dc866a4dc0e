//! Registrar that edits the launcher's files directly.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

use super::edits::{add_app_token, add_decryption_keys, add_owned_app, render_app_manifest};
use super::error::RegistrationError;
use super::traits::Registrar;
use super::types::RegistrationStatus;
use crate::job::{InstallJob, InstallTarget};
use crate::pipeline::TrackedPath;
use crate::remote::{remote_join, remote_parent, RemoteChannel, RemoteEndpoint};
use crate::stage::RegistrationConfig;

/// Where the launcher files live for one job.
enum Files<'a> {
    Local,
    Remote {
        channel: &'a dyn RemoteChannel,
        endpoint: &'a RemoteEndpoint,
    },
}

impl Files<'_> {
    async fn read(&self, path: &str) -> Result<Option<String>, RegistrationError> {
        let bytes = match self {
            Self::Local => match fs::read(expand_home(path)).await {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => return Err(RegistrationError::io(path, e)),
            },
            Self::Remote { channel, endpoint } => channel.read_file(endpoint, path).await?,
        };
        bytes
            .map(|bytes| {
                String::from_utf8(bytes).map_err(|_| RegistrationError::InvalidEncoding {
                    path: path.to_string(),
                })
            })
            .transpose()
    }

    async fn write(&self, path: &str, contents: &[u8]) -> Result<(), RegistrationError> {
        match self {
            Self::Local => {
                let path_buf = expand_home(path);
                if let Some(parent) = path_buf.parent() {
                    fs::create_dir_all(parent)
                        .await
                        .map_err(|e| RegistrationError::io(path, e))?;
                }
                fs::write(&path_buf, contents)
                    .await
                    .map_err(|e| RegistrationError::io(path, e))
            }
            Self::Remote { channel, endpoint } => {
                if let Some(parent) = remote_parent(path) {
                    channel.create_dir_all(endpoint, parent).await?;
                }
                channel.write_file(endpoint, path, contents).await?;
                Ok(())
            }
        }
    }
}

/// File locations derived from the install target.
struct Layout {
    app_manifest: String,
    /// Local manifest file and where its cached copy goes.
    manifests: Vec<(PathBuf, String)>,
}

pub struct LibraryRegistrar {
    config: RegistrationConfig,
    remote: Arc<dyn RemoteChannel>,
}

impl LibraryRegistrar {
    pub fn new(config: RegistrationConfig, remote: Arc<dyn RemoteChannel>) -> Self {
        Self { config, remote }
    }

    fn files<'a>(&'a self, job: &'a InstallJob) -> Files<'a> {
        match &job.target {
            InstallTarget::Local { .. } => Files::Local,
            InstallTarget::Remote { endpoint, .. } => Files::Remote {
                channel: self.remote.as_ref(),
                endpoint,
            },
        }
    }

    async fn register_ownership(
        &self,
        files: &Files<'_>,
        job: &InstallJob,
        path: &str,
    ) -> Result<bool, RegistrationError> {
        let content = files.read(path).await?.unwrap_or_default();
        let mut changed = false;
        let mut content = match add_owned_app(&content, &job.app_id, &job.display_name) {
            Some(updated) => {
                changed = true;
                updated
            }
            None => content,
        };
        let already_owned = !changed;
        if let Some(token) = job.app_token.as_deref().filter(|t| !t.trim().is_empty()) {
            if let Some(updated) = add_app_token(&content, &job.app_id, token) {
                content = updated;
                changed = true;
            }
        }
        if changed {
            files.write(path, content.as_bytes()).await?;
            debug!("Updated ownership list {}", path);
        }
        Ok(already_owned)
    }

    async fn register_keys(
        &self,
        files: &Files<'_>,
        job: &InstallJob,
        path: &str,
    ) -> Result<(), RegistrationError> {
        let keys: Vec<(String, String)> = job
            .depot_items
            .iter()
            .filter(|item| !item.decryption_key.is_empty())
            .map(|item| (item.depot_id.clone(), item.decryption_key.clone()))
            .collect();
        if keys.is_empty() {
            return Ok(());
        }
        let content = files.read(path).await?.unwrap_or_default();
        if let Some(updated) = add_decryption_keys(&content, &keys) {
            files.write(path, updated.as_bytes()).await?;
            debug!("Added depot keys to {}", path);
        }
        Ok(())
    }
}

#[async_trait]
impl Registrar for LibraryRegistrar {
    fn name(&self) -> &str {
        "library"
    }

    fn planned_artifacts(&self, job: &InstallJob) -> Vec<TrackedPath> {
        let Some(layout) = layout(job) else {
            return Vec::new();
        };
        let tracked = |path: String| match job.target {
            InstallTarget::Local { .. } => TrackedPath::Local(PathBuf::from(path)),
            InstallTarget::Remote { .. } => TrackedPath::Remote(path),
        };
        let mut artifacts: Vec<TrackedPath> = layout
            .manifests
            .into_iter()
            .map(|(_, dest)| tracked(dest))
            .collect();
        artifacts.push(tracked(layout.app_manifest));
        artifacts
    }

    async fn register(&self, job: &InstallJob) -> Result<RegistrationStatus, RegistrationError> {
        let files = self.files(job);

        let already_owned = match &self.config.ownership_file {
            Some(path) => Some(self.register_ownership(&files, job, path).await?),
            None => None,
        };
        if let Some(path) = &self.config.key_store_file {
            self.register_keys(&files, job, path).await?;
        }

        let Some(layout) = layout(job) else {
            return Err(RegistrationError::io(
                job.target.display(),
                io::Error::new(io::ErrorKind::InvalidInput, "install target has no library root"),
            ));
        };

        for (source, dest) in &layout.manifests {
            let bytes = fs::read(source)
                .await
                .map_err(|e| RegistrationError::io(source.display().to_string(), e))?;
            files.write(dest, &bytes).await?;
        }

        let acf = render_app_manifest(job);
        let previous = files.read(&layout.app_manifest).await?;
        let acf_unchanged = previous.as_deref() == Some(acf.as_str());
        if !acf_unchanged {
            files.write(&layout.app_manifest, acf.as_bytes()).await?;
        }

        let status = match already_owned {
            Some(true) => RegistrationStatus::AlreadyRegistered,
            Some(false) => RegistrationStatus::Registered,
            None if acf_unchanged => RegistrationStatus::AlreadyRegistered,
            None => RegistrationStatus::Registered,
        };
        info!(
            "Registered app {} at {} ({:?})",
            job.app_id,
            job.target.display(),
            status
        );
        Ok(status)
    }
}

/// The library root is the grandparent of the install directory
/// (`<steamapps>/common/<folder>`).
fn layout(job: &InstallJob) -> Option<Layout> {
    let steamapps = match &job.target {
        InstallTarget::Local { dir } => dir.parent()?.parent()?.to_string_lossy().into_owned(),
        InstallTarget::Remote { dir, .. } => remote_parent(remote_parent(dir)?)?.to_string(),
    };
    let depotcache = remote_join(&steamapps, "depotcache");
    let manifests = job
        .depot_items
        .iter()
        .map(|item| {
            let name = item
                .manifest_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("{}_{}.manifest", item.depot_id, item.manifest_id));
            (item.manifest_path.clone(), remote_join(&depotcache, &name))
        })
        .collect();
    Some(Layout {
        app_manifest: remote_join(&steamapps, &format!("appmanifest_{}.acf", job.app_id)),
        manifests,
    })
}

/// Expands a leading `~/` against `HOME` for local paths.
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => Path::new(&home).join(rest),
        _ => PathBuf::from(path),
    }
}
