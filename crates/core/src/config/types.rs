use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::pipeline::PipelineConfig;
use crate::remote::RemoteEndpoint;
use crate::stage::{DownloadConfig, PatchConfig, RegistrationConfig, TransferConfig};

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub patch: PatchConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    /// Default endpoint for remote installs that do not name their own.
    #[serde(default)]
    pub remote: Option<RemoteEndpoint>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

/// Where content is staged and where local installs land.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LibraryConfig {
    /// Scratch root; each job stages into `install_<app_id>` below it.
    #[serde(default = "default_staging_root")]
    pub staging_root: PathBuf,

    /// Library directory for local installs (the `steamapps/common` level).
    #[serde(default = "default_library_dir")]
    pub library_dir: PathBuf,

    /// Directory holding the active-run journal.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            staging_root: default_staging_root(),
            library_dir: default_library_dir(),
            state_dir: default_state_dir(),
        }
    }
}

fn default_staging_root() -> PathBuf {
    std::env::temp_dir().join("decklift")
}

fn default_library_dir() -> PathBuf {
    PathBuf::from("/home/deck/.local/share/Steam/steamapps/common")
}

fn default_state_dir() -> PathBuf {
    std::env::temp_dir().join("decklift-state")
}

/// Configuration safe to expose over the API.
///
/// Passwords never serialize, so this is a thin projection that also
/// drops the key store location.
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub library: LibraryConfig,
    pub download_tool: PathBuf,
    pub patch_enabled: bool,
    pub remote: Option<RemoteEndpoint>,
    pub pipeline: PipelineConfig,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            library: config.library.clone(),
            download_tool: config.download.tool_path.clone(),
            patch_enabled: config.patch.tool_path.is_some(),
            remote: config.remote.clone(),
            pipeline: config.pipeline.clone(),
        }
    }
}
