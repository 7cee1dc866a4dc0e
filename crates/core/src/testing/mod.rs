//! Testing utilities and mock implementations.
//!
//! The mocks stand in for the external tools and the second machine so the
//! pipeline can be exercised end to end without DepotDownloader, rsync or
//! ssh being installed.
//!
//! # Example
//!
//! ```rust,ignore
//! use decklift_core::testing::{fixtures, MockRemoteChannel, MockStage};
//!
//! let remote = MockRemoteChannel::rooted(temp.path().join("deck"));
//! remote.set_push_failures(1).await;
//!
//! let download = MockStage::new(StageKind::Download).hanging(30, 100);
//! let job = fixtures::remote_job("220", temp.path());
//! ```

mod mock_registrar;
mod mock_remote;
mod mock_stage;

pub use mock_registrar::MockRegistrar;
pub use mock_remote::MockRemoteChannel;
pub use mock_stage::MockStage;

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::path::{Path, PathBuf};

    use crate::config::LibraryConfig;
    use crate::job::{DepotItem, InstallJob, JobSpec, Topology};
    use crate::remote::RemoteEndpoint;

    /// Library layout rooted in a scratch directory.
    pub fn library(root: &Path) -> LibraryConfig {
        LibraryConfig {
            staging_root: root.join("staging"),
            library_dir: root.join("steamapps/common"),
            state_dir: root.join("state"),
        }
    }

    /// A depot item whose manifest lives under `<root>/manifests`.
    pub fn depot_item(root: &Path, depot_id: &str, size_bytes: u64) -> DepotItem {
        let manifest_id = format!("76133568099048{}", depot_id.len());
        let manifest_path = manifest_dir(root).join(format!("{}_{}.manifest", depot_id, manifest_id));
        DepotItem::new(
            depot_id,
            manifest_id,
            manifest_path,
            format!("{:0>64}", depot_id),
            size_bytes,
        )
    }

    /// A spec with a single depot item.
    pub fn job_spec(app_id: &str, root: &Path, topology: Topology) -> JobSpec {
        let depot_id = format!("{}1", app_id);
        JobSpec::new(
            app_id,
            format!("Game {}", app_id),
            vec![depot_item(root, &depot_id, 1024 * 1024)],
            topology,
        )
    }

    /// The default remote endpoint used by remote fixtures.
    pub fn remote_endpoint() -> RemoteEndpoint {
        RemoteEndpoint::new(
            "deck.local",
            "deck",
            "/home/deck/.local/share/Steam/steamapps/common",
        )
    }

    pub fn local_job(app_id: &str, root: &Path) -> InstallJob {
        InstallJob::from_spec(job_spec(app_id, root, Topology::Local), &library(root), None)
            .expect("fixture job is valid")
    }

    pub fn remote_job(app_id: &str, root: &Path) -> InstallJob {
        let spec = job_spec(app_id, root, Topology::Remote).with_remote(remote_endpoint());
        InstallJob::from_spec(spec, &library(root), None).expect("fixture job is valid")
    }

    /// Writes a small manifest file for every depot item of `job`.
    pub fn write_manifests(job: &InstallJob) {
        for item in &job.depot_items {
            if let Some(parent) = item.manifest_path.parent() {
                std::fs::create_dir_all(parent).expect("create manifest dir");
            }
            std::fs::write(
                &item.manifest_path,
                format!("manifest {} {}", item.depot_id, item.manifest_id),
            )
            .expect("write manifest");
        }
    }

    fn manifest_dir(root: &Path) -> PathBuf {
        root.join("manifests")
    }
}
