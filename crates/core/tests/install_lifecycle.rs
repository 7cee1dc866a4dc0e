//! Install lifecycle integration tests.
//!
//! These tests drive whole jobs through the state machine with the real
//! stage runners where they can run locally (download and patch through
//! small shell scripts, local transfer) and mocks for the remote side:
//! - Local install end to end
//! - Remote transfer failing part way
//! - Cancellation during download
//! - Patch failures downgraded to warnings

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::sync::broadcast;

use decklift_core::{
    job::{InstallJob, InstallTarget, JobError, Topology},
    orchestrator::{InstallOrchestrator, OrchestratorError},
    pipeline::{
        CleanupController, PathLedger, PipelineConfig, PipelineStateMachine, RunControl,
        TerminalOutcome, TrackedPath,
    },
    progress::ProgressSnapshot,
    registrar::{LibraryRegistrar, Registrar, RegistrationStatus},
    remote::remote_join,
    stage::{
        DepotDownloadStage, PatchStage, RegisterStage, StageKind, StageRunner, TransferStage,
    },
    stage::{DownloadConfig, PatchConfig, RegistrationConfig, RetryConfig, TransferConfig},
    testing::{fixtures, MockRegistrar, MockRemoteChannel, MockStage},
    ProgressBus, RunStage,
};

/// Test helper holding the scratch directory and the mocks.
struct TestHarness {
    temp_dir: TempDir,
    remote: Arc<MockRemoteChannel>,
    registrar: Arc<MockRegistrar>,
}

impl TestHarness {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let remote = Arc::new(MockRemoteChannel::rooted(temp_dir.path().join("deck")));
        Self {
            temp_dir,
            remote,
            registrar: Arc::new(MockRegistrar::new()),
        }
    }

    fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    fn state_dir(&self) -> PathBuf {
        self.root().join("state")
    }

    fn machine(&self, stages: Vec<Arc<dyn StageRunner>>) -> PipelineStateMachine {
        PipelineStateMachine::new(
            stages,
            CleanupController::new(self.remote.clone()),
            ProgressBus::new(1024),
            PipelineConfig::default()
                .with_poll_interval(10)
                .with_emit_interval(10)
                .with_cancel_grace(1),
        )
    }

    fn transfer(&self) -> Arc<dyn StageRunner> {
        Arc::new(TransferStage::new(
            TransferConfig::default().with_retry(RetryConfig::immediate(2)),
            self.remote.clone(),
        ))
    }

    fn register(&self) -> Arc<dyn StageRunner> {
        Arc::new(RegisterStage::new(
            self.registrar.clone(),
            RetryConfig::immediate(2),
        ))
    }

    async fn run(
        &self,
        machine: &PipelineStateMachine,
        job: &Arc<InstallJob>,
    ) -> (TerminalOutcome, PathLedger) {
        let ledger = PathLedger::journaled(job, &self.state_dir());
        let outcome = tokio::time::timeout(
            Duration::from_secs(20),
            machine.run(job.clone(), &RunControl::new(), ledger.clone()),
        )
        .await
        .expect("run did not finish");
        (outcome, ledger)
    }
}

#[cfg(unix)]
fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A stand-in depot tool that writes six files into `-dir`.
#[cfg(unix)]
fn download_stage(dir: &Path) -> Arc<dyn StageRunner> {
    let tool = script(
        dir,
        "fake-depot-tool",
        r#"dir=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-dir" ]; then dir="$2"; fi
  shift
done
mkdir -p "$dir/bin"
i=1
while [ $i -le 5 ]; do
  printf 'chunk%s' "$i" > "$dir/data$i.pak"
  i=$((i + 1))
done
printf 'binary' > "$dir/bin/game.exe"
echo " 50.00% $dir/data1.pak 2.5 MB/s"
echo "100.00% $dir/bin/game.exe""#,
    );
    Arc::new(DepotDownloadStage::new(
        DownloadConfig::default()
            .with_tool(tool)
            .with_retry(RetryConfig::immediate(1)),
    ))
}

fn drain(rx: &mut broadcast::Receiver<ProgressSnapshot>) -> Vec<ProgressSnapshot> {
    let mut seen = Vec::new();
    while let Ok(snapshot) = rx.try_recv() {
        seen.push(snapshot);
    }
    seen
}

fn assert_monotonic(snapshots: &[ProgressSnapshot]) {
    let stages: Vec<RunStage> = snapshots.iter().map(|s| s.stage).collect();
    assert!(
        stages.windows(2).all(|w| w[0] <= w[1]),
        "stages went backwards: {:?}",
        stages
    );
}

// =============================================================================
// Scenarios
// =============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_local_install_completes_and_promotes_paths() {
    let harness = TestHarness::new();
    let machine = harness.machine(vec![
        download_stage(harness.root()),
        Arc::new(PatchStage::new(PatchConfig::default())),
        harness.transfer(),
        harness.register(),
    ]);
    let mut rx = machine.bus().subscribe();
    let job = Arc::new(fixtures::local_job("220", harness.root()));
    fixtures::write_manifests(&job);

    let (outcome, ledger) = harness.run(&machine, &job).await;

    assert!(outcome.is_success(), "{}", outcome.message());
    assert!(ledger.is_empty().await);
    let InstallTarget::Local { dir } = &job.target else {
        unreachable!()
    };
    assert_eq!(std::fs::read(dir.join("bin/game.exe")).unwrap(), b"binary");
    assert!(!job.staging_dir.exists());
    assert!(!DepotDownloadStage::keys_file(&job).exists());
    assert!(!harness.state_dir().join("active_run.json").exists());
    assert_eq!(harness.registrar.calls().await, 1);

    let snapshots = drain(&mut rx);
    assert_monotonic(&snapshots);
    assert!(snapshots.iter().all(|s| s.stage != RunStage::Patching));
    assert!(snapshots.iter().any(|s| s.stage == RunStage::Registering));
    assert_eq!(snapshots.last().map(|s| s.stage), Some(RunStage::Completed));
}

#[cfg(unix)]
#[tokio::test]
async fn test_remote_transfer_failure_cleans_both_sides() {
    let harness = TestHarness::new();
    harness.remote.set_fail_push_at(0.6).await;
    let machine = harness.machine(vec![
        download_stage(harness.root()),
        harness.transfer(),
        harness.register(),
    ]);
    let mut rx = machine.bus().subscribe();
    let job = Arc::new(fixtures::remote_job("220", harness.root()));
    fixtures::write_manifests(&job);
    let InstallTarget::Remote { dir, .. } = &job.target else {
        unreachable!()
    };

    let (outcome, ledger) = harness.run(&machine, &job).await;

    assert_eq!(outcome.failed_stage(), Some(StageKind::Transfer));
    assert!(outcome.message().starts_with("Transfer failed"));
    assert!(!harness.remote.local_path(dir).exists());
    assert!(harness.remote.recorded_removals().await.contains(dir));
    assert!(!job.staging_dir.exists());
    assert_eq!(harness.registrar.calls().await, 0);

    for path in ledger.paths().await {
        let on_disk = match &path {
            TrackedPath::Local(local) => local.clone(),
            TrackedPath::Remote(remote) => {
                harness.remote.local_path(remote)
            }
        };
        assert!(!on_disk.exists(), "{} survived cleanup", path.display());
    }

    let terminal = drain(&mut rx).pop().unwrap();
    assert_eq!(terminal.stage, RunStage::Failed);
    assert_eq!(terminal.failed_stage, Some(StageKind::Transfer));
}

#[tokio::test]
async fn test_cancel_during_download_stops_pipeline() {
    let harness = TestHarness::new();
    let job = Arc::new(fixtures::local_job("220", harness.root()));
    let download = MockStage::new(StageKind::Download)
        .creating(vec![TrackedPath::Local(
            job.staging_dir.clone(),
        )])
        .hanging(30, 100);
    let rest: Vec<MockStage> = [StageKind::Patch, StageKind::Transfer, StageKind::Register]
        .into_iter()
        .map(MockStage::new)
        .collect();
    let mut stages: Vec<Arc<dyn StageRunner>> = vec![Arc::new(download)];
    stages.extend(rest.iter().cloned().map(|s| Arc::new(s) as Arc<dyn StageRunner>));
    let machine = harness.machine(stages);
    let mut rx = machine.bus().subscribe();

    let control = RunControl::new();
    let ledger = PathLedger::new(&job);
    let canceller = control.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });
    let started = Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        machine.run(job.clone(), &control, ledger.clone()),
    )
    .await
    .unwrap();

    assert_eq!(outcome.run_stage(), RunStage::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));
    for stage in &rest {
        assert_eq!(stage.runs(), 0);
    }
    assert!(!job.staging_dir.exists());

    let snapshots = drain(&mut rx);
    assert_monotonic(&snapshots);
    assert!(snapshots
        .iter()
        .any(|s| s.stage == RunStage::Downloading && s.bytes_done == 30));
    assert!(snapshots
        .iter()
        .all(|s| !matches!(s.stage, RunStage::Patching | RunStage::Transferring | RunStage::Registering)));
    assert!(outcome.message().contains("cancelled"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_patch_failure_is_a_warning() {
    let harness = TestHarness::new();
    let tool = script(harness.root(), "fake-unpacker", "echo 'unsupported variant' >&2\nexit 3");
    let machine = harness.machine(vec![
        download_stage(harness.root()),
        Arc::new(PatchStage::new(PatchConfig::default().with_tool(tool))),
        harness.transfer(),
        harness.register(),
    ]);
    let mut rx = machine.bus().subscribe();
    let job = Arc::new(fixtures::local_job("220", harness.root()));
    fixtures::write_manifests(&job);

    let (outcome, _) = harness.run(&machine, &job).await;

    assert!(outcome.is_success(), "{}", outcome.message());
    assert!(outcome.message().contains("patching failed"));
    assert_eq!(harness.registrar.calls().await, 1);

    let snapshots = drain(&mut rx);
    assert!(snapshots.iter().any(|s| s.stage == RunStage::Patching));
    assert!(snapshots.iter().any(|s| s.stage == RunStage::Transferring));
    let terminal = snapshots.last().unwrap();
    assert_eq!(terminal.stage, RunStage::Completed);
    assert!(terminal.message.contains("patching failed"));
}

// =============================================================================
// Properties
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_app_rejected_until_terminal() {
    let harness = TestHarness::new();
    let machine = harness.machine(vec![Arc::new(MockStage::new(StageKind::Download))]);
    let orchestrator = InstallOrchestrator::new(
        machine,
        harness.registrar.clone(),
        fixtures::library(harness.root()),
        None,
    );

    let spec = || fixtures::job_spec("220", harness.root(), Topology::Local);
    let mut current = orchestrator.enqueue_install(spec()).await.unwrap();
    assert!(matches!(
        orchestrator.enqueue_install(spec()).await,
        Err(OrchestratorError::Job(JobError::Duplicate { existing, .. })) if existing == current
    ));

    let mut rx = orchestrator.subscribe();
    orchestrator.start().await;
    for _ in 0..10 {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = rx.recv().await.unwrap();
                if snapshot.job_id == current && snapshot.is_terminal() {
                    break;
                }
            }
        })
        .await
        .unwrap();

        // Accepted as soon as the terminal record is out
        let next = orchestrator.enqueue_install(spec()).await.unwrap();
        assert_ne!(current, next);
        current = next;
    }
    orchestrator.stop().await;
}

#[tokio::test]
async fn test_remote_registration_is_idempotent() {
    let harness = TestHarness::new();
    let job = fixtures::remote_job("220", harness.root());
    fixtures::write_manifests(&job);
    let registrar = LibraryRegistrar::new(
        RegistrationConfig {
            ownership_file: Some("/home/deck/.config/SLSsteam/config.yaml".to_string()),
            key_store_file: Some("/home/deck/.steam/steam/config/config.vdf".to_string()),
            ..Default::default()
        },
        harness.remote.clone(),
    );

    assert_eq!(
        registrar.register(&job).await.unwrap(),
        RegistrationStatus::Registered
    );
    let snapshot_files = |paths: &[&str]| -> Vec<Vec<u8>> {
        paths
            .iter()
            .map(|p| std::fs::read(harness.remote.local_path(p)).unwrap())
            .collect()
    };
    let InstallTarget::Remote { dir, .. } = &job.target else {
        unreachable!()
    };
    let acf = remote_join(
        dir.rsplitn(3, '/').nth(2).unwrap(),
        "appmanifest_220.acf",
    );
    let files = [
        "/home/deck/.config/SLSsteam/config.yaml",
        "/home/deck/.steam/steam/config/config.vdf",
        acf.as_str(),
    ];
    let first = snapshot_files(&files);

    assert_eq!(
        registrar.register(&job).await.unwrap(),
        RegistrationStatus::AlreadyRegistered
    );
    assert_eq!(snapshot_files(&files), first);
}
