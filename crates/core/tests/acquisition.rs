//! Artifact acquisition strategies, with external commands recorded
//! instead of executed.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use systest_core::artifacts::{acquire, AcquisitionStrategy};
use systest_core::cleanup::TempDirRegistry;
use systest_core::command::{CommandError, CommandOutput, CommandRunner, CommandSpec};

/// Records every command and answers with a fixed exit code.
struct RecordingRunner {
    code: i32,
    calls: Mutex<Vec<CommandSpec>>,
}

impl RecordingRunner {
    fn new(code: i32) -> Self {
        Self {
            code,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().expect("lock").clone()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn status(&self, spec: &CommandSpec) -> Result<i32, CommandError> {
        self.calls.lock().expect("lock").push(spec.clone());
        Ok(self.code)
    }

    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        self.calls.lock().expect("lock").push(spec.clone());
        Ok(CommandOutput {
            code: self.code,
            ..Default::default()
        })
    }
}

fn write_gz(path: &Path, content: &[u8]) {
    std::fs::create_dir_all(path.parent().expect("has parent")).expect("mkdir");
    let mut encoder = GzEncoder::new(
        std::fs::File::create(path).expect("create"),
        Compression::default(),
    );
    encoder.write_all(content).expect("write");
    encoder.finish().expect("finish");
}

// ---------------------------------------------------------------------------
// Test: remote downloads
// ---------------------------------------------------------------------------

/// Both downloads are attempted even when the first fails, and a failing
/// download does not fail the acquisition.
#[tokio::test]
async fn failed_downloads_are_advisory() {
    let artifacts = tempfile::tempdir().expect("temp dir");
    let runner = RecordingRunner::new(1);
    let mut registry = TempDirRegistry::new(false);

    acquire(
        &AcquisitionStrategy::Remote {
            version: "abc".into(),
        },
        artifacts.path(),
        Path::new("/ic"),
        &runner,
        &mut registry,
        false,
    )
    .await
    .expect("download failures are not fatal");

    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].program, "/ic/gitlab-ci/src/artifacts/rclone_download.py");
    assert!(calls[0].args.contains(&"--remote-path=canisters".to_string()));
    assert!(calls[1].args.contains(&"--remote-path=release".to_string()));
    assert!(calls[1].args.contains(&"--git-rev=abc".to_string()));
    assert!(calls[1].args.contains(&"--mark-executable".to_string()));
    assert!(registry.dirs().is_empty());
}

// ---------------------------------------------------------------------------
// Test: pre-staged artifacts
// ---------------------------------------------------------------------------

/// Pre-staged archives are unpacked next to their sources, and the source
/// directories are scheduled for removal.
#[tokio::test]
async fn prestaged_artifacts_are_unpacked_and_registered() {
    let artifacts = tempfile::tempdir().expect("temp dir");
    write_gz(&artifacts.path().join("canisters/ledger.wasm.gz"), b"wasm");
    write_gz(&artifacts.path().join("release/replica.gz"), b"bin");
    let runner = RecordingRunner::new(0);
    let mut registry = TempDirRegistry::new(true);

    acquire(
        &AcquisitionStrategy::PreStaged,
        artifacts.path(),
        Path::new("/ic"),
        &runner,
        &mut registry,
        false,
    )
    .await
    .expect("extraction succeeds");

    assert!(runner.calls().is_empty());
    assert_eq!(
        std::fs::read(artifacts.path().join("ledger.wasm")).expect("extracted"),
        b"wasm"
    );
    assert_eq!(
        std::fs::read(artifacts.path().join("replica")).expect("extracted"),
        b"bin"
    );
    assert_eq!(
        registry.dirs(),
        &[artifacts.path().join("canisters"), artifacts.path().join("release")]
    );
}

/// `--keep_artifacts` leaves the pre-staged sources unregistered.
#[tokio::test]
async fn keep_artifacts_skips_registration() {
    let artifacts = tempfile::tempdir().expect("temp dir");
    write_gz(&artifacts.path().join("canisters/a.wasm.gz"), b"a");
    std::fs::create_dir_all(artifacts.path().join("release")).expect("mkdir");
    let runner = RecordingRunner::new(0);
    let mut registry = TempDirRegistry::new(true);

    acquire(
        &AcquisitionStrategy::PreStaged,
        artifacts.path(),
        Path::new("/ic"),
        &runner,
        &mut registry,
        true,
    )
    .await
    .expect("extraction succeeds");

    assert!(registry.dirs().is_empty());
}

// ---------------------------------------------------------------------------
// Test: prebuilt artifacts
// ---------------------------------------------------------------------------

/// A local build directory is copied into the artifact directory and
/// unpacked there.
#[tokio::test]
async fn prebuilt_directory_is_copied_then_unpacked() {
    let source = tempfile::tempdir().expect("temp dir");
    write_gz(&source.path().join("canisters/c.wasm.gz"), b"c");
    write_gz(&source.path().join("icos/img.gz"), b"i");
    write_gz(&source.path().join("release/tool.gz"), b"t");
    let dest_root = tempfile::tempdir().expect("temp dir");
    let artifacts = dest_root.path().join("artifacts");
    let runner = RecordingRunner::new(0);
    let mut registry = TempDirRegistry::new(true);

    acquire(
        &AcquisitionStrategy::Prebuilt {
            source: source.path().to_path_buf(),
        },
        &artifacts,
        Path::new("/ic"),
        &runner,
        &mut registry,
        false,
    )
    .await
    .expect("copy and extraction succeed");

    assert!(source.path().join("canisters/c.wasm.gz").exists());
    assert!(artifacts.join("canisters/c.wasm.gz").exists());
    for name in ["c.wasm", "img", "tool"] {
        assert!(artifacts.join(name).is_file(), "{name} not extracted");
    }
}
