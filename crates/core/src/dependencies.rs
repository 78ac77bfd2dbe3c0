//! Dependency directory for the test-driver.
//!
//! The driver expects scripts, configuration values and artifacts under
//! fixed paths of `<working_dir>/system_env/dependencies`. A
//! [`DependencyManifest`] lists those paths as typed entries, and
//! [`DependencyManifest::materialize`] writes them out.
//!
//! Materializing into a non-empty tree fails on the first name collision;
//! entries are never overwritten.

use std::io;
use std::path::{Path, PathBuf};

use crate::checksum::DiskImages;

/// Repository files the driver needs, linked under the same relative path.
pub const SCRIPT_PATHS: &[&str] = &[
    "ic-os/guestos/scripts/build-bootstrap-config-image.sh",
    "ic-os/boundary-guestos/scripts/build-bootstrap-config-image.sh",
    "rs/tests/create-universal-vm-config-image.sh",
    "rs/tests/rosetta_workspace/ic_rosetta_api_log_config.yml",
    "rs/tests/rosetta_workspace/rosetta_cli.json",
    "rs/tests/rosetta_workspace/rosetta_workflows.ros",
    "rs/tests/src/canister_http/universal_vm_activation.sh",
    "ic-os/guestos/rootfs/dev-certs/canister_http_test_ca.cert",
    "ic-os/guestos/rootfs/dev-certs/canister_http_test_ca.key",
];

/// `(artifact file name, destination path)` pairs.
pub const ARTIFACT_LINKS: &[(&str, &str)] = &[
    // NNS canisters
    ("registry-canister.wasm", "rs/tests/nns-canisters/registry-canister"),
    ("governance-canister_test.wasm", "rs/tests/nns-canisters/governance-canister_test"),
    ("ledger-canister_notify-method.wasm", "rs/tests/nns-canisters/ledger-canister_notify-method"),
    ("root-canister.wasm", "rs/tests/nns-canisters/root-canister"),
    ("cycles-minting-canister.wasm", "rs/tests/nns-canisters/cycles-minting-canister"),
    ("lifeline.wasm", "rs/tests/nns-canisters/lifeline"),
    ("genesis-token-canister.wasm", "rs/tests/nns-canisters/genesis-token-canister"),
    ("sns-wasm-canister.wasm", "rs/tests/nns-canisters/sns-wasm-canister"),
    // Ledger, bitcoin and rosetta
    ("ic-icrc1-ledger.wasm", "rs/rosetta-api/icrc1/ledger/ledger_canister.wasm"),
    ("ic-ckbtc-minter.wasm", "rs/bitcoin/ckbtc/minter/ckbtc_minter.wasm"),
    ("ic-ckbtc-minter_debug.wasm", "rs/bitcoin/ckbtc/minter/ckbtc_minter_debug.wasm"),
    ("ic-rosetta-api", "rs/rosetta-api/ic-rosetta-api"),
    // Test canisters
    ("http_counter.wasm", "rs/tests/test_canisters/http_counter/http_counter.wasm"),
    ("kv_store.wasm", "rs/tests/test_canisters/kv_store/kv_store.wasm"),
    ("counter.wat", "rs/workload_generator/src/counter.wat"),
    ("proxy_canister.wasm", "rs/rust_canisters/proxy_canister/proxy_canister.wasm"),
];

const ROSETTA_CLI_BIN: &str = "rosetta-cli";
const ROSETTA_CLI_DEST: &str = "external/rosetta-cli/rosetta-cli";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What a dependency entry contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySource {
    /// A symlink pointing at this path.
    Symlink(PathBuf),
    /// A regular file with this content.
    Content(String),
    /// Nothing; only the parent directory is created.
    None,
}

/// One path of the dependency tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEntry {
    /// Destination, relative to the dependency root.
    pub dest: PathBuf,
    pub source: EntrySource,
}

#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to link {dest} -> {target}: {source}")]
    Symlink {
        dest: PathBuf,
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Ordered list of dependency entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyManifest {
    entries: Vec<DependencyEntry>,
}

impl DependencyManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[DependencyEntry] {
        &self.entries
    }

    /// Add `dest -> target`.
    pub fn symlink(&mut self, dest: impl Into<PathBuf>, target: impl Into<PathBuf>) {
        self.entries.push(DependencyEntry {
            dest: dest.into(),
            source: EntrySource::Symlink(target.into()),
        });
    }

    /// Add a file holding `content`; empty content yields
    /// [`EntrySource::None`] so no file is written.
    pub fn content(&mut self, dest: impl Into<PathBuf>, content: &str) {
        let source = if content.is_empty() {
            EntrySource::None
        } else {
            EntrySource::Content(content.to_string())
        };
        self.entries.push(DependencyEntry {
            dest: dest.into(),
            source,
        });
    }

    /// Write every entry below `root`, creating parent directories on
    /// demand. Stops at the first failure.
    pub fn materialize(&self, root: &Path) -> Result<(), DependencyError> {
        for entry in &self.entries {
            let dest = root.join(&entry.dest);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|source| DependencyError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            match &entry.source {
                EntrySource::Symlink(target) => {
                    std::os::unix::fs::symlink(target, &dest).map_err(|source| {
                        DependencyError::Symlink {
                            dest: dest.clone(),
                            target: target.clone(),
                            source,
                        }
                    })?;
                }
                EntrySource::Content(content) => {
                    write_new(&dest, content).map_err(|source| DependencyError::Write {
                        path: dest.clone(),
                        source,
                    })?;
                }
                EntrySource::None => {}
            }
        }
        Ok(())
    }
}

/// Create `path` with `content`, failing if it already exists.
fn write_new(path: &Path, content: &str) -> io::Result<()> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(content.as_bytes())
}

// ---------------------------------------------------------------------------
// System test manifest
// ---------------------------------------------------------------------------

/// Values substituted into the system test dependency tree.
#[derive(Debug, Clone)]
pub struct DependencyInputs<'a> {
    pub project_dir: &'a Path,
    pub artifact_dir: &'a Path,
    pub farm_base_url: &'a str,
    pub journalbeat_hosts: &'a str,
    pub replica_log_debug_overrides: &'a str,
    pub ic_version_id: &'a str,
    pub images: &'a DiskImages,
    pub rosetta_cli_dir: Option<&'a Path>,
}

/// Build the dependency tree the system test-driver expects.
pub fn system_env_manifest(inputs: &DependencyInputs<'_>) -> DependencyManifest {
    let mut manifest = DependencyManifest::new();

    for rel in SCRIPT_PATHS {
        manifest.symlink(*rel, inputs.project_dir.join(rel));
    }

    let images = inputs.images;
    let values: [(&str, &str); 12] = [
        ("farm_base_url", inputs.farm_base_url),
        ("journalbeat_hosts", inputs.journalbeat_hosts),
        ("replica_log_debug_overrides", inputs.replica_log_debug_overrides),
        ("bazel/version.txt", inputs.ic_version_id),
        (
            "ic-os/guestos/dev/upload_disk-img_disk-img.tar.zst.proxy-cache-url",
            &images.guestos.url,
        ),
        ("ic-os/guestos/dev/disk-img.tar.zst.sha256", &images.guestos.sha256),
        (
            "ic-os/guestos/dev/upload_update-img_update-img.tar.zst.proxy-cache-url",
            &images.guestos_update.url,
        ),
        ("ic-os/guestos/dev/update-img.tar.zst.sha256", &images.guestos_update.sha256),
        ("ic-os/boundary-guestos/boundary_node_img_url", &images.boundary.url),
        ("ic-os/boundary-guestos/boundary_node_img_sha256", &images.boundary.sha256),
        ("ic-os/boundary-guestos/boundary_node_snp_img_url", &images.boundary_snp.url),
        ("ic-os/boundary-guestos/boundary_node_snp_img_sha256", &images.boundary_snp.sha256),
    ];
    for (rel, value) in values {
        manifest.content(rel, value);
    }

    for (artifact, dest) in ARTIFACT_LINKS {
        manifest.symlink(*dest, inputs.artifact_dir.join(artifact));
    }

    if let Some(dir) = inputs.rosetta_cli_dir {
        manifest.symlink(ROSETTA_CLI_DEST, dir.join(ROSETTA_CLI_BIN));
    }

    manifest
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ImageChecksum;

    fn image(tag: &str) -> ImageChecksum {
        ImageChecksum {
            sha256: format!("{tag}-sha"),
            url: format!("http://img/{tag}"),
        }
    }

    fn images() -> DiskImages {
        DiskImages {
            guestos: image("guestos"),
            guestos_update: image("update"),
            boundary: image("boundary"),
            boundary_snp: image("snp"),
        }
    }

    #[test]
    fn empty_content_writes_nothing() {
        let mut manifest = DependencyManifest::new();
        manifest.content("a/value", "");
        assert_eq!(manifest.entries()[0].source, EntrySource::None);

        let root = tempfile::tempdir().unwrap();
        manifest.materialize(root.path()).unwrap();
        assert!(root.path().join("a").is_dir());
        assert!(!root.path().join("a/value").exists());
    }

    #[test]
    fn materializes_all_entry_kinds() {
        let root = tempfile::tempdir().unwrap();
        let mut manifest = DependencyManifest::new();
        manifest.symlink("deep/nested/link", "/target/file");
        manifest.content("cfg/value", "42");

        manifest.materialize(root.path()).unwrap();

        assert_eq!(
            std::fs::read_link(root.path().join("deep/nested/link")).unwrap(),
            PathBuf::from("/target/file")
        );
        assert_eq!(std::fs::read_to_string(root.path().join("cfg/value")).unwrap(), "42");
    }

    #[test]
    fn existing_symlink_collides() {
        let root = tempfile::tempdir().unwrap();
        let mut manifest = DependencyManifest::new();
        manifest.symlink("link", "/a");
        manifest.materialize(root.path()).unwrap();

        let err = manifest.materialize(root.path()).unwrap_err();
        assert!(matches!(err, DependencyError::Symlink { .. }));
    }

    #[test]
    fn system_manifest_layout() {
        let images = images();
        let inputs = DependencyInputs {
            project_dir: Path::new("/ic"),
            artifact_dir: Path::new("/artifacts"),
            farm_base_url: "https://farm",
            journalbeat_hosts: "h:1",
            replica_log_debug_overrides: "",
            ic_version_id: "abc",
            images: &images,
            rosetta_cli_dir: Some(Path::new("/opt/rosetta")),
        };
        let manifest = system_env_manifest(&inputs);
        let find = |dest: &str| {
            manifest
                .entries()
                .iter()
                .find(|e| e.dest == Path::new(dest))
                .map(|e| e.source.clone())
        };

        assert_eq!(
            manifest.entries().len(),
            SCRIPT_PATHS.len() + 12 + ARTIFACT_LINKS.len() + 1
        );
        assert_eq!(
            find("rs/tests/create-universal-vm-config-image.sh"),
            Some(EntrySource::Symlink("/ic/rs/tests/create-universal-vm-config-image.sh".into()))
        );
        assert_eq!(find("bazel/version.txt"), Some(EntrySource::Content("abc".into())));
        assert_eq!(find("replica_log_debug_overrides"), Some(EntrySource::None));
        assert_eq!(
            find("ic-os/guestos/dev/disk-img.tar.zst.sha256"),
            Some(EntrySource::Content("guestos-sha".into()))
        );
        assert_eq!(
            find("rs/tests/nns-canisters/lifeline"),
            Some(EntrySource::Symlink("/artifacts/lifeline.wasm".into()))
        );
        assert_eq!(
            find("external/rosetta-cli/rosetta-cli"),
            Some(EntrySource::Symlink("/opt/rosetta/rosetta-cli".into()))
        );
    }
}
