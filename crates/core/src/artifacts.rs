//! Artifact acquisition.
//!
//! Artifacts (canister wasm modules, release binaries, OS images) reach the
//! artifact directory through exactly one [`AcquisitionStrategy`]:
//!
//! - **Prebuilt**: a developer's local build directory, copied wholesale
//!   and then unpacked in place.
//! - **PreStaged**: compressed artifacts an earlier CI job left in the
//!   project's `artifacts/` directory (merge-request pipelines).
//! - **Remote**: fetched by the external download tool for a version.
//!
//! The steps within a strategy run sequentially without rollback; a
//! partially populated artifact directory is passed on as is.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use crate::checksum::DiskImages;
use crate::cleanup::TempDirRegistry;
use crate::command::{run_advisory, CommandRunner, CommandSpec};
use crate::config::RunConfig;

/// Suffix of compressed artifacts.
pub const GZ_SUFFIX: &str = ".gz";

/// Sub-directories of the artifact directory, by artifact kind.
pub const CANISTERS_SUBDIR: &str = "canisters";
pub const RELEASE_SUBDIR: &str = "release";
pub const ICOS_SUBDIR: &str = "icos";

/// Download tool, relative to the project directory.
const DOWNLOAD_TOOL: &str = "gitlab-ci/src/artifacts/rclone_download.py";

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Failed to read artifact directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to decompress {path}: {source}")]
    Decompress {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Artifact task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

// ---------------------------------------------------------------------------
// ArtifactSet
// ---------------------------------------------------------------------------

/// Everything acquired for the driver: the artifact directory and the
/// disk images it should boot.
#[derive(Debug, Clone)]
pub struct ArtifactSet {
    pub dir: PathBuf,
    pub images: DiskImages,
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Decompress every `*.gz` file of `source_dir` into `dest_dir`.
///
/// The output keeps the file name without the suffix and overwrites an
/// existing file of that name. Other files are left untouched. Returns the
/// number of files extracted; the first failure aborts the call.
pub fn extract_artifacts(
    source_dir: &Path,
    dest_dir: &Path,
    set_executable: bool,
) -> Result<usize, ArtifactError> {
    let read_dir_err = |source| ArtifactError::ReadDir {
        path: source_dir.to_path_buf(),
        source,
    };
    let entries = fs::read_dir(source_dir).map_err(read_dir_err)?;

    let mut compressed = Vec::new();
    for entry in entries {
        let path = entry.map_err(read_dir_err)?.path();
        if path.is_file() && has_gz_suffix(&path) {
            compressed.push(path);
        }
    }
    compressed.sort();
    tracing::info!(
        count = compressed.len(),
        dir = %source_dir.display(),
        "Unzipping artifacts",
    );

    for path in &compressed {
        let target = dest_dir.join(strip_gz_suffix(path));
        decompress(path, &target, set_executable).map_err(|source| {
            ArtifactError::Decompress {
                path: path.clone(),
                source,
            }
        })?;
    }
    Ok(compressed.len())
}

fn has_gz_suffix(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.len() > GZ_SUFFIX.len() && n.ends_with(GZ_SUFFIX))
}

fn strip_gz_suffix(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.strip_suffix(GZ_SUFFIX).unwrap_or(&name).to_string()
}

fn decompress(source: &Path, target: &Path, set_executable: bool) -> io::Result<()> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(source)?));
    let mut out = BufWriter::new(File::create(target)?);
    io::copy(&mut decoder, &mut out)?;
    out.into_inner().map_err(|e| e.into_error())?.sync_all()?;

    if set_executable {
        let mut perms = fs::metadata(target)?.permissions();
        perms.set_mode(perms.mode() | 0o111);
        fs::set_permissions(target, perms)?;
    }
    Ok(())
}

/// Recursively copy `src` into a new directory `dst`. Symlinks are
/// recreated, not followed.
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<(), ArtifactError> {
    copy_tree(src, dst).map_err(|source| ArtifactError::Copy {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source,
    })
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let kind = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if kind.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if kind.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Log a directory tree at debug level, one entry per line.
pub fn log_tree(root: &Path) {
    fn walk(dir: &Path, depth: usize) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        let mut entries: Vec<_> = entries.filter_map(Result::ok).collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let indent = "    ".repeat(depth);
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().is_ok_and(|t| t.is_dir());
            if is_dir {
                tracing::debug!("{indent}{name}/");
                walk(&entry.path(), depth + 1);
            } else {
                tracing::debug!("{indent}{name}");
            }
        }
    }

    tracing::debug!("{}/", root.display());
    walk(root, 1);
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// How artifacts reach the artifact directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionStrategy {
    /// Copy a local build directory, then unpack it in place.
    Prebuilt { source: PathBuf },
    /// Unpack artifacts already staged under the artifact directory.
    PreStaged,
    /// Download artifacts built from `version`.
    Remote { version: String },
}

impl AcquisitionStrategy {
    /// Pick the strategy for a run. Prebuilt artifacts win over an MR
    /// pipeline, which wins over downloading.
    pub fn select(config: &RunConfig) -> Self {
        if let Some(source) = &config.prebuilt_artifact_dir {
            Self::Prebuilt {
                source: source.clone(),
            }
        } else if config.flags.is_merge_request {
            Self::PreStaged
        } else {
            Self::Remote {
                version: config.ic_version_id.clone(),
            }
        }
    }
}

/// Command downloading one remote artifact directory into `out`.
pub fn download_command(project_dir: &Path, remote_path: &str, version: &str, out: &Path) -> CommandSpec {
    CommandSpec::new(project_dir.join(DOWNLOAD_TOOL).display().to_string()).args([
        format!("--remote-path={remote_path}"),
        format!("--git-rev={version}"),
        format!("--out={}", out.display()),
        "--unpack".to_string(),
        "--mark-executable".to_string(),
    ])
}

/// Populate `artifact_dir` with `strategy`.
///
/// Pre-staged source directories are registered for deletion unless
/// `keep_artifacts` is set. Download failures are advisory; copy and
/// extraction failures are returned.
pub async fn acquire(
    strategy: &AcquisitionStrategy,
    artifact_dir: &Path,
    project_dir: &Path,
    runner: &dyn CommandRunner,
    registry: &mut TempDirRegistry,
    keep_artifacts: bool,
) -> Result<(), ArtifactError> {
    let canisters = artifact_dir.join(CANISTERS_SUBDIR);
    let release = artifact_dir.join(RELEASE_SUBDIR);
    let icos = artifact_dir.join(ICOS_SUBDIR);

    match strategy {
        AcquisitionStrategy::Prebuilt { source } => {
            tracing::info!(
                from = %source.display(),
                to = %artifact_dir.display(),
                "Copying prebuilt artifacts",
            );
            let (src, dst) = (source.clone(), artifact_dir.to_path_buf());
            tokio::task::spawn_blocking(move || copy_dir_all(&src, &dst)).await??;
            extract_all(
                artifact_dir,
                vec![(canisters, false), (icos, false), (release, true)],
            )
            .await?;
        }
        AcquisitionStrategy::PreStaged => {
            tracing::info!(dir = %artifact_dir.display(), "Extracting pre-staged artifacts");
            extract_all(
                artifact_dir,
                vec![(canisters.clone(), false), (release.clone(), true)],
            )
            .await?;
            if !keep_artifacts {
                registry.register(canisters);
                registry.register(release);
            }
        }
        AcquisitionStrategy::Remote { version } => {
            tracing::info!(version = %version, "Downloading dependencies built from commit");
            for remote_path in [CANISTERS_SUBDIR, RELEASE_SUBDIR] {
                let spec = download_command(project_dir, remote_path, version, artifact_dir);
                tracing::debug!(command = %spec, "Download command");
                run_advisory(runner, &spec, &format!("Download of {remote_path} artifacts")).await;
            }
        }
    }
    Ok(())
}

/// Extract `(source, executable)` pairs into `dest`, in order.
async fn extract_all(dest: &Path, sources: Vec<(PathBuf, bool)>) -> Result<(), ArtifactError> {
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        for (source, executable) in sources {
            extract_artifacts(&source, &dest, executable)?;
        }
        Ok::<(), ArtifactError>(())
    })
    .await?
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
