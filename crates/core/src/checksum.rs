//! Disk image checksum resolution.
//!
//! The image proxy publishes a `SHA256SUMS` manifest next to every image
//! directory. [`ChecksumResolver::resolve`] fetches that manifest and
//! returns the checksum and download URL of one file in it.

use std::collections::HashMap;
use std::time::Duration;

/// Manifest file name inside every image directory.
pub const SHA256SUMS_FILE: &str = "SHA256SUMS";

pub const DISK_IMG_FILE: &str = "disk-img.tar.zst";
pub const UPDATE_IMG_FILE: &str = "update-img.tar.zst";

/// HTTP request timeout for a manifest fetch.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    /// The manifest endpoint answered with something other than 200.
    #[error("Unexpected status_code={status} for the GET {url}")]
    BadStatus { status: u16, url: String },

    /// The manifest is malformed or does not list the requested file.
    #[error("Couldn't extract the sha256 of {filename} from {url}: {reason}")]
    Parse {
        filename: String,
        url: String,
        reason: String,
    },

    /// The request itself failed (DNS, connect, timeout, ...).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Checksum and download URL of one image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageChecksum {
    pub sha256: String,
    pub url: String,
}

/// The four disk images handed to the test-driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImages {
    pub guestos: ImageChecksum,
    pub guestos_update: ImageChecksum,
    pub boundary: ImageChecksum,
    pub boundary_snp: ImageChecksum,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a `sha256sum`-style manifest into a name → hex digest map.
///
/// Each non-empty line is `<hex> <name>`; a `*` binary-mode marker or a
/// second space before the name is accepted.
pub fn parse_manifest(text: &str) -> Result<HashMap<String, String>, String> {
    let mut hashes = HashMap::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let (hex, rest) = line
            .split_once(' ')
            .ok_or_else(|| format!("line {} has no file name: '{line}'", idx + 1))?;
        let name = rest
            .strip_prefix('*')
            .or_else(|| rest.strip_prefix(' '))
            .unwrap_or(rest);
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("line {} has an invalid digest: '{line}'", idx + 1));
        }
        if name.is_empty() {
            return Err(format!("line {} has an empty file name", idx + 1));
        }
        hashes.insert(name.to_string(), hex.to_string());
    }
    Ok(hashes)
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Fetches checksum manifests from the image proxy.
pub struct ChecksumResolver {
    client: reqwest::Client,
}

impl ChecksumResolver {
    pub fn new() -> Result<Self, ChecksumError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Look up `filename` in `<base_url>SHA256SUMS`.
    ///
    /// `base_url` must end with a slash. No retries are attempted.
    pub async fn resolve(
        &self,
        base_url: &str,
        filename: &str,
    ) -> Result<ImageChecksum, ChecksumError> {
        let manifest_url = format!("{base_url}{SHA256SUMS_FILE}");
        let response = self.client.get(&manifest_url).send().await?;
        let status = response.status();
        tracing::debug!(url = %manifest_url, status = status.as_u16(), "Fetched checksum manifest");

        if status != reqwest::StatusCode::OK {
            return Err(ChecksumError::BadStatus {
                status: status.as_u16(),
                url: manifest_url,
            });
        }

        let body = response.text().await?;
        let parse_error = |reason: String| ChecksumError::Parse {
            filename: filename.to_string(),
            url: manifest_url.clone(),
            reason,
        };
        let mut hashes = parse_manifest(&body).map_err(parse_error)?;
        let sha256 = hashes
            .remove(filename)
            .ok_or_else(|| parse_error(format!("no entry for {filename}")))?;

        Ok(ImageChecksum {
            sha256,
            url: format!("{base_url}{filename}"),
        })
    }

    /// Resolve all disk images of a run.
    ///
    /// The guest-os disk image comes from `guestos_version`, everything
    /// else from `ic_version`.
    pub async fn resolve_disk_images(
        &self,
        image_base_url: &str,
        ic_version: &str,
        guestos_version: &str,
    ) -> Result<DiskImages, ChecksumError> {
        let root = image_base_url.trim_end_matches('/');
        let guestos_base = format!("{root}/{guestos_version}");
        let img_base = format!("{root}/{ic_version}");

        Ok(DiskImages {
            guestos: self
                .resolve(&format!("{guestos_base}/guest-os/disk-img-dev/"), DISK_IMG_FILE)
                .await?,
            boundary: self
                .resolve(&format!("{img_base}/boundary-os/disk-img-dev/"), DISK_IMG_FILE)
                .await?,
            boundary_snp: self
                .resolve(&format!("{img_base}/boundary-os/disk-img-snp-dev/"), DISK_IMG_FILE)
                .await?,
            guestos_update: self
                .resolve(&format!("{img_base}/guest-os/update-img-dev/"), UPDATE_IMG_FILE)
                .await?,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
