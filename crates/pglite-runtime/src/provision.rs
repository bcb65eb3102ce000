use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use rand::RngCore;
use tar::Archive;

use crate::error::ProvisionError;

/// Present once the bundle has been extracted and the data directory exists.
pub const MARKER_PATH: &str = "pglite/base/PG_VERSION";
/// Guest executable, relative to the temp directory.
pub const IMAGE_PATH: &str = "pglite/bin/postgres.wasi";
/// Random source the guest reads through its `/dev` mount.
pub const URANDOM_FILE: &str = "urandom";
pub const URANDOM_LEN: usize = 128;

/// Lays out the guest's root filesystem and hands back its executable image.
///
/// Implementations must be idempotent: calling `provision` repeatedly with the
/// same directories only redoes work that is meant to be fresh on every run.
pub trait Provisioner: Send + Sync {
    fn provision(&self, tmp_dir: &Path, dev_dir: &Path) -> Result<Vec<u8>, ProvisionError>;
}

/// Where the gzip'd tar bundle comes from.
#[derive(Debug, Clone)]
pub enum AssetBundle {
    /// Bytes baked into the binary.
    Static(&'static [u8]),
    /// Read from disk, only when an extraction is actually needed.
    File(PathBuf),
    /// Only usable against an already-extracted temp directory.
    None,
}

#[cfg(feature = "embedded-bundle")]
pub static EMBEDDED_BUNDLE: &[u8] = include_bytes!(env!("PGLITE_BUNDLE"));

impl AssetBundle {
    /// The bundle compiled into this binary, if any.
    pub fn embedded() -> Self {
        #[cfg(feature = "embedded-bundle")]
        {
            Self::Static(EMBEDDED_BUNDLE)
        }
        #[cfg(not(feature = "embedded-bundle"))]
        {
            Self::None
        }
    }
}

/// [`Provisioner`] that unpacks a tar.gz bundle into the temp directory.
///
/// Layout after a successful pass:
/// ```text
/// {tmp_dir}/
///   pglite/base/PG_VERSION   - extraction marker
///   pglite/bin/postgres.wasi - guest image
///   ...                      - rest of the bundle
/// {dev_dir}/
///   urandom                  - 128 fresh random bytes
/// ```
pub struct BundleProvisioner {
    bundle: AssetBundle,
}

impl BundleProvisioner {
    pub fn new(bundle: AssetBundle) -> Self {
        Self { bundle }
    }

    fn extract(&self, tmp_dir: &Path) -> Result<(), ProvisionError> {
        match &self.bundle {
            AssetBundle::Static(bytes) => unpack_bundle(bytes, tmp_dir),
            AssetBundle::File(path) => {
                let bytes = std::fs::read(path)?;
                unpack_bundle(&bytes, tmp_dir)
            }
            AssetBundle::None => Err(ProvisionError::BundleUnavailable(tmp_dir.to_path_buf())),
        }
    }
}

impl Provisioner for BundleProvisioner {
    fn provision(&self, tmp_dir: &Path, dev_dir: &Path) -> Result<Vec<u8>, ProvisionError> {
        if tmp_dir.join(MARKER_PATH).exists() {
            tracing::debug!(tmp_dir = %tmp_dir.display(), "Guest filesystem already extracted");
        } else {
            tracing::info!(tmp_dir = %tmp_dir.display(), "Extracting guest bundle");
            std::fs::create_dir_all(tmp_dir)?;
            self.extract(tmp_dir)?;
        }

        seed_urandom(dev_dir)?;

        let image_path = tmp_dir.join(IMAGE_PATH);
        std::fs::read(&image_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ProvisionError::MissingImage(image_path),
            _ => ProvisionError::Io(e),
        })
    }
}

/// Unpack a tar.gz bundle under `dest`.
///
/// Only directories, regular files and symlinks are accepted.
pub fn unpack_bundle(bytes: &[u8], dest: &Path) -> Result<(), ProvisionError> {
    let mut archive = Archive::new(GzDecoder::new(bytes));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();
        let path = entry.path()?.display().to_string();

        if !(kind.is_dir() || kind.is_file() || kind.is_symlink()) {
            return Err(ProvisionError::UnsupportedEntry {
                kind: format!("{kind:?}"),
                path,
            });
        }

        if !entry.unpack_in(dest)? {
            return Err(ProvisionError::UnsafePath(path));
        }
    }

    Ok(())
}

/// Rewrite `{dev_dir}/urandom` with fresh random bytes.
pub fn seed_urandom(dev_dir: &Path) -> Result<(), ProvisionError> {
    std::fs::create_dir_all(dev_dir)?;

    let mut seed = [0u8; URANDOM_LEN];
    rand::thread_rng().fill_bytes(&mut seed);

    let mut file = std::fs::File::create(dev_dir.join(URANDOM_FILE))?;
    file.write_all(&seed)?;
    Ok(())
}
