use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::data::PriceFrame;
use crate::error::{EngineError, EngineResult};
use crate::sandbox::{self, CODE_FILE, CONFIG_FILE, DATA_FILE};

/// A per-worker directory under the memory-backed scratch root. The
/// directory lives as long as its worker; contents live as long as one
/// lease.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Create a fresh scratch directory under `root`.
    pub fn create(root: &Path) -> std::io::Result<Self> {
        let path = root.join(format!("cell_{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove every file and subdirectory, keeping the directory itself.
    /// The first failure is returned so the pool can condemn the worker.
    pub fn clear(&self) -> std::io::Result<()> {
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let target = entry.path();
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(&target)?;
            } else {
                std::fs::remove_file(&target)?;
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> std::io::Result<bool> {
        Ok(std::fs::read_dir(&self.path)?.next().is_none())
    }

    /// Remove the directory entirely. Failures are logged, not
    /// propagated: the backing tmpfs disappears with the host anyway.
    pub fn destroy(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove scratch dir");
        }
    }
}

/// Write the three inputs of one execution into a leased scratch
/// directory. All three must land before the runtime is invoked;
/// partial state after an error is fine because release empties the
/// directory.
pub fn stage_inputs(
    scratch: &Path,
    code: &str,
    frame: &PriceFrame,
    params: &HashMap<String, f64>,
) -> EngineResult<()> {
    let encoded = frame
        .to_parquet_bytes()
        .map_err(|e| EngineError::Staging(format!("frame encode: {e:#}")))?;

    std::fs::write(scratch.join(CODE_FILE), code)
        .map_err(|e| EngineError::Staging(format!("{CODE_FILE}: {e}")))?;
    std::fs::write(scratch.join(DATA_FILE), encoded)
        .map_err(|e| EngineError::Staging(format!("{DATA_FILE}: {e}")))?;
    std::fs::write(scratch.join(CONFIG_FILE), sandbox::format_params(params))
        .map_err(|e| EngineError::Staging(format!("{CONFIG_FILE}: {e}")))?;

    Ok(())
}
