use std::path::PathBuf;

use crate::error::{HarnessError, Result};

/// A built bootable image pair, produced by the external build component.
///
/// The harness treats both paths as opaque input: the only check performed
/// is existence. What is inside the image (packages, init system) is the
/// builder's concern.
#[derive(Debug, Clone)]
pub struct ImageArtifact {
    /// Kernel image path (`vmlinuz`/`Image`).
    pub kernel: PathBuf,
    /// Root filesystem image path.
    pub rootfs: PathBuf,
}

impl ImageArtifact {
    #[must_use]
    pub fn new(kernel: impl Into<PathBuf>, rootfs: impl Into<PathBuf>) -> Self {
        Self {
            kernel: kernel.into(),
            rootfs: rootfs.into(),
        }
    }

    /// Check that both image files exist on disk.
    pub fn validate(&self) -> Result<()> {
        if !self.kernel.is_file() {
            return Err(HarnessError::LaunchFailed(format!(
                "kernel image not found: {}",
                self.kernel.display()
            )));
        }
        if !self.rootfs.is_file() {
            return Err(HarnessError::LaunchFailed(format!(
                "root filesystem image not found: {}",
                self.rootfs.display()
            )));
        }
        Ok(())
    }
}
