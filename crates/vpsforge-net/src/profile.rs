//! Baseline firewall profile attached to new guests.
//!
//! The hypervisor reads per-guest firewall options from
//! `<profile_dir>/<id>.fw`. A new guest gets a copy of the baseline file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use vpsforge_common::config::ForgeConfig;
use vpsforge_common::error::{ForgeError, Result};
use vpsforge_common::types::ContainerId;

/// Copies the baseline profile onto guests.
#[derive(Debug, Clone)]
pub struct BaselineProfile {
    profile_dir: PathBuf,
    baseline: PathBuf,
}

impl BaselineProfile {
    /// Uses `profile_dir/baseline` as the source profile.
    #[must_use]
    pub fn new(profile_dir: impl Into<PathBuf>, baseline: &str) -> Self {
        let profile_dir = profile_dir.into();
        let baseline = profile_dir.join(baseline);
        Self {
            profile_dir,
            baseline,
        }
    }

    /// Creates the profile writer from the `firewall` section.
    #[must_use]
    pub fn from_config(config: &ForgeConfig) -> Self {
        Self::new(
            &config.firewall.profile_dir,
            &config.firewall.baseline_profile,
        )
    }

    /// Path of the profile belonging to `id`.
    #[must_use]
    pub fn path_for(&self, id: ContainerId) -> PathBuf {
        self.profile_dir.join(format!("{id}.fw"))
    }

    /// Writes the baseline onto `id`. Rewriting an identical profile is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the baseline cannot be read or the guest
    /// profile cannot be written.
    pub fn apply(&self, id: ContainerId) -> Result<PathBuf> {
        let content = std::fs::read(&self.baseline).map_err(|e| io(&self.baseline, e))?;
        let target = self.path_for(id);
        if target == self.baseline {
            return Ok(target);
        }
        match std::fs::read(&target) {
            Ok(existing) if existing == content => {
                tracing::debug!(id = %id, "baseline profile already in place");
                return Ok(target);
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io(&target, e)),
        }
        std::fs::write(&target, content).map_err(|e| io(&target, e))?;
        tracing::info!(id = %id, path = %target.display(), "baseline profile applied");
        Ok(target)
    }

    /// Returns whether `id` has a profile.
    #[must_use]
    pub fn is_applied(&self, id: ContainerId) -> bool {
        self.path_for(id).exists()
    }

    /// Removes the profile of `id`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove(&self, id: ContainerId) -> Result<()> {
        let target = self.path_for(id);
        if target == self.baseline {
            return Ok(());
        }
        match std::fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io(&target, e)),
        }
    }
}

fn io(path: &Path, source: std::io::Error) -> ForgeError {
    ForgeError::Io {
        path: path.to_path_buf(),
        source,
    }
}
