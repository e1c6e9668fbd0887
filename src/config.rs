//! Data-directory layout and recognized environment inputs.
//!
//! Everything persistent lives under one data directory: the SQLite file,
//! a `scripts/` subdirectory for user feed scripts, and a `cache/`
//! subdirectory for media artifacts (managed outside the core).

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Resolved filesystem layout for one gleaner instance.
#[derive(Debug, Clone)]
pub struct DataDirs {
    pub root: PathBuf,
    pub db_path: PathBuf,
    pub scripts_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl DataDirs {
    /// Layout rooted at an explicit directory.
    pub fn at(root: PathBuf) -> Self {
        Self {
            db_path: root.join("gleaner.db"),
            scripts_dir: root.join("scripts"),
            cache_dir: root.join("cache"),
            root,
        }
    }

    /// Resolve the data directory: `DATA_DIR` wins, else
    /// `~/.config/gleaner`.
    pub fn resolve() -> Result<Self> {
        if let Ok(dir) = std::env::var("DATA_DIR") {
            if !dir.is_empty() {
                return Ok(Self::at(PathBuf::from(dir)));
            }
        }

        let home = std::env::var("HOME").context("HOME environment variable not set")?;
        Ok(Self::at(PathBuf::from(home).join(".config").join("gleaner")))
    }

    /// Create the directory tree, locked down to the owning user on unix.
    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.root, &self.scripts_dir, &self.cache_dir] {
            if !dir.exists() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                match std::fs::metadata(dir) {
                    Ok(metadata) => {
                        let mut perms = metadata.permissions();
                        perms.set_mode(0o700);
                        if let Err(e) = std::fs::set_permissions(dir, perms) {
                            tracing::warn!(
                                path = %dir.display(),
                                error = %e,
                                "Failed to set directory permissions to 0700"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %dir.display(),
                            error = %e,
                            "Failed to read directory metadata"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

/// Environment inputs the core recognizes. `HOST`/`PORT` are consumed by
/// the embedding server, but the core parses and reports them so a bad
/// value fails loudly at startup instead of inside the transport layer.
#[derive(Debug, Clone, Default)]
pub struct RuntimeEnv {
    /// `DEBUG` set to anything non-empty enables verbose logging
    pub debug: bool,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl RuntimeEnv {
    pub fn from_env() -> Result<Self> {
        let debug = std::env::var("DEBUG").map(|v| !v.is_empty()).unwrap_or(false);
        let host = std::env::var("HOST").ok().filter(|h| !h.is_empty());
        let port = match std::env::var("PORT") {
            Ok(raw) if !raw.is_empty() => Some(
                raw.parse::<u16>()
                    .with_context(|| format!("PORT is not a valid port number: {:?}", raw))?,
            ),
            _ => None,
        };

        Ok(Self { debug, host, port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_under_root() {
        let dirs = DataDirs::at(PathBuf::from("/tmp/gleaner-test"));
        assert_eq!(dirs.db_path, PathBuf::from("/tmp/gleaner-test/gleaner.db"));
        assert_eq!(dirs.scripts_dir, PathBuf::from("/tmp/gleaner-test/scripts"));
        assert_eq!(dirs.cache_dir, PathBuf::from("/tmp/gleaner-test/cache"));
    }

    #[test]
    fn test_ensure_creates_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DataDirs::at(tmp.path().join("data"));
        dirs.ensure().unwrap();
        assert!(dirs.scripts_dir.is_dir());
        assert!(dirs.cache_dir.is_dir());
    }
}
