use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// On-disk layout of everything docseek persists.
///
/// ```text
/// <root>/
///   text/                 full-text index directory
///   vectors/index.usearch vector index blob
///   vectors/metadata.json {metadata: {id: {...}}, next_id: N}
///   schema_version        field-set version marker
///   fingerprints.redb     scan fingerprint cache
/// ```
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir or the config file)
    /// 2. The DOCSEEK_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/docseek/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var("DOCSEEK_DATA_DIR") {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("docseek")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn text_dir(&self) -> PathBuf {
        self.root.join("text")
    }

    pub fn vector_dir(&self) -> PathBuf {
        self.root.join("vectors")
    }

    pub fn vector_index(&self) -> PathBuf {
        self.vector_dir().join("index.usearch")
    }

    pub fn vector_metadata(&self) -> PathBuf {
        self.vector_dir().join("metadata.json")
    }

    pub fn schema_version(&self) -> PathBuf {
        self.root.join("schema_version")
    }

    pub fn fingerprints_db(&self) -> PathBuf {
        self.root.join("fingerprints.redb")
    }
}

/// Write `bytes` to a sibling temporary file and atomically rename it over
/// `path`, so readers never see a half-written file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = temp_sibling(path);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// `foo/bar.json` -> `foo/bar.json.tmp`
pub fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Total size in bytes of a file, or of every file below a directory.
pub fn disk_usage(path: &Path) -> u64 {
    let Ok(meta) = std::fs::metadata(path) else {
        return 0;
    };
    if meta.is_file() {
        return meta.len();
    }
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| disk_usage(&e.path()))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_with_explicit_path() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();

        assert_eq!(dir.root(), tmp.path());
        assert_eq!(dir.text_dir(), tmp.path().join("text"));
        assert_eq!(
            dir.vector_metadata(),
            tmp.path().join("vectors").join("metadata.json")
        );
        assert_eq!(dir.fingerprints_db(), tmp.path().join("fingerprints.redb"));
    }

    #[test]
    fn resolve_creates_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        let dir = DataDir::resolve(Some(&nested)).unwrap();
        assert!(dir.root().is_dir());
    }

    #[test]
    fn write_atomic_replaces_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("meta.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        assert!(!temp_sibling(&path).exists());
    }

    #[test]
    fn disk_usage_sums_directory() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a"), [0u8; 10]).unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub").join("b"), [0u8; 5]).unwrap();

        assert_eq!(disk_usage(tmp.path()), 15);
        assert_eq!(disk_usage(&tmp.path().join("missing")), 0);
    }
}
