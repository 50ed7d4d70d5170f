//! Which paths ingestion ignores. Shared by the scanner and the monitor.

use std::{
    io::Read,
    path::{Component, Path},
};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::{
    config::DEFAULT_EXTENSIONS,
    error::{Error, Result},
};

/// Names ignored anywhere in a path: VCS metadata, editor state, caches.
pub const DEFAULT_IGNORED_NAMES: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    "__pycache__",
    ".idea",
    ".vscode",
    "node_modules",
    "venv",
    "env",
    ".DS_Store",
    "Thumbs.db",
    ".cache",
];

/// Temporary and backup file suffixes.
pub const DEFAULT_IGNORED_SUFFIXES: &[&str] =
    &[".tmp", ".temp", ".bak", ".swp", "~"];

/// Office lock files start with this.
const LOCK_FILE_PREFIX: &str = "~$";

const EXECUTABLE_MAGIC: &[&[u8]] = &[
    b"MZ\x90\x00",
    b"\x7fELF",
    b"\xfe\xed\xfa\xce",
    b"\xfe\xed\xfa\xcf",
    b"\xce\xfa\xed\xfe",
    b"\xcf\xfa\xed\xfe",
];

/// Exclusion rules: user glob patterns plus the built-in defaults.
///
/// Patterns are matched against the whole path and against every single
/// path component, so `node_modules` and `**/build/**` both work.
#[derive(Debug, Clone)]
pub struct ExcludeRules {
    globs: GlobSet,
    defaults: bool,
}

impl Default for ExcludeRules {
    fn default() -> Self {
        Self {
            globs: GlobSet::empty(),
            defaults: true,
        }
    }
}

impl ExcludeRules {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                Error::Config(format!("exclude pattern {pattern:?}: {e}"))
            })?;
            builder.add(glob);
        }
        let globs = builder
            .build()
            .map_err(|e| Error::Config(format!("exclude patterns: {e}")))?;
        Ok(Self {
            globs,
            defaults: true,
        })
    }

    /// Rules without the built-in defaults.
    pub fn without_defaults(mut self) -> Self {
        self.defaults = false;
        self
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        let full = path.to_string_lossy().replace('\\', "/");
        if self.globs.is_match(&full) {
            return true;
        }
        for component in path.components() {
            let Component::Normal(name) = component else {
                continue;
            };
            let name = name.to_string_lossy();
            if self.globs.is_match(name.as_ref()) {
                return true;
            }
            if self.defaults && is_default_ignored(&name) {
                return true;
            }
        }
        false
    }
}

fn is_default_ignored(name: &str) -> bool {
    DEFAULT_IGNORED_NAMES.contains(&name)
        || name.starts_with(LOCK_FILE_PREFIX)
        || DEFAULT_IGNORED_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Whether any component of `path` below `root` is a dotfile or
/// dot-directory.
pub fn is_hidden(path: &Path, root: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.components().any(|c| match c {
        Component::Normal(name) => name.to_string_lossy().starts_with('.'),
        _ => false,
    })
}

/// System-file heuristic.
///
/// Hidden paths are always system files. Known document extensions are
/// trusted without reading the file; anything else is a system file when
/// its first bytes carry a native executable signature.
pub fn is_system_file(path: &Path, root: &Path) -> bool {
    if is_hidden(path, root) {
        return true;
    }
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if DEFAULT_EXTENSIONS.contains(&ext.as_str()) {
        return false;
    }
    has_executable_header(path)
}

fn has_executable_header(path: &Path) -> bool {
    let mut head = [0u8; 4];
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    match file.read_exact(&mut head) {
        Ok(()) => EXECUTABLE_MAGIC.iter().any(|m| head == **m),
        Err(_) => false,
    }
}
