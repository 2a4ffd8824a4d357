//! Content library contract.
//!
//! Presets reference instructions, criteria and source documents by id. The
//! library turns an id into text; storage and editing of that content are
//! somebody else's problem.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Instructions,
    Criteria,
    Document,
}

impl ContentKind {
    /// Subdirectory used by [`DirectoryLibrary`].
    pub fn dir_name(self) -> &'static str {
        match self {
            ContentKind::Instructions => "instructions",
            ContentKind::Criteria => "criteria",
            ContentKind::Document => "documents",
        }
    }
}

/// Resolves content ids to text.
pub trait ContentLibrary: Send + Sync {
    fn resolve(&self, kind: ContentKind, id: &str) -> Option<String>;
}

/// Library backed by a map, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLibrary {
    entries: HashMap<(ContentKind, String), String>,
}

impl InMemoryLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: ContentKind, id: impl Into<String>, text: impl Into<String>) -> Self {
        self.insert(kind, id, text);
        self
    }

    pub fn insert(&mut self, kind: ContentKind, id: impl Into<String>, text: impl Into<String>) {
        self.entries.insert((kind, id.into()), text.into());
    }
}

impl ContentLibrary for InMemoryLibrary {
    fn resolve(&self, kind: ContentKind, id: &str) -> Option<String> {
        self.entries.get(&(kind, id.to_string())).cloned()
    }
}

/// Library reading files under `root/{instructions,criteria,documents}/`.
///
/// The id of a file is its path relative to the kind directory without the
/// extension, so `documents/guides/setup.md` resolves as `guides/setup`.
#[derive(Debug, Clone)]
pub struct DirectoryLibrary {
    root: PathBuf,
    index: HashMap<(ContentKind, String), PathBuf>,
}

impl DirectoryLibrary {
    /// Indexes every file below `root`. Missing kind directories are fine.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mut index = HashMap::new();

        for kind in [
            ContentKind::Instructions,
            ContentKind::Criteria,
            ContentKind::Document,
        ] {
            let base = root.join(kind.dir_name());
            for entry in WalkDir::new(&base)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                if let Some(id) = content_id(&base, entry.path()) {
                    index.insert((kind, id), entry.path().to_path_buf());
                }
            }
        }

        tracing::debug!(root = %root.display(), entries = index.len(), "Indexed content library");
        Self { root, index }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

fn content_id(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?.with_extension("");
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

impl ContentLibrary for DirectoryLibrary {
    fn resolve(&self, kind: ContentKind, id: &str) -> Option<String> {
        let path = self.index.get(&(kind, id.to_string()))?;
        match std::fs::read_to_string(path) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read content file");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_library() {
        let lib = InMemoryLibrary::new()
            .with(ContentKind::Criteria, "clarity", "Is it clear?")
            .with(ContentKind::Document, "intro", "Hello");

        assert_eq!(
            lib.resolve(ContentKind::Criteria, "clarity").as_deref(),
            Some("Is it clear?")
        );
        assert!(lib.resolve(ContentKind::Instructions, "clarity").is_none());
        assert!(lib.resolve(ContentKind::Document, "missing").is_none());
    }

    #[test]
    fn test_directory_library_ids() {
        let dir = tempfile::tempdir().unwrap();
        let docs = dir.path().join("documents").join("guides");
        std::fs::create_dir_all(&docs).unwrap();
        std::fs::write(docs.join("setup.md"), "Install it").unwrap();
        std::fs::create_dir_all(dir.path().join("criteria")).unwrap();
        std::fs::write(dir.path().join("criteria").join("tone.txt"), "Friendly").unwrap();

        let lib = DirectoryLibrary::open(dir.path());
        assert_eq!(lib.len(), 2);
        assert_eq!(
            lib.resolve(ContentKind::Document, "guides/setup").as_deref(),
            Some("Install it")
        );
        assert_eq!(
            lib.resolve(ContentKind::Criteria, "tone").as_deref(),
            Some("Friendly")
        );
        assert!(lib.resolve(ContentKind::Instructions, "tone").is_none());
    }

    #[test]
    fn test_directory_library_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let lib = DirectoryLibrary::open(dir.path().join("nope"));
        assert!(lib.is_empty());
    }
}
