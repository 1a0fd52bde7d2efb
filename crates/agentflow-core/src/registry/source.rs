//! Where descriptor documents come from.

use std::path::{Path, PathBuf};

use crate::domain::error::{OrchestrationError, Result};

/// One raw descriptor document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorDocument {
    /// Path or name used in error messages.
    pub origin: String,
    pub text: String,
}

/// A provider of descriptor documents.
pub trait DescriptorSource: Send + Sync {
    /// Human-readable name of the source.
    fn name(&self) -> String;

    /// All documents, in a stable order.
    fn documents(&self) -> Result<Vec<DescriptorDocument>>;
}

/// Every `*.md` file directly inside a directory, sorted by file name.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl DescriptorSource for DirectorySource {
    fn name(&self) -> String {
        self.dir.display().to_string()
    }

    fn documents(&self) -> Result<Vec<DescriptorDocument>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            OrchestrationError::invalid_descriptor(self.name(), format!("cannot read directory: {e}"))
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "md") {
                paths.push(path);
            }
        }
        paths.sort();

        paths
            .into_iter()
            .map(|path| {
                let text = std::fs::read_to_string(&path)?;
                Ok(DescriptorDocument {
                    origin: path.display().to_string(),
                    text,
                })
            })
            .collect()
    }
}

/// Named in-memory documents.
#[derive(Debug, Clone, Default)]
pub struct InlineSource {
    docs: Vec<DescriptorDocument>,
}

impl InlineSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, origin: impl Into<String>, text: impl Into<String>) -> Self {
        self.docs.push(DescriptorDocument {
            origin: origin.into(),
            text: text.into(),
        });
        self
    }
}

impl DescriptorSource for InlineSource {
    fn name(&self) -> String {
        "inline".to_string()
    }

    fn documents(&self) -> Result<Vec<DescriptorDocument>> {
        Ok(self.docs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_source_reads_only_markdown_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.md"), "B").unwrap();
        std::fs::write(dir.path().join("a.md"), "A").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::create_dir(dir.path().join("nested.md")).unwrap();

        let docs = DirectorySource::new(dir.path()).documents().unwrap();
        let texts: Vec<&str> = docs.iter().map(|d| d.text.as_str()).collect();
        assert_eq!(texts, vec!["A", "B"]);
        assert!(docs[0].origin.ends_with("a.md"));
    }

    #[test]
    fn test_missing_directory_is_invalid_descriptor() {
        let err = DirectorySource::new("/definitely/not/here").documents().unwrap_err();
        assert_eq!(err.kind(), crate::domain::ErrorKind::InvalidDescriptor);
    }
}
