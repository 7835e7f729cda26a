//! The failure journal: a markdown document organized into `# ` sections.
//!
//! The supervisor only ever asks the journal to "append this under section X".
//! Everything about the on-disk text belongs here:
//!
//! ```text
//! <journal-path>          # e.g. ~/.steward/journal.md
//!   # Command Recovery
//!   ## 2026-10-16 09:12:44 UTC [steward] recovery
//!   ...
//! ```
//!
//! The file is read, edited and rewritten on every append; there is no cached
//! handle. Writes land in a sibling temp file that is renamed over the target,
//! so a crash mid-write leaves the previous document intact.

mod document;
mod entry;

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

pub use document::Document;
pub use entry::JournalEntry;

/// Errors that can occur while reading or amending the journal.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to replace {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },
}

pub type Result<T> = core::result::Result<T, JournalError>;

/// Anything that can take a section-scoped append.
///
/// The tracker depends on this seam rather than on a file, so its recovery
/// logging can be exercised without touching disk.
pub trait Journal: Send + Sync {
    /// Insert `entry` at the end of the section titled `section`,
    /// creating the section at the end of the document if it doesn't exist.
    fn append_under_section(&self, section: &str, entry: &str) -> Result<()>;
}

/// A journal backed by a single markdown file.
#[derive(Debug, Clone)]
pub struct MarkdownJournal {
    path: PathBuf,
}

impl MarkdownJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads and parses the journal document.
    ///
    /// A missing file is an empty document.
    pub fn load(&self) -> Result<Document> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Document::parse(&text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Document::default()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn store(&self, document: &Document) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|e| self.io_error(e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| self.io_error(e))?;
        tmp.write_all(document.render().as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| self.io_error(e))?;
        tmp.persist(&self.path).map_err(|source| JournalError::Persist {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    fn io_error(&self, source: io::Error) -> JournalError {
        JournalError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl Journal for MarkdownJournal {
    fn append_under_section(&self, section: &str, entry: &str) -> Result<()> {
        let mut document = self.load()?;
        document.append_under_section(section, entry);
        self.store(&document)?;
        tracing::debug!(path = %self.path.display(), section, "journal amended");
        Ok(())
    }
}
