//! File catalog: the names a server offers and their sizes.
//!
//! Loaded from a flat text file, one `<name> <size>` entry per line. The
//! size is the last whitespace-separated token, so names may contain
//! spaces. Sizes take an optional `B`, `KB`, `MB` or `GB` suffix (binary
//! multiples). Each name resolves to `<files_dir>/<name>`; when that file
//! exists, its length on disk wins over the declared size.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const CATALOG_HEADER: &str = "# ridge catalog: <file name> <size>, e.g. `report.pdf 2MB`\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub size: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl Catalog {
    /// Load the catalog at `list_path`, creating an empty one if missing.
    pub fn load(list_path: &Path, files_dir: &Path) -> Result<Self> {
        if !list_path.exists() {
            if let Some(parent) = list_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            std::fs::write(list_path, CATALOG_HEADER)
                .with_context(|| format!("failed to create catalog: {}", list_path.display()))?;
            tracing::warn!(path = %list_path.display(), "catalog missing, created an empty one");
        }

        let text = std::fs::read_to_string(list_path)
            .with_context(|| format!("failed to read catalog: {}", list_path.display()))?;
        let mut catalog = Self::parse(&text, files_dir);
        catalog.resolve_disk_sizes();

        tracing::info!(
            path = %list_path.display(),
            files = catalog.len(),
            "catalog loaded"
        );
        Ok(catalog)
    }

    /// Parse catalog text. Bad lines are logged and skipped.
    pub fn parse(text: &str, files_dir: &Path) -> Self {
        let mut entries = BTreeMap::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((name, size)) = line.rsplit_once(char::is_whitespace) else {
                tracing::warn!(line = lineno + 1, "catalog line has no size, skipping");
                continue;
            };
            let name = name.split_whitespace().collect::<Vec<_>>().join(" ");

            let Some(size) = parse_size(size) else {
                tracing::warn!(line = lineno + 1, size, "unparseable size, skipping");
                continue;
            };
            if !is_plain_name(&name) {
                tracing::warn!(line = lineno + 1, name, "name must not contain a path, skipping");
                continue;
            }

            let path = files_dir.join(&name);
            entries.insert(name, CatalogEntry { size, path });
        }

        Self { entries }
    }

    /// Build a catalog directly from entries.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, CatalogEntry)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    fn resolve_disk_sizes(&mut self) {
        for (name, entry) in self.entries.iter_mut() {
            match std::fs::metadata(&entry.path) {
                Ok(meta) if meta.is_file() => {
                    if meta.len() != entry.size {
                        tracing::warn!(
                            name,
                            declared = entry.size,
                            on_disk = meta.len(),
                            "catalog size differs from file, using on-disk size"
                        );
                        entry.size = meta.len();
                    }
                }
                _ => tracing::warn!(name, path = %entry.path.display(), "catalog entry has no file"),
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.get(name)
    }

    pub fn size_of(&self, name: &str) -> Option<u64> {
        self.lookup(name).map(|e| e.size)
    }

    /// Name → size, as sent in a LIST reply.
    pub fn listing(&self) -> BTreeMap<String, u64> {
        self.entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.size))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse `123`, `10KB`, `5MB`, `1GB` (case-insensitive, binary multiples).
pub fn parse_size(s: &str) -> Option<u64> {
    let upper = s.trim().to_ascii_uppercase();
    let (digits, multiplier) = if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("KB") {
        (n, 1024)
    } else if let Some(n) = upper.strip_suffix('B') {
        (n, 1)
    } else {
        (upper.as_str(), 1)
    };
    digits.trim().parse::<u64>().ok()?.checked_mul(multiplier)
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}
