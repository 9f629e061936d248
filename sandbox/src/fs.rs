use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use globset::GlobBuilder;
use tracing::instrument;
use walkdir::{DirEntry, WalkDir};

use crate::errors::{Result, SandboxError};
use crate::path::ProjectRoot;

pub const MAX_LISTED_FILES: usize = 100;
pub const NO_FILES_LISTED: &str = "No files found.";
pub const NO_FILES_MATCHED: &str = "No files found matching the pattern.";

const LISTING_IGNORE: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    "dist",
    "build",
    ".idea",
    ".vscode",
];
// Search still descends into editor directories.
const SEARCH_IGNORE: &[&str] = &[".git", "node_modules", "__pycache__", "dist", "build"];

/// Directory names that recursive walks never descend into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IgnoreSet {
    names: BTreeSet<String>,
}

impl IgnoreSet {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            names: names
                .into_iter()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect(),
        }
    }

    pub fn listing() -> Self {
        Self::new(LISTING_IGNORE.iter().map(|name| name.to_string()))
    }

    pub fn search() -> Self {
        Self::new(SEARCH_IGNORE.iter().map(|name| name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    fn prunes(&self, entry: &DirEntry) -> bool {
        entry.depth() > 0
            && entry.file_type().is_dir()
            && entry
                .file_name()
                .to_str()
                .map_or(false, |name| self.contains(name))
    }
}

#[derive(Clone, Debug)]
pub struct FsConfig {
    pub root: ProjectRoot,
    pub listing_ignore: IgnoreSet,
    pub search_ignore: IgnoreSet,
}

impl FsConfig {
    pub fn new(root: ProjectRoot) -> Self {
        Self {
            root,
            listing_ignore: IgnoreSet::listing(),
            search_ignore: IgnoreSet::search(),
        }
    }

    pub fn with_listing_ignore(mut self, ignore: IgnoreSet) -> Self {
        self.listing_ignore = ignore;
        self
    }

    pub fn with_search_ignore(mut self, ignore: IgnoreSet) -> Self {
        self.search_ignore = ignore;
        self
    }
}

/// Filesystem tools confined to the project root.
#[derive(Clone, Debug)]
pub struct SandboxFs {
    config: FsConfig,
}

impl SandboxFs {
    pub fn new(config: FsConfig) -> Self {
        Self { config }
    }

    pub fn root(&self) -> &ProjectRoot {
        &self.config.root
    }

    #[instrument(skip(self))]
    pub fn read_file(&self, relative: &str) -> Result<String> {
        let path = self.config.root.resolve(relative)?;
        fs::read_to_string(&path).map_err(|err| SandboxError::from_io(err, Path::new(relative)))
    }

    #[instrument(skip(self, content), fields(size = content.len()))]
    pub fn write_file(&self, relative: &str, content: &str) -> Result<String> {
        let path = self.config.root.resolve(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| SandboxError::from_io(err, parent))?;
        }
        fs::write(&path, content).map_err(|err| SandboxError::from_io(err, Path::new(relative)))?;
        Ok(format!("Successfully wrote to {relative}"))
    }

    #[instrument(skip(self))]
    pub fn list_files(&self, directory: &str, recursive: bool) -> Result<String> {
        let dir = self.config.root.resolve(directory)?;
        let files = if recursive {
            self.walk(&dir, directory, &self.config.listing_ignore, |_| true)?
        } else {
            immediate_files(&dir, directory)?
        };
        if files.is_empty() {
            return Ok(NO_FILES_LISTED.to_string());
        }
        Ok(cap_listing(files))
    }

    #[instrument(skip(self))]
    pub fn find_files_by_name(&self, pattern: &str) -> Result<String> {
        let matcher = GlobBuilder::new(&shell_pattern(pattern))
            .backslash_escape(false)
            .build()
            .map_err(|err| SandboxError::InvalidArguments(format!("invalid pattern: {err}")))?
            .compile_matcher();
        let base = self.config.root.resolve(".")?;
        let found = self.walk(&base, ".", &self.config.search_ignore, |entry| {
            matcher.is_match(Path::new(entry.file_name()))
        })?;
        if found.is_empty() {
            return Ok(NO_FILES_MATCHED.to_string());
        }
        Ok(found.join("\n"))
    }

    /// Depth-first walk of `base`: files of a directory come before its
    /// subdirectories, names sorted, ignored directories pruned before descent.
    fn walk(
        &self,
        base: &Path,
        requested: &str,
        ignore: &IgnoreSet,
        mut keep: impl FnMut(&DirEntry) -> bool,
    ) -> Result<Vec<String>> {
        if !base.is_dir() {
            return Err(SandboxError::NotFound(requested.to_string()));
        }
        let walker = WalkDir::new(base)
            .min_depth(1)
            .follow_links(false)
            .sort_by(|a, b| {
                let files_first = a.file_type().is_dir().cmp(&b.file_type().is_dir());
                files_first.then_with(|| a.file_name().cmp(b.file_name()))
            })
            .into_iter()
            .filter_entry(|entry| !ignore.prunes(entry));

        let mut files = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|err| {
                let path = err.path().map(Path::to_path_buf).unwrap_or_default();
                match err.into_io_error() {
                    Some(io) => SandboxError::from_io(io, &path),
                    None => SandboxError::Io(std::io::Error::other("filesystem loop detected")),
                }
            })?;
            if entry.file_type().is_dir() || (entry.path_is_symlink() && entry.path().is_dir()) {
                continue;
            }
            if keep(&entry) {
                files.push(relative_display(entry.path(), base));
            }
        }
        Ok(files)
    }
}

/// Rewrites a shell-style name pattern into globset syntax.
///
/// Only `*`, `?` and closed `[...]` classes are special. Braces and an
/// unclosed `[` match themselves, backslashes are literal.
fn shell_pattern(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len());
    let mut idx = 0;
    while idx < chars.len() {
        match chars[idx] {
            '*' => {
                out.push('*');
                while chars.get(idx + 1) == Some(&'*') {
                    idx += 1;
                }
            }
            '[' => match class_end(&chars, idx) {
                Some(end) => {
                    out.extend(&chars[idx..=end]);
                    idx = end;
                }
                None => out.push_str("[[]"),
            },
            '{' => out.push_str("[{]"),
            '}' => out.push_str("[}]"),
            other => out.push(other),
        }
        idx += 1;
    }
    out
}

/// Index of the `]` closing the class opened at `start`. A `]` right after
/// `[` or `[!` is part of the class.
fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut idx = start + 1;
    if chars.get(idx) == Some(&'!') {
        idx += 1;
    }
    if chars.get(idx) == Some(&']') {
        idx += 1;
    }
    chars[idx.min(chars.len())..]
        .iter()
        .position(|&c| c == ']')
        .map(|offset| idx + offset)
}

fn immediate_files(dir: &Path, requested: &str) -> Result<Vec<String>> {
    let reader = fs::read_dir(dir).map_err(|err| SandboxError::from_io(err, Path::new(requested)))?;
    let mut names = Vec::new();
    for entry in reader {
        let entry = entry?;
        if entry.path().is_dir() {
            continue;
        }
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

fn cap_listing(files: Vec<String>) -> String {
    let total = files.len();
    if total <= MAX_LISTED_FILES {
        return files.join("\n");
    }
    let mut output = files[..MAX_LISTED_FILES].join("\n");
    output.push_str(&format!("\n... (Total {total} files, truncated)"));
    output
}

fn relative_display(path: &Path, base: &Path) -> String {
    let relative: PathBuf = path.strip_prefix(base).unwrap_or(path).to_path_buf();
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
