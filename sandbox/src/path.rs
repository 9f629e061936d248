use std::collections::VecDeque;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::errors::{Result, SandboxError};

pub const TARGET_ROOT_ENV: &str = "TARGET_PROJECT_ROOT";

const MAX_SYMLINK_HOPS: usize = 40;

/// The directory every sandboxed operation is confined to.
///
/// Holds the canonical form of the configured root, or nothing when the
/// process was started without one. Cloning is cheap enough to hand out per
/// blocking task.
#[derive(Clone, Debug)]
pub struct ProjectRoot {
    canonical: Option<PathBuf>,
}

impl ProjectRoot {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if root.is_relative() {
            return Err(SandboxError::InvalidArguments(
                "project root must be absolute".to_string(),
            ));
        }
        let canonical = fs::canonicalize(root).map_err(|err| SandboxError::from_io(err, root))?;
        if !canonical.is_dir() {
            return Err(SandboxError::InvalidArguments(format!(
                "project root '{}' is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            canonical: Some(canonical),
        })
    }

    pub fn unset() -> Self {
        Self { canonical: None }
    }

    pub fn is_set(&self) -> bool {
        self.canonical.is_some()
    }

    pub fn path(&self) -> Result<&Path> {
        self.canonical.as_deref().ok_or_else(|| {
            SandboxError::Configuration(format!("{TARGET_ROOT_ENV} is not configured"))
        })
    }

    /// Resolves `relative` against the root and rejects anything that lands outside it.
    pub fn resolve(&self, relative: impl AsRef<Path>) -> Result<PathBuf> {
        let base = self.path()?;
        let relative = relative.as_ref();
        let escape = || SandboxError::PathEscape(relative.display().to_string());
        let resolved = canonicalize_lenient(&base.join(relative)).ok_or_else(escape)?;
        if !resolved.starts_with(base) {
            return Err(escape());
        }
        Ok(resolved)
    }
}

/// Canonicalizes the longest existing prefix of `path` and resolves the rest
/// lexically, so paths that do not exist yet (write targets) still normalize.
///
/// Symlinks whose target is missing are still followed, so a dangling link
/// resolves to where a write through it would land. Returns `None` when a
/// link cannot be read or the chain is too long.
fn canonicalize_lenient(path: &Path) -> Option<PathBuf> {
    let mut pending = split_components(path);
    let mut resolved = PathBuf::new();
    let mut hops = 0;
    while let Some(part) = pending.pop_front() {
        match part.components().next() {
            Some(Component::Prefix(_)) | Some(Component::RootDir) => resolved.push(&part),
            Some(Component::ParentDir) => {
                resolved.pop();
            }
            Some(Component::Normal(name)) => {
                resolved.push(name);
                if let Ok(real) = fs::canonicalize(&resolved) {
                    resolved = real;
                    continue;
                }
                let is_link = fs::symlink_metadata(&resolved)
                    .map(|meta| meta.file_type().is_symlink())
                    .unwrap_or(false);
                if !is_link {
                    continue;
                }
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return None;
                }
                let target = fs::read_link(&resolved).ok()?;
                resolved.pop();
                // Relative targets continue from the link's parent.
                for component in split_components(&target).into_iter().rev() {
                    pending.push_front(component);
                }
            }
            Some(Component::CurDir) | None => {}
        }
    }
    Some(resolved)
}

fn split_components(path: &Path) -> VecDeque<PathBuf> {
    path.components()
        .map(|component| PathBuf::from(component.as_os_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn root_in(temp: &TempDir) -> ProjectRoot {
        ProjectRoot::new(temp.path()).expect("valid root")
    }

    #[test]
    fn resolves_nested_paths_inside_root() {
        let temp = TempDir::new().unwrap();
        let root = root_in(&temp);
        let base = root.path().unwrap().to_path_buf();

        assert_eq!(root.resolve("src/main.rs").unwrap(), base.join("src/main.rs"));
        assert_eq!(root.resolve("./a/./b/../c.txt").unwrap(), base.join("a/c.txt"));
        assert_eq!(root.resolve(".").unwrap(), base);
        assert_eq!(root.resolve("").unwrap(), base);
    }

    #[test]
    fn rejects_parent_traversal() {
        let temp = TempDir::new().unwrap();
        let root = root_in(&temp);

        for candidate in ["..", "../evil.txt", "a/../../evil.txt", "missing/../../../etc/passwd"] {
            let err = root.resolve(candidate).unwrap_err();
            assert!(
                matches!(err, SandboxError::PathEscape(_)),
                "{candidate} should escape, got {err:?}"
            );
        }
    }

    #[test]
    fn absolute_requests_must_stay_inside_root() {
        let temp = TempDir::new().unwrap();
        let root = root_in(&temp);
        let base = root.path().unwrap().to_path_buf();

        let inside = base.join("notes.md");
        assert_eq!(root.resolve(&inside).unwrap(), inside);
        assert!(matches!(
            root.resolve("/etc/passwd"),
            Err(SandboxError::PathEscape(_))
        ));
    }

    #[test]
    fn sibling_with_shared_prefix_is_outside() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("base");
        let evil = temp.path().join("base-evil");
        fs::create_dir_all(&base).unwrap();
        fs::create_dir_all(&evil).unwrap();
        fs::write(evil.join("file"), "secret").unwrap();

        let root = ProjectRoot::new(&base).unwrap();
        assert!(matches!(
            root.resolve("../base-evil/file"),
            Err(SandboxError::PathEscape(_))
        ));
        assert!(matches!(
            root.resolve(evil.join("file")),
            Err(SandboxError::PathEscape(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_pointing_outside_is_rejected() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("project");
        let outside = temp.path().join("outside");
        fs::create_dir_all(&base).unwrap();
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, base.join("link")).unwrap();

        let root = ProjectRoot::new(&base).unwrap();
        assert!(matches!(
            root.resolve("link/secret.txt"),
            Err(SandboxError::PathEscape(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_is_followed_before_the_prefix_check() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("project");
        let outside = temp.path().join("outside");
        fs::create_dir_all(&base).unwrap();
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(outside.join("pwned.txt"), base.join("link.txt")).unwrap();
        std::os::unix::fs::symlink("../outside/later", base.join("rel-link")).unwrap();

        let root = ProjectRoot::new(&base).unwrap();
        assert!(matches!(
            root.resolve("link.txt"),
            Err(SandboxError::PathEscape(_))
        ));
        assert!(matches!(
            root.resolve("rel-link/file.txt"),
            Err(SandboxError::PathEscape(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_inside_root_resolves_to_its_target() {
        let temp = TempDir::new().unwrap();
        let root = root_in(&temp);
        let base = root.path().unwrap().to_path_buf();
        std::os::unix::fs::symlink("drafts/new.txt", base.join("alias.txt")).unwrap();

        assert_eq!(root.resolve("alias.txt").unwrap(), base.join("drafts/new.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_loop_is_rejected() {
        let temp = TempDir::new().unwrap();
        let root = root_in(&temp);
        let base = root.path().unwrap().to_path_buf();
        std::os::unix::fs::symlink("b", base.join("a")).unwrap();
        std::os::unix::fs::symlink("a", base.join("b")).unwrap();

        assert!(matches!(
            root.resolve("a/file.txt"),
            Err(SandboxError::PathEscape(_))
        ));
    }

    #[test]
    fn unset_root_is_a_configuration_error() {
        let root = ProjectRoot::unset();
        let err = root.resolve("anything").unwrap_err();
        assert!(
            matches!(err, SandboxError::Configuration(ref msg) if msg.contains(TARGET_ROOT_ENV))
        );
    }

    #[test]
    fn relative_root_is_rejected() {
        assert!(ProjectRoot::new("relative/dir").is_err());
    }
}
