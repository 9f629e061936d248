use std::fs;

use sandbox::fs::{NO_FILES_LISTED, NO_FILES_MATCHED};
use sandbox::{FsConfig, IgnoreSet, ProjectRoot, SandboxError, SandboxFs};
use tempfile::TempDir;

fn sandbox_in(temp: &TempDir) -> SandboxFs {
    let root = ProjectRoot::new(temp.path()).unwrap();
    SandboxFs::new(FsConfig::new(root))
}

fn touch(temp: &TempDir, relative: &str) {
    let path = temp.path().join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, relative).unwrap();
}

#[test]
fn write_and_read_roundtrip() {
    let temp = TempDir::new().unwrap();
    let fs = sandbox_in(&temp);

    for content in ["hello world", "", "한국어 텍스트 ✓\nline two\n"] {
        let confirmation = fs.write_file("nested/dir/example.txt", content).unwrap();
        assert_eq!(confirmation, "Successfully wrote to nested/dir/example.txt");
        assert_eq!(fs.read_file("nested/dir/example.txt").unwrap(), content);
    }
}

#[test]
fn prevent_path_traversal() {
    let temp = TempDir::new().unwrap();
    let fs = sandbox_in(&temp);

    let err = fs.write_file("../evil.txt", "bad").unwrap_err();
    assert!(matches!(err, SandboxError::PathEscape(_)));
    assert!(format!("{err}").contains("outside the project root"));
    assert!(!temp.path().parent().unwrap().join("evil.txt").exists());

    let err = fs.read_file("../../etc/passwd").unwrap_err();
    assert!(matches!(err, SandboxError::PathEscape(_)));
}

#[test]
fn reading_missing_file_is_not_found() {
    let temp = TempDir::new().unwrap();
    let fs = sandbox_in(&temp);

    let err = fs.read_file("missing.txt").unwrap_err();
    assert!(matches!(err, SandboxError::NotFound(ref path) if path == "missing.txt"));
}

#[test]
fn lists_only_immediate_files_when_not_recursive() {
    let temp = TempDir::new().unwrap();
    touch(&temp, "b.txt");
    touch(&temp, "a.txt");
    touch(&temp, "src/lib.rs");
    let fs = sandbox_in(&temp);

    assert_eq!(fs.list_files(".", false).unwrap(), "a.txt\nb.txt");
    assert_eq!(fs.list_files("src", false).unwrap(), "lib.rs");
}

#[test]
fn recursive_listing_prunes_ignored_directories() {
    let temp = TempDir::new().unwrap();
    touch(&temp, "package.json");
    touch(&temp, "src/app.tsx");
    touch(&temp, "src/components/Chat.tsx");
    touch(&temp, "node_modules/react/index.js");
    touch(&temp, ".git/HEAD");
    touch(&temp, "src/__pycache__/mod.pyc");
    touch(&temp, ".vscode/settings.json");
    touch(&temp, "dist/bundle.js");
    let fs = sandbox_in(&temp);

    let listing = fs.list_files(".", true).unwrap();
    let entries: Vec<&str> = listing.lines().collect();
    assert_eq!(
        entries,
        vec!["package.json", "src/app.tsx", "src/components/Chat.tsx"]
    );
    let ignore = IgnoreSet::listing();
    for entry in entries {
        assert!(entry.split('/').all(|part| !ignore.contains(part)));
    }
}

#[test]
fn recursive_listing_is_relative_to_requested_directory() {
    let temp = TempDir::new().unwrap();
    touch(&temp, "src/main.rs");
    touch(&temp, "src/bin/tool.rs");
    let fs = sandbox_in(&temp);

    assert_eq!(fs.list_files("src", true).unwrap(), "main.rs\nbin/tool.rs");
}

#[test]
fn listing_caps_output_at_one_hundred_entries() {
    let temp = TempDir::new().unwrap();
    for idx in 0..150 {
        touch(&temp, &format!("many/file-{idx:03}.txt"));
    }
    let fs = sandbox_in(&temp);

    let listing = fs.list_files("many", false).unwrap();
    let lines: Vec<&str> = listing.lines().collect();
    assert_eq!(lines.len(), 101);
    assert_eq!(lines[0], "file-000.txt");
    assert_eq!(lines[99], "file-099.txt");
    assert_eq!(lines[100], "... (Total 150 files, truncated)");
}

#[test]
fn empty_listing_is_explicit() {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("empty")).unwrap();
    let fs = sandbox_in(&temp);

    assert_eq!(fs.list_files("empty", true).unwrap(), NO_FILES_LISTED);
    assert_eq!(fs.list_files("empty", false).unwrap(), NO_FILES_LISTED);
}

#[test]
fn listing_outside_root_is_rejected() {
    let temp = TempDir::new().unwrap();
    let fs = sandbox_in(&temp);

    assert!(matches!(
        fs.list_files("..", true),
        Err(SandboxError::PathEscape(_))
    ));
}

#[test]
fn recursive_listing_of_missing_directory_names_the_request() {
    let temp = TempDir::new().unwrap();
    let fs = sandbox_in(&temp);

    match fs.list_files("missing/dir", true) {
        Err(SandboxError::NotFound(path)) => assert_eq!(path, "missing/dir"),
        other => panic!("expected not found, got {:?}", other),
    }
}

#[cfg(unix)]
#[test]
fn write_through_dangling_symlink_stays_inside_root() {
    let temp = TempDir::new().unwrap();
    let project = temp.path().join("project");
    let outside = temp.path().join("outside");
    fs::create_dir_all(&project).unwrap();
    fs::create_dir_all(&outside).unwrap();
    std::os::unix::fs::symlink(outside.join("pwned.txt"), project.join("link.txt")).unwrap();
    let sandbox = SandboxFs::new(FsConfig::new(ProjectRoot::new(&project).unwrap()));

    let err = sandbox.write_file("link.txt", "escaped").unwrap_err();
    assert!(matches!(err, SandboxError::PathEscape(_)));
    assert!(!outside.join("pwned.txt").exists());
}

#[test]
fn finds_files_by_bare_name_in_traversal_order() {
    let temp = TempDir::new().unwrap();
    touch(&temp, "a.tsx");
    touch(&temp, "b/c.tsx");
    touch(&temp, "d.ts");
    touch(&temp, "node_modules/lib/e.tsx");
    let fs = sandbox_in(&temp);

    assert_eq!(fs.find_files_by_name("*.tsx").unwrap(), "a.tsx\nb/c.tsx");
    assert_eq!(fs.find_files_by_name("?.ts").unwrap(), "d.ts");
    assert_eq!(fs.find_files_by_name("[ab].tsx").unwrap(), "a.tsx");
}

#[test]
fn braces_and_unclosed_brackets_match_literally() {
    let temp = TempDir::new().unwrap();
    touch(&temp, "notes{1}.md");
    touch(&temp, "draft[.txt");
    touch(&temp, "x.md");
    let fs = sandbox_in(&temp);

    assert_eq!(fs.find_files_by_name("*{1}*").unwrap(), "notes{1}.md");
    assert_eq!(fs.find_files_by_name("draft[*").unwrap(), "draft[.txt");
    assert_eq!(fs.find_files_by_name("{x,y}.md").unwrap(), NO_FILES_MATCHED);
    assert_eq!(fs.find_files_by_name("[").unwrap(), NO_FILES_MATCHED);
}

#[test]
fn search_still_visits_editor_directories() {
    let temp = TempDir::new().unwrap();
    touch(&temp, ".vscode/settings.json");
    touch(&temp, "dist/settings.json");
    let fs = sandbox_in(&temp);

    assert_eq!(
        fs.find_files_by_name("settings.json").unwrap(),
        ".vscode/settings.json"
    );
}

#[test]
fn search_without_matches_says_so() {
    let temp = TempDir::new().unwrap();
    touch(&temp, "main.rs");
    let fs = sandbox_in(&temp);

    assert_eq!(fs.find_files_by_name("*.py").unwrap(), NO_FILES_MATCHED);
}

#[test]
fn custom_ignore_sets_are_honoured() {
    let temp = TempDir::new().unwrap();
    touch(&temp, "target/debug/app");
    touch(&temp, "src/main.rs");
    let root = ProjectRoot::new(temp.path()).unwrap();
    let fs = SandboxFs::new(
        FsConfig::new(root).with_listing_ignore(IgnoreSet::new(vec!["target".to_string()])),
    );

    assert_eq!(fs.list_files(".", true).unwrap(), "src/main.rs");
}

#[test]
fn unset_root_fails_every_operation() {
    let fs = SandboxFs::new(FsConfig::new(ProjectRoot::unset()));

    assert!(matches!(
        fs.read_file("a.txt"),
        Err(SandboxError::Configuration(_))
    ));
    assert!(matches!(
        fs.find_files_by_name("*"),
        Err(SandboxError::Configuration(_))
    ));
}
