use std::collections::HashSet;

use once_cell::sync::Lazy;

/// Marker written at the workspace root when initial reconciliation
/// finishes. Part of the ignore set so it never syncs.
pub const SYNC_MARKER: &str = ".initial-sync-complete";

static IGNORED_DIRS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        ".git",
        ".hg",
        ".svn",
        "node_modules",
        "__pycache__",
        ".venv",
        "venv",
        "target",
        "dist",
        "build",
        ".idea",
        ".vscode",
        ".cache",
        ".mypy_cache",
        ".pytest_cache",
    ]
    .into_iter()
    .collect()
});

const TRANSIENT_SUFFIXES: &[&str] = &[
    ".swp", ".swo", ".swx", ".tmp", ".part", "~", ".pyc", ".pyo", ".class", ".o",
];

/// Ignore policy applied in both directions: hidden directories, VCS
/// metadata, build artifacts, transient editor files, and the sync marker.
/// `rel_path` is workspace-relative with `/` separators.
pub fn is_ignored(rel_path: &str) -> bool {
    let mut components = rel_path.split('/').peekable();
    while let Some(component) = components.next() {
        let is_last = components.peek().is_none();
        if IGNORED_DIRS.contains(component) {
            return true;
        }
        // Hidden directories are skipped wholesale; hidden files at the
        // top level (.env, .gitignore) still sync.
        if !is_last && component.starts_with('.') {
            return true;
        }
        if is_last {
            if component == SYNC_MARKER {
                return true;
            }
            if TRANSIENT_SUFFIXES.iter().any(|s| component.ends_with(s)) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vcs_and_build_artifacts_are_ignored() {
        assert!(is_ignored(".git/config"));
        assert!(is_ignored("node_modules/left-pad/index.js"));
        assert!(is_ignored("src/__pycache__/main.cpython-311.pyc"));
        assert!(is_ignored("target/debug/app"));
    }

    #[test]
    fn transient_suffixes_are_ignored() {
        assert!(is_ignored("main.py.swp"));
        assert!(is_ignored("notes.txt~"));
        assert!(is_ignored("src/partial.tmp"));
        assert!(is_ignored("out/App.class"));
    }

    #[test]
    fn hidden_directories_but_not_top_level_dotfiles() {
        assert!(is_ignored(".hidden/file.py"));
        assert!(is_ignored("src/.secret/notes.md"));
        assert!(!is_ignored(".env"));
        assert!(!is_ignored(".gitignore"));
    }

    #[test]
    fn the_sync_marker_never_syncs() {
        assert!(is_ignored(SYNC_MARKER));
    }

    #[test]
    fn regular_source_files_pass() {
        assert!(!is_ignored("main.py"));
        assert!(!is_ignored("src/lib/helpers.ts"));
        assert!(!is_ignored("README.md"));
    }
}
