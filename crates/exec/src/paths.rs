//! Workspace path containment for file-typed arguments.

use std::path::{Component, Path, PathBuf};

use crate::PrepareError;

/// Lexically resolve `.` and `..` in a path *without* hitting the
/// filesystem.
///
/// Essential for pre-spawn validation: `canonicalize()` fails when the
/// file (or its parent directories) don't exist yet, but we still need to
/// verify that the normalized path stays inside the session workspace.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// Resolve a file-path argument against the session workspace and verify
/// it does not escape it.  Returns the full normalized path on success.
pub fn resolve_in_workdir(workdir: &Path, arg: &str, rel_path: &str) -> Result<PathBuf, PrepareError> {
    let full = workdir.join(rel_path);
    let normalized = normalize_path(&full);
    let workdir_normalized = normalize_path(workdir);
    if !normalized.starts_with(&workdir_normalized) {
        return Err(PrepareError::PathEscape {
            arg: arg.to_string(),
            path: normalized.display().to_string(),
        });
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_relative_path_resolves_under_workdir() {
        let resolved = resolve_in_workdir(Path::new("/work/s1"), "input", "data/in.txt").unwrap();
        assert_eq!(resolved, PathBuf::from("/work/s1/data/in.txt"));
    }

    #[test]
    fn dot_segments_are_collapsed() {
        let resolved = resolve_in_workdir(Path::new("/work/s1"), "input", "./a/../b.txt").unwrap();
        assert_eq!(resolved, PathBuf::from("/work/s1/b.txt"));
    }

    #[test]
    fn traversal_out_of_workdir_is_rejected() {
        for escape in ["../secrets", "a/../../other", "../../etc/passwd"] {
            let err = resolve_in_workdir(Path::new("/work/s1"), "input", escape).unwrap_err();
            assert!(matches!(err, PrepareError::PathEscape { .. }), "{escape} should escape");
        }
    }

    #[test]
    fn absolute_path_outside_workdir_is_rejected() {
        let err = resolve_in_workdir(Path::new("/work/s1"), "input", "/etc/passwd").unwrap_err();
        assert!(matches!(err, PrepareError::PathEscape { .. }));
    }

    #[test]
    fn prefix_sibling_does_not_pass_the_check() {
        // "/work/s1-evil" starts with the *string* "/work/s1" but not the
        // path; Path::starts_with compares whole components.
        let err = resolve_in_workdir(Path::new("/work/s1"), "input", "/work/s1-evil/x").unwrap_err();
        assert!(matches!(err, PrepareError::PathEscape { .. }));
    }
}
