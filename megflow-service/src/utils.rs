// Utility Functions
// Path expansion and external program lookup

use std::path::{Path, PathBuf};

/// Expand a leading `~` to the user's home directory.
///
/// Paths that do not start with `~` (or when no home directory can be
/// determined) are returned unchanged.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };

    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// Locate an external program on `PATH` (or accept it as-is if it is a path).
///
/// Used to preflight the external routines a workflow will invoke.
pub fn find_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    which::which(program).ok()
}

/// Default data directory when the descriptor does not name one (`~/data_demo`)
pub fn default_data_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("data_demo")
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    #[test]
    fn test_expand_tilde_with_home() {
        let expanded = expand_tilde(Path::new("~/data_demo/FSF"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("data_demo").join("FSF"));
        }
    }

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        let path = Path::new("/media/data/ds117");
        assert_eq!(expand_tilde(path), PathBuf::from("/media/data/ds117"));
    }

    #[test]
    fn test_expand_tilde_only_matches_whole_component() {
        let path = Path::new("~user/data");
        assert_eq!(expand_tilde(path), PathBuf::from("~user/data"));
    }

    #[test]
    fn test_find_program_with_explicit_path() {
        let temp = tempfile::tempdir().unwrap();
        let script = temp.path().join("recon-all");
        fs::write(&script, "#!/bin/sh\n").unwrap();

        let found = find_program(script.to_str().unwrap());
        assert_eq!(found, Some(script));

        let missing = temp.path().join("missing");
        assert!(find_program(missing.to_str().unwrap()).is_none());
    }

    #[test]
    fn test_find_program_not_on_path() {
        assert!(find_program("megflow-definitely-not-installed").is_none());
    }
}
