use crate::config::CONFIG_FILE;
use std::path::{Component, Path, PathBuf};

/// Find the project root by walking up from `cwd` looking for `relink.json`,
/// `package.json` or `.git`.
///
/// Returns the first directory containing any marker, or `None` if none is found.
#[must_use]
pub fn project_root(cwd: &Path) -> Option<PathBuf> {
    let mut current = cwd.to_path_buf();

    loop {
        if current.join(CONFIG_FILE).exists()
            || current.join("package.json").exists()
            || current.join(".git").exists()
        {
            return Some(current);
        }

        if !current.pop() {
            return None;
        }
    }
}

/// Root-relative name of a module, always with `/` separators.
///
/// Used for source map `sources` and bundle comments, so artifacts do not
/// depend on where the project is checked out. Paths outside `root` keep
/// their full form.
#[must_use]
pub fn display_name(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) => rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => path.to_string_lossy().replace('\\', "/"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_project_root_finds_marker() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("src").join("components");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{}").unwrap();

        assert_eq!(project_root(&nested), Some(dir.path().to_path_buf()));
    }

    #[test]
    fn test_display_name() {
        let root = Path::new("/work/app");
        assert_eq!(
            display_name(root, Path::new("/work/app/src/views/App.jsx")),
            "src/views/App.jsx"
        );
        assert_eq!(display_name(root, Path::new("/elsewhere/x.js")), "/elsewhere/x.js");
    }
}
