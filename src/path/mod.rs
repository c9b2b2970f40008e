use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Result, WireFsError};

/// The path separator in textual form.
pub const SEPARATOR: char = '/';

/// An immutable, root-anchored path in the filesystem namespace.
///
/// A path is an ordered sequence of component strings. No component is empty
/// or contains the separator. The root path has no components and renders as
/// `"/"`. Paths are value objects: every operation returns a new path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WirePath {
    components: Vec<String>,
}

impl WirePath {
    /// The root path.
    pub fn root() -> Self {
        Self::default()
    }

    /// Builds a path from pre-split components.
    pub fn from_components<I, S>(components: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = Vec::new();
        for component in components {
            let component = component.into();
            if component.is_empty() {
                return Err(WireFsError::InvalidArgument(
                    "path component is empty".into(),
                ));
            }
            if component.contains(SEPARATOR) {
                return Err(WireFsError::InvalidArgument(format!(
                    "path component {component:?} contains the separator"
                )));
            }
            out.push(component);
        }
        Ok(Self { components: out })
    }

    /// Returns a new path with `component` appended.
    pub fn child(&self, component: &str) -> Result<Self> {
        let mut components = self.components.clone();
        if component.is_empty() || component.contains(SEPARATOR) {
            return Err(WireFsError::InvalidArgument(format!(
                "invalid path component {component:?}"
            )));
        }
        components.push(component.to_string());
        Ok(Self { components })
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// The parent path. Fails on the root, which has no parent.
    pub fn parent(&self) -> Result<Self> {
        if self.is_root() {
            return Err(WireFsError::InvalidArgument(
                "the root path has no parent".into(),
            ));
        }
        Ok(Self {
            components: self.components[..self.components.len() - 1].to_vec(),
        })
    }

    /// The final component. Fails on the root, which has no components.
    pub fn last(&self) -> Result<&str> {
        self.components
            .last()
            .map(String::as_str)
            .ok_or_else(|| WireFsError::InvalidArgument("the root path has no last component".into()))
    }

    /// True iff `other` is a prefix of this path (every path starts with root).
    pub fn starts_with(&self, other: &WirePath) -> bool {
        self.components.len() >= other.components.len()
            && self.components[..other.components.len()] == other.components[..]
    }

    /// Maps this path onto the local filesystem under `root`.
    pub fn resolve_under(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for component in &self.components {
            out.push(component);
        }
        out
    }

    /// Walks a local directory and yields every descendant *file* as a path
    /// relative to that directory. Directories themselves are not listed.
    pub fn enumerate_local(dir: &Path) -> Result<Vec<WirePath>> {
        if !dir.is_dir() {
            return Err(WireFsError::NotFound(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        let mut files = Vec::new();
        Self::walk_local(dir, &WirePath::root(), &mut files)?;
        Ok(files)
    }

    fn walk_local(dir: &Path, prefix: &WirePath, out: &mut Vec<WirePath>) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let child = prefix.child(&name)?;
            if entry.file_type()?.is_dir() {
                Self::walk_local(&entry.path(), &child, out)?;
            } else {
                out.push(child);
            }
        }
        Ok(())
    }
}

impl fmt::Display for WirePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return write!(f, "/");
        }
        for component in &self.components {
            write!(f, "/{component}")?;
        }
        Ok(())
    }
}

impl FromStr for WirePath {
    type Err = WireFsError;

    /// Parses a textual path. The string must begin with `/`; duplicate
    /// separators are collapsed.
    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(WireFsError::InvalidArgument("path string is empty".into()));
        }
        if !s.starts_with(SEPARATOR) {
            return Err(WireFsError::InvalidArgument(format!(
                "path {s:?} is not root-anchored"
            )));
        }
        Self::from_components(s.split(SEPARATOR).filter(|c| !c.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn p(s: &str) -> WirePath {
        s.parse().unwrap()
    }

    #[test]
    fn test_root() {
        let root = WirePath::root();
        assert!(root.is_root());
        assert_eq!(root.to_string(), "/");
        assert!(root.parent().is_err());
        assert!(root.last().is_err());
        assert_eq!(p("/"), root);
    }

    #[test]
    fn test_parse_and_display() {
        let path = p("/a/b/c");
        assert_eq!(path.components(), &["a", "b", "c"]);
        assert_eq!(path.to_string(), "/a/b/c");
        // Duplicate separators collapse.
        assert_eq!(p("//a///b"), p("/a/b"));
        // Not root-anchored or empty.
        assert!("a/b".parse::<WirePath>().is_err());
        assert!("".parse::<WirePath>().is_err());
    }

    #[test]
    fn test_parent_and_last() {
        let path = p("/a/b/c");
        assert_eq!(path.last().unwrap(), "c");
        assert_eq!(path.parent().unwrap(), p("/a/b"));
        assert_eq!(p("/a").parent().unwrap(), WirePath::root());
    }

    #[test]
    fn test_child_rejects_bad_components() {
        let root = WirePath::root();
        assert!(root.child("").is_err());
        assert!(root.child("a/b").is_err());
        assert_eq!(root.child("a").unwrap(), p("/a"));
    }

    #[test]
    fn test_starts_with() {
        assert!(p("/a/b/c").starts_with(&p("/a/b")));
        assert!(p("/a/b").starts_with(&p("/a/b")));
        assert!(p("/a/b").starts_with(&WirePath::root()));
        assert!(!p("/a/b").starts_with(&p("/a/b/c")));
        assert!(!p("/ab").starts_with(&p("/a")));
    }

    #[test]
    fn test_equality_and_hash() {
        let mut set = HashSet::new();
        set.insert(p("/a/b"));
        assert!(set.contains(&p("/a/b")));
        assert!(!set.contains(&p("/a")));
    }

    #[test]
    fn test_resolve_under() {
        let resolved = p("/a/b").resolve_under(Path::new("/tmp/store"));
        assert_eq!(resolved, PathBuf::from("/tmp/store/a/b"));
    }

    #[test]
    fn test_enumerate_local() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        std::fs::write(dir.path().join("top.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("sub/deep/leaf.txt"), b"y").unwrap();
        std::fs::create_dir(dir.path().join("empty")).unwrap();

        let mut files = WirePath::enumerate_local(dir.path()).unwrap();
        files.sort_by_key(|f| f.to_string());
        assert_eq!(files, vec![p("/sub/deep/leaf.txt"), p("/top.txt")]);
    }

    #[test]
    fn test_enumerate_local_requires_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        assert!(WirePath::enumerate_local(&file).is_err());
    }
}
