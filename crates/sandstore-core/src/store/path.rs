//! Caller-facing paths inside a store.

use relative_path::{RelativePath, RelativePathBuf};
use std::fmt;

use crate::error::StoreError;
use crate::index::{IndexError, validate_name};

/// A `/`-separated path inside one store, relative to its root.
///
/// Leading slashes are stripped, so `"/docs/a.txt"` and `"docs/a.txt"` name
/// the same entry. Components are only checked by [`VirtualPath::validate`],
/// which every store operation runs first.
///
/// ```
/// use sandstore_core::VirtualPath;
///
/// let path = VirtualPath::new("/docs/report.txt");
/// assert_eq!(path.file_name(), Some("report.txt"));
/// assert_eq!(path.parent().unwrap().as_str(), "docs");
/// assert_eq!(path, VirtualPath::new("docs/report.txt"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VirtualPath(RelativePathBuf);

impl VirtualPath {
    #[inline]
    pub fn root() -> Self {
        VirtualPath(RelativePathBuf::new())
    }

    pub fn new(path: impl AsRef<str>) -> Self {
        let s = path.as_ref().trim_start_matches('/');
        VirtualPath(RelativePathBuf::from(s))
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.as_str().is_empty()
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    #[inline]
    pub fn as_relative_path(&self) -> &RelativePath {
        &self.0
    }

    pub fn join(&self, component: impl AsRef<str>) -> Self {
        VirtualPath(self.0.join(component.as_ref()))
    }

    /// `None` for the root.
    pub fn parent(&self) -> Option<VirtualPath> {
        self.0.parent().map(|p| VirtualPath(p.to_relative_path_buf()))
    }

    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.components().map(|c| c.as_str())
    }

    /// Parent path and final component; `None` for the root.
    pub fn split(&self) -> Option<(VirtualPath, &str)> {
        let parent = self.parent()?;
        let name = self.file_name()?;
        Some((parent, name))
    }

    /// Whether `self` is `other` or lies beneath it.
    pub fn starts_with(&self, other: &VirtualPath) -> bool {
        let mut mine = self.components();
        other.components().all(|c| mine.next() == Some(c))
    }

    /// Reject `.`/`..` components and names the index would refuse.
    pub fn validate(&self) -> Result<(), StoreError> {
        for component in self.components() {
            if let Err(IndexError::InvalidName { reason, .. }) = validate_name(component) {
                return Err(StoreError::InvalidPath {
                    path: self.as_str().to_string(),
                    reason: format!("component '{component}': {reason}"),
                });
            }
        }
        Ok(())
    }
}

impl AsRef<str> for VirtualPath {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl From<&str> for VirtualPath {
    fn from(s: &str) -> Self {
        VirtualPath::new(s)
    }
}

impl From<String> for VirtualPath {
    fn from(s: String) -> Self {
        VirtualPath::new(s)
    }
}
