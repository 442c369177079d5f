//! Common types used throughout peersync.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Identifier of one device belonging to a user.
///
/// Device identifiers are unique and totally ordered; the ordering is what the
/// master election ranks by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new DeviceId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    /// - Returns error if id contains anything but ASCII letters, digits and `-`
    ///
    /// Ids end up inside conflict file names, so `.` and `_` are kept out to
    /// leave the extension and the copy suffix unambiguous.
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "DeviceId cannot be empty".to_string(),
            ));
        }
        if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(crate::Error::InvalidInput(format!(
                "DeviceId '{}' may only contain letters, digits and '-'",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network address a device is currently reachable at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a peer device: owning user, device identity and address.
///
/// Identity is `(user, device)`. The address may change between runs and is
/// ignored by equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRef {
    pub user: String,
    pub device: DeviceId,
    pub address: PeerAddress,
}

impl PeerRef {
    pub fn new(user: impl Into<String>, device: DeviceId, address: PeerAddress) -> Self {
        Self {
            user: user.into(),
            device,
            address,
        }
    }

    /// Same peer, reachable at a new address.
    pub fn with_address(&self, address: PeerAddress) -> Self {
        Self {
            user: self.user.clone(),
            device: self.device.clone(),
            address,
        }
    }
}

impl PartialEq for PeerRef {
    fn eq(&self, other: &Self) -> bool {
        self.user == other.user && self.device == other.device
    }
}

impl Eq for PeerRef {}

impl std::hash::Hash for PeerRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.user.hash(state);
        self.device.hash(state);
    }
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.user, self.device, self.address)
    }
}

/// A path within the synchronized folder, independent of where the folder lives.
///
/// Serialized as its `/`-separated string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FolderPath {
    components: Vec<String>,
}

impl FolderPath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Create a path from string components.
    ///
    /// # Errors
    /// - Returns error if any component is empty, contains a separator or is
    ///   a `.`/`..` reference
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        for comp in &components {
            Self::check_component(comp)?;
        }
        Ok(Self { components })
    }

    fn check_component(comp: &str) -> crate::Result<()> {
        if comp.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Path component cannot be empty".to_string(),
            ));
        }
        if comp.contains('/') || comp.contains('\\') {
            return Err(crate::Error::InvalidInput(
                "Path component cannot contain separators".to_string(),
            ));
        }
        if comp == "." || comp == ".." {
            return Err(crate::Error::InvalidInput(format!(
                "Path component '{}' is not allowed",
                comp
            )));
        }
        Ok(())
    }

    /// Parse a path string into FolderPath.
    ///
    /// Uses '/' as separator; leading and trailing separators are ignored.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let path = path.trim_start_matches('/').trim_end_matches('/');
        if path.is_empty() {
            return Ok(Self::root());
        }

        let components: Vec<String> = path.split('/').map(String::from).collect();
        Self::from_components(components)
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self { components })
        }
    }

    /// All proper ancestors, shallowest first, excluding the root.
    pub fn ancestors(&self) -> Vec<Self> {
        (1..self.components.len())
            .map(|n| Self {
                components: self.components[..n].to_vec(),
            })
            .collect()
    }

    /// Check whether `self` is a proper ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &FolderPath) -> bool {
        self.components.len() < other.components.len()
            && other.components.starts_with(&self.components)
    }

    /// Get the file/directory name (last component).
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join this path with a child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        Self::check_component(child)?;
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self { components })
    }

    /// Same parent, different last component.
    pub fn with_name(&self, name: &str) -> crate::Result<Self> {
        match self.parent() {
            Some(parent) => parent.join(name),
            None => Err(crate::Error::InvalidInput(
                "Root has no name to replace".to_string(),
            )),
        }
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Number of components below the root.
    pub fn depth(&self) -> usize {
        self.components.len()
    }

    /// Convert to a string representation.
    pub fn to_string_path(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}", self.components.join("/"))
        }
    }

    /// The path without its leading separator, as stored in archives.
    pub fn to_relative(&self) -> String {
        self.components.join("/")
    }

    /// Orders paths shortest string form first, ties broken lexically.
    ///
    /// A parent's string form is always a strict prefix of its children's, so
    /// sorting with this puts every directory before anything inside it.
    pub fn shallow_first(a: &FolderPath, b: &FolderPath) -> Ordering {
        let (sa, sb) = (a.to_string_path(), b.to_string_path());
        sa.len().cmp(&sb.len()).then_with(|| sa.cmp(&sb))
    }
}

impl PartialOrd for FolderPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FolderPath {
    fn cmp(&self, other: &Self) -> Ordering {
        Self::shallow_first(self, other)
    }
}

impl fmt::Display for FolderPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_path())
    }
}

impl TryFrom<String> for FolderPath {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<FolderPath> for String {
    fn from(path: FolderPath) -> Self {
        path.to_string_path()
    }
}
