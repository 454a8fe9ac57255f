use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Prefix the daemon puts in the `data` segment of installed packages.
pub const INSTALLED_PREFIX: &str = "installed:";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PackageIdError {
    #[error("package id '{0}' does not have four ';'-separated segments")]
    WrongSegmentCount(String),
    #[error("package id '{0}' has an empty name")]
    EmptyName(String),
}

/// A package identifier in the daemon's `name;version;arch;data` form.
///
/// Equality and hashing are exact: two ids are the same key only when their
/// full strings are equal. Use [`PackageId::weak`] to compare ids that may
/// disagree on the `data` segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageId {
    raw: String,
    /// Byte offsets of the three `;` separators.
    seps: [usize; 3],
}

impl PackageId {
    pub fn new(name: &str, version: &str, arch: &str, data: &str) -> Result<Self, PackageIdError> {
        format!("{name};{version};{arch};{data}").parse()
    }

    pub fn name(&self) -> &str {
        &self.raw[..self.seps[0]]
    }

    pub fn version(&self) -> &str {
        &self.raw[self.seps[0] + 1..self.seps[1]]
    }

    pub fn arch(&self) -> &str {
        &self.raw[self.seps[1] + 1..self.seps[2]]
    }

    pub fn data(&self) -> &str {
        &self.raw[self.seps[2] + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the daemon reported this package as installed.
    pub fn is_installed(&self) -> bool {
        self.data().starts_with(INSTALLED_PREFIX)
    }

    /// The origin repository, with any `installed:` marker stripped.
    pub fn origin(&self) -> &str {
        let data = self.data();
        data.strip_prefix(INSTALLED_PREFIX).unwrap_or(data)
    }

    /// Everything up to and including the last separator.
    fn without_data(&self) -> &str {
        &self.raw[..=self.seps[2]]
    }

    pub fn weak(&self) -> WeakPackageId {
        WeakPackageId(self.clone())
    }

    /// Compares `name`, `version` and `arch`, ignoring `data`.
    ///
    /// Some backends do not append the origin, so responses may carry a
    /// different or empty `data` segment than the id that was asked for.
    pub fn weak_eq(&self, other: &PackageId) -> bool {
        self.name() == other.name()
            && self.version() == other.version()
            && self.arch() == other.arch()
    }
}

impl FromStr for PackageId {
    type Err = PackageIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut seps = [0usize; 3];
        let mut found = 0;
        for (idx, ch) in s.char_indices() {
            if ch != ';' {
                continue;
            }
            if found == 3 {
                return Err(PackageIdError::WrongSegmentCount(s.to_string()));
            }
            seps[found] = idx;
            found += 1;
        }
        if found != 3 {
            return Err(PackageIdError::WrongSegmentCount(s.to_string()));
        }
        if seps[0] == 0 {
            return Err(PackageIdError::EmptyName(s.to_string()));
        }
        Ok(Self {
            raw: s.to_string(),
            seps,
        })
    }
}

impl TryFrom<String> for PackageId {
    type Error = PackageIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PackageId> for String {
    fn from(value: PackageId) -> Self {
        value.raw
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A [`PackageId`] keyed on `{name, version, arch}` only.
#[derive(Debug, Clone)]
pub struct WeakPackageId(PackageId);

impl WeakPackageId {
    pub fn id(&self) -> &PackageId {
        &self.0
    }
}

impl PartialEq for WeakPackageId {
    fn eq(&self, other: &Self) -> bool {
        self.0.weak_eq(&other.0)
    }
}

impl Eq for WeakPackageId {}

impl Hash for WeakPackageId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // An empty data segment hashes the whole string, which is byte-for-byte
        // the same as the `name;version;arch;` prefix used otherwise, so
        // weak-equal ids always land in the same bucket.
        if self.0.data().is_empty() {
            self.0.as_str().hash(state);
        } else {
            self.0.without_data().hash(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::hash::DefaultHasher;

    use super::*;

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_parse_segments() {
        let id: PackageId = "foo;1.0;x86_64;installed:fedora".parse().unwrap();
        assert_eq!(id.name(), "foo");
        assert_eq!(id.version(), "1.0");
        assert_eq!(id.arch(), "x86_64");
        assert_eq!(id.data(), "installed:fedora");
        assert!(id.is_installed());
        assert_eq!(id.origin(), "fedora");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            "foo;1.0;x86_64".parse::<PackageId>(),
            Err(PackageIdError::WrongSegmentCount(_))
        ));
        assert!(matches!(
            "foo;1.0;x86_64;a;b".parse::<PackageId>(),
            Err(PackageIdError::WrongSegmentCount(_))
        ));
        assert!(matches!(
            ";1.0;x86_64;fedora".parse::<PackageId>(),
            Err(PackageIdError::EmptyName(_))
        ));
    }

    #[test]
    fn test_weak_equal_but_not_identical() {
        let a: PackageId = "foo;1.0;x86_64;installed:fedora".parse().unwrap();
        let b: PackageId = "foo;1.0;x86_64;fedora-updates".parse().unwrap();
        assert_ne!(a, b);
        assert!(a.weak_eq(&b));
        assert_eq!(a.weak(), b.weak());
        assert_eq!(hash_of(&a.weak()), hash_of(&b.weak()));
    }

    #[test]
    fn test_weak_differs_on_version_or_arch() {
        let a: PackageId = "foo;1.0;x86_64;fedora".parse().unwrap();
        let b: PackageId = "foo;1.1;x86_64;fedora".parse().unwrap();
        let c: PackageId = "foo;1.0;i686;fedora".parse().unwrap();
        assert_ne!(a.weak(), b.weak());
        assert_ne!(a.weak(), c.weak());
    }

    #[test]
    fn test_empty_data_hashes_full_string() {
        let bare: PackageId = "foo;1.0;x86_64;".parse().unwrap();
        assert_eq!(hash_of(&bare.weak()), hash_of(&"foo;1.0;x86_64;"));

        let tagged: PackageId = "foo;1.0;x86_64;fedora".parse().unwrap();
        assert_eq!(bare.weak(), tagged.weak());
        assert_eq!(hash_of(&bare.weak()), hash_of(&tagged.weak()));
    }

    #[test]
    fn test_empty_data_does_not_collapse_names() {
        let mut set = HashSet::new();
        for name in ["a", "b", "c"] {
            set.insert(PackageId::new(name, "1", "noarch", "").unwrap().weak());
        }
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_weak_map_lookup_across_data() {
        let mut map = HashMap::new();
        let asked: PackageId = "bar;2.0;noarch;".parse().unwrap();
        map.insert(asked.weak(), 7);
        let reply: PackageId = "bar;2.0;noarch;installed:updates".parse().unwrap();
        assert_eq!(map.get(&reply.weak()), Some(&7));
    }

    #[test]
    fn test_serde_as_string() {
        let id: PackageId = "foo;1.0;x86_64;fedora".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"foo;1.0;x86_64;fedora\"");
        let back: PackageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
