use std::collections::BTreeMap;
use std::fmt;

use xxhash_rust::xxh64::Xxh64;

/// Prefix reserved for scrape-internal labels (`__address__`, `__scheme__`, ...).
/// Reserved labels are stripped before a label set is handed to a profile key
/// or pushed to the store; `__name__` and `__delta__` are the only exceptions.
pub const RESERVED_LABEL_PREFIX: &str = "__";
pub const METRIC_NAME_LABEL: &str = "__name__";
pub const JOB_LABEL: &str = "job";
pub const INSTANCE_LABEL: &str = "instance";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=\"{}\"", self.name, self.value)
    }
}

/// A sorted, deduplicated label set. Sorted by name so that two label sets
/// built from the same map always hash and display identically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn del(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Labels visible to a consumer: reserved (`__`-prefixed) labels are
    /// dropped except `__name__`, which becomes the profile type.
    pub fn public(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .filter(|(k, _)| !k.starts_with(RESERVED_LABEL_PREFIX) || k.as_str() == METRIC_NAME_LABEL)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.0.clone()
    }

    /// Stable hash over the full (including reserved) label set. Used
    /// directly by `scrape::Target`'s fingerprint, which folds the scrape
    /// url in as an extra pseudo-label before hashing.
    pub fn hash(&self) -> u64 {
        let mut hasher = Xxh64::new(0);
        for (k, v) in &self.0 {
            hasher.update(k.as_bytes());
            hasher.update(&[0xff]);
            hasher.update(v.as_bytes());
            hasher.update(&[0xff]);
        }
        hasher.digest()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}=\"{}\"", k, v)?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_strips_reserved_but_keeps_name() {
        let mut l = Labels::new();
        l.set("__address__", "10.0.0.1:80");
        l.set("__name__", "cpu");
        l.set("job", "api");
        let public = l.public();
        assert_eq!(public.get("job").map(String::as_str), Some("api"));
        assert_eq!(public.get("__name__").map(String::as_str), Some("cpu"));
        assert!(!public.contains_key("__address__"));
    }

    #[test]
    fn hash_is_stable_for_equal_sets() {
        let mut a = Labels::new();
        a.set("job", "x");
        a.set("instance", "y");
        let mut b = Labels::new();
        b.set("instance", "y");
        b.set("job", "x");
        assert_eq!(a.hash(), b.hash());
    }
}
