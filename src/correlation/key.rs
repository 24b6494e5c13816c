//! Correlation keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Field/value pairs describing a message event, e.g. event type, process
/// definition and flow node name.
///
/// A waiting event carries a partial key and a thrown event a full one; they
/// match when every pair of the partial key appears unchanged in the full key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationKey(BTreeMap<String, serde_json::Value>);

impl CorrelationKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.0.get(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every pair of `self` is present and equal in `other`.
    pub fn is_subset_of(&self, other: &CorrelationKey) -> bool {
        self.0
            .iter()
            .all(|(field, value)| other.0.get(field) == Some(value))
    }
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (field, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{field}={value}")?;
        }
        write!(f, "}}")
    }
}

impl<K: Into<String>, V: Into<serde_json::Value>> FromIterator<(K, V)> for CorrelationKey {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_key_is_subset_of_full_key() {
        let full = CorrelationKey::new()
            .with("type", "M")
            .with("process", "P")
            .with("flowNode", "F");
        let partial = CorrelationKey::new().with("type", "M").with("process", "P");

        assert!(partial.is_subset_of(&full));
        assert!(!full.is_subset_of(&partial));
    }

    #[test]
    fn differing_value_is_not_a_subset() {
        let full = CorrelationKey::new().with("type", "M").with("process", "P");
        let partial = CorrelationKey::new().with("process", "Q");

        assert!(!partial.is_subset_of(&full));
    }

    #[test]
    fn values_compare_by_json_type() {
        let full = CorrelationKey::new().with("order", 42);
        assert!(CorrelationKey::new().with("order", 42).is_subset_of(&full));
        assert!(!CorrelationKey::new().with("order", "42").is_subset_of(&full));
    }

    #[test]
    fn empty_key_matches_anything() {
        let full = CorrelationKey::new().with("type", "M");
        assert!(CorrelationKey::new().is_subset_of(&full));
    }
}
