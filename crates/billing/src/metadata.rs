//! Key/value maps stored as JSONB on orders and members

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const SESSION_ID: &str = "session_id";
pub const PAYMENT_INTENT_ID: &str = "payment_intent_id";
pub const SUBSCRIPTION_ID: &str = "subscription_id";
pub const CUSTOMER_ID: &str = "customer_id";
pub const CHECKOUT_URL: &str = "checkout_url";

/// String map with explicit merge rules.
///
/// The session reference on an order accumulates gateway fields over its
/// lifetime; [`MetadataMap::merge`] only ever adds keys. Member payment
/// metadata tracks the latest payment and uses [`MetadataMap::overwrite_with`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataMap(BTreeMap<String, String>);

impl MetadataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Builder-style insert that keeps an existing value
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.entry(key.into()).or_insert_with(|| value.into());
        self
    }

    /// Insert when `value` is present
    pub fn with_opt(self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.with(key, v),
            None => self,
        }
    }

    /// Add keys from `other` that are not already present.
    ///
    /// Returns the keys whose incoming value differed from the stored one and
    /// was therefore dropped.
    pub fn merge(&mut self, other: &MetadataMap) -> Vec<String> {
        let mut conflicts = Vec::new();
        for (key, value) in &other.0 {
            match self.0.get(key) {
                Some(existing) if existing != value => conflicts.push(key.clone()),
                Some(_) => {}
                None => {
                    self.0.insert(key.clone(), value.clone());
                }
            }
        }
        conflicts
    }

    /// Replace values with those from `other`
    pub fn overwrite_with(&mut self, other: &MetadataMap) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.get(SESSION_ID)
    }
}

impl FromIterator<(String, String)> for MetadataMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_never_overwrites_existing_keys() {
        let mut stored = MetadataMap::new()
            .with(SESSION_ID, "cs_original")
            .with(CHECKOUT_URL, "https://checkout.example/1");
        let incoming = MetadataMap::new()
            .with(SESSION_ID, "cs_other")
            .with(PAYMENT_INTENT_ID, "pi_123");

        let conflicts = stored.merge(&incoming);

        assert_eq!(stored.session_id(), Some("cs_original"));
        assert_eq!(stored.get(PAYMENT_INTENT_ID), Some("pi_123"));
        assert_eq!(stored.get(CHECKOUT_URL), Some("https://checkout.example/1"));
        assert_eq!(conflicts, vec![SESSION_ID.to_string()]);
    }

    #[test]
    fn test_merge_identical_values_is_not_a_conflict() {
        let mut stored = MetadataMap::new().with(SESSION_ID, "cs_1");
        let conflicts = stored.merge(&MetadataMap::new().with(SESSION_ID, "cs_1"));
        assert!(conflicts.is_empty());
        assert_eq!(stored.len(), 1);
    }

    #[test]
    fn test_overwrite_with_replaces_values() {
        let mut member = MetadataMap::new().with("last_order_number", "ORD-1");
        member.overwrite_with(&MetadataMap::new().with("last_order_number", "ORD-2"));
        assert_eq!(member.get("last_order_number"), Some("ORD-2"));
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let map = MetadataMap::new().with(SESSION_ID, "cs_1");
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json, serde_json::json!({ "session_id": "cs_1" }));
    }
}
