//! Redaction of platform-only financial fields from outbound payloads.

use std::collections::BTreeSet;

use serde_json::Value;

/// Keys removed from payloads sent to anyone but a platform owner.
pub const DEFAULT_PLATFORM_ONLY_KEYS: [&str; 6] = [
    "platform_fee",
    "platform_fee_percentage",
    "platform_commission",
    "platform_revenue",
    "processing_fee",
    "net_payout_adjustment",
];

/// Strips a fixed set of keys from JSON objects at any depth.
#[derive(Debug, Clone)]
pub struct ResponseSanitizer {
    keys: BTreeSet<String>,
}

impl Default for ResponseSanitizer {
    fn default() -> Self {
        Self::new(DEFAULT_PLATFORM_ONLY_KEYS)
    }
}

impl ResponseSanitizer {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn keys(&self) -> &BTreeSet<String> {
        &self.keys
    }

    /// Removes every configured key from `value`, descending into nested
    /// objects and arrays. Returns how many entries were removed.
    pub fn sanitize(&self, value: &mut Value) -> usize {
        match value {
            Value::Object(map) => {
                let before = map.len();
                map.retain(|key, _| !self.keys.contains(key));
                let mut removed = before - map.len();
                for child in map.values_mut() {
                    removed += self.sanitize(child);
                }
                removed
            }
            Value::Array(items) => items.iter_mut().map(|item| self.sanitize(item)).sum(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn removes_nested_keys() {
        let mut payload = json!({
            "order_id": "o-1",
            "total": 42.0,
            "platform_fee": 1.5,
            "payout": {
                "amount": 40.5,
                "net_payout_adjustment": -0.2,
                "lines": [
                    {"sku": "a", "processing_fee": 0.1},
                    {"sku": "b"}
                ]
            }
        });
        let removed = ResponseSanitizer::default().sanitize(&mut payload);
        assert_eq!(removed, 3);
        assert_eq!(
            payload,
            json!({
                "order_id": "o-1",
                "total": 42.0,
                "payout": {
                    "amount": 40.5,
                    "lines": [{"sku": "a"}, {"sku": "b"}]
                }
            })
        );
    }

    #[test]
    fn scalars_are_untouched() {
        let mut value = json!("platform_fee");
        assert_eq!(ResponseSanitizer::default().sanitize(&mut value), 0);
        assert_eq!(value, json!("platform_fee"));
    }

    #[test]
    fn custom_keys() {
        let mut value = json!({"secret": 1, "public": 2});
        ResponseSanitizer::new(["secret"]).sanitize(&mut value);
        assert_eq!(value, json!({"public": 2}));
    }
}
