use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-key ordered collection of scalar metrics.
///
/// The update loop appends one value per micro-batch (loss, clip fractions,
/// KL) or per mini-batch (gradient norm) and hands the whole log back to the
/// caller, which decides how to reduce it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricsLog {
    values: BTreeMap<String, Vec<f64>>,
}

impl MetricsLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, key: impl Into<String>, value: f64) {
        self.values.entry(key.into()).or_default().push(value);
    }

    /// Append every `(key, value)` pair.
    pub fn append_all<K: Into<String>>(&mut self, entries: impl IntoIterator<Item = (K, f64)>) {
        for (key, value) in entries {
            self.append(key, value);
        }
    }

    /// Move all values of `other` to the end of this log.
    pub fn extend(&mut self, other: MetricsLog) {
        for (key, values) in other.values {
            self.values.entry(key).or_default().extend(values);
        }
    }

    pub fn get(&self, key: &str) -> Option<&[f64]> {
        self.values.get(key).map(Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Arithmetic mean of one key, or `None` if it was never recorded.
    pub fn mean(&self, key: &str) -> Option<f64> {
        let values = self.values.get(key)?;
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }

    /// Mean of every key.
    pub fn summary(&self) -> BTreeMap<String, f64> {
        self.values
            .keys()
            .filter_map(|k| self.mean(k).map(|m| (k.clone(), m)))
            .collect()
    }

    pub fn into_inner(self) -> BTreeMap<String, Vec<f64>> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_keeps_order() {
        let mut log = MetricsLog::new();
        log.append("actor/pg_loss", 1.0);
        log.append("actor/pg_loss", 3.0);
        log.append_all([("actor/grad_norm", 0.5)]);
        assert_eq!(log.get("actor/pg_loss").unwrap(), &[1.0, 3.0]);
        assert_eq!(log.mean("actor/pg_loss"), Some(2.0));
        assert_eq!(log.mean("missing"), None);

        let mut other = MetricsLog::new();
        other.append("actor/pg_loss", 5.0);
        log.extend(other);
        assert_eq!(log.get("actor/pg_loss").unwrap(), &[1.0, 3.0, 5.0]);
        assert_eq!(log.summary()["actor/grad_norm"], 0.5);
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let mut log = MetricsLog::new();
        log.append("a", 1.0);
        let json = serde_json::to_string(&log).unwrap();
        assert_eq!(json, r#"{"a":[1.0]}"#);
    }
}
