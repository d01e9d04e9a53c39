//! Class id to species key resolution.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

use crate::outcome::FailureReason;

/// Species key used for unmapped ids under `UnknownClassPolicy::Lenient`.
pub const UNKNOWN_SPECIES_KEY: &str = "unknown";

/// Cultivar keys of the reference deployment, indexed by model class id.
pub const DEFAULT_CLASS_KEYS: [(u32, &str); 10] = [
    (0, "candyapple"),
    (1, "namwa"),
    (2, "namwadam"),
    (3, "homthong"),
    (4, "nak"),
    (5, "thepphanom"),
    (6, "kai"),
    (7, "lepchanggud"),
    (8, "ngachang"),
    (9, "huamao"),
];

/// How an id missing from the table is reported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnknownClassPolicy {
    /// Fail the request with `unknown_class_id`.
    #[default]
    Strict,
    /// Succeed with the `"unknown"` species key.
    Lenient,
}

impl UnknownClassPolicy {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lenient" => Ok(Self::Lenient),
            other => Err(anyhow!(
                "unknown class policy must be 'strict' or 'lenient', got '{}'",
                other
            )),
        }
    }
}

/// Fixed id -> species key mapping. Read-only once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassKeyTable {
    keys: BTreeMap<u32, String>,
}

impl Default for ClassKeyTable {
    fn default() -> Self {
        Self {
            keys: DEFAULT_CLASS_KEYS
                .iter()
                .map(|(id, key)| (*id, key.to_string()))
                .collect(),
        }
    }
}

impl ClassKeyTable {
    /// Keys are lowercased; empty keys are rejected.
    pub fn new(entries: impl IntoIterator<Item = (u32, String)>) -> Result<Self> {
        let mut keys = BTreeMap::new();
        for (id, key) in entries {
            let key = key.trim().to_lowercase();
            if key.is_empty() {
                return Err(anyhow!("class {} has an empty species key", id));
            }
            if keys.insert(id, key).is_some() {
                return Err(anyhow!("class {} is mapped twice", id));
            }
        }
        if keys.is_empty() {
            return Err(anyhow!("class key table must not be empty"));
        }
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, class_id: u32) -> Option<&str> {
        self.keys.get(&class_id).map(String::as_str)
    }

    /// Result mapper: class id to species key under `policy`.
    pub fn resolve(&self, class_id: u32, policy: UnknownClassPolicy) -> Result<String, FailureReason> {
        match (self.get(class_id), policy) {
            (Some(key), _) => Ok(key.to_string()),
            (None, UnknownClassPolicy::Lenient) => Ok(UNKNOWN_SPECIES_KEY.to_string()),
            (None, UnknownClassPolicy::Strict) => Err(FailureReason::UnknownClassId),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_has_ten_cultivars() {
        let table = ClassKeyTable::default();
        assert_eq!(table.len(), 10);
        assert_eq!(table.get(0), Some("candyapple"));
        assert_eq!(table.get(9), Some("huamao"));
    }

    #[test]
    fn strict_policy_rejects_unknown_ids() {
        let table = ClassKeyTable::default();
        assert_eq!(
            table.resolve(99, UnknownClassPolicy::Strict),
            Err(FailureReason::UnknownClassId)
        );
        assert_eq!(table.resolve(7, UnknownClassPolicy::Strict).unwrap(), "lepchanggud");
    }

    #[test]
    fn lenient_policy_maps_to_sentinel() {
        let table = ClassKeyTable::default();
        assert_eq!(table.resolve(99, UnknownClassPolicy::Lenient).unwrap(), "unknown");
    }

    #[test]
    fn custom_table_validation() {
        let table = ClassKeyTable::new([(0, " Kluai ".to_string())]).unwrap();
        assert_eq!(table.get(0), Some("kluai"));
        assert!(ClassKeyTable::new([(0, "".to_string())]).is_err());
        assert!(ClassKeyTable::new(Vec::<(u32, String)>::new()).is_err());
    }

    #[test]
    fn policy_parsing() {
        assert_eq!(UnknownClassPolicy::parse("Strict").unwrap(), UnknownClassPolicy::Strict);
        assert_eq!(UnknownClassPolicy::parse("lenient").unwrap(), UnknownClassPolicy::Lenient);
        assert!(UnknownClassPolicy::parse("maybe").is_err());
    }
}
