//! Physical properties. Sort is the only property the engine tracks; a
//! property set is an unordered collection keyed by its canonical JSON form.

use serde::{Deserialize, Serialize};

use crate::plan::SortKey;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PropertySet {
    pub sort_keys: Vec<SortKey>,
}

impl PropertySet {
    pub fn empty() -> Self {
        PropertySet::default()
    }

    pub fn with_sort(sort_keys: Vec<SortKey>) -> Self {
        PropertySet { sort_keys }
    }

    pub fn is_empty(&self) -> bool {
        self.sort_keys.is_empty()
    }

    /// Canonical map key.
    pub fn key(&self) -> String {
        serde_json::to_string(self).expect("property sets are serializable")
    }

    /// A required set is satisfied when the provided sort has it as a
    /// prefix, same expressions and directions.
    pub fn satisfied_by(&self, provided: &PropertySet) -> bool {
        if self.sort_keys.len() > provided.sort_keys.len() {
            return false;
        }
        self.sort_keys
            .iter()
            .zip(&provided.sort_keys)
            .all(|(required, given)| required == given)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::expr::BoundExpr;
    use quill_storage::{SqlTypeId, SqlValue};

    fn key(n: i32, descending: bool) -> SortKey {
        SortKey {
            expr: BoundExpr::Constant {
                value: SqlValue::Integer(n),
                type_id: SqlTypeId::Integer,
            },
            descending,
        }
    }

    #[test]
    fn prefix_satisfaction() {
        let required = PropertySet::with_sort(vec![key(1, false)]);
        let provided = PropertySet::with_sort(vec![key(1, false), key(2, true)]);
        assert!(required.satisfied_by(&provided));
        assert!(!provided.satisfied_by(&required));
        assert!(PropertySet::empty().satisfied_by(&required));
    }

    #[test]
    fn direction_must_match() {
        let required = PropertySet::with_sort(vec![key(1, false)]);
        let provided = PropertySet::with_sort(vec![key(1, true)]);
        assert!(!required.satisfied_by(&provided));
    }
}
