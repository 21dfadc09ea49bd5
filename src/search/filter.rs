use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::types::ValueType;

/// Display/paging view over stored results. Advisory only: applying or
/// clearing a filter never mutates storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultFilter {
    /// Inclusive address bounds.
    pub address_range: Option<(u64, u64)>,
    pub type_whitelist: Option<HashSet<ValueType>>,
}

impl ResultFilter {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.address_range.is_none() && self.type_whitelist.is_none()
    }

    #[inline]
    pub fn matches(&self, address: u64, value_type: ValueType) -> bool {
        if let Some((start, end)) = self.address_range
            && (address < start || address > end)
        {
            return false;
        }
        if let Some(ref whitelist) = self.type_whitelist
            && !whitelist.contains(&value_type)
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = ResultFilter::default();
        assert!(filter.is_empty());
        assert!(filter.matches(0, ValueType::Byte));
        assert!(filter.matches(u64::MAX, ValueType::Auto));
    }

    #[test]
    fn test_address_bounds_inclusive() {
        let filter = ResultFilter {
            address_range: Some((0x1000, 0x2000)),
            type_whitelist: None,
        };
        assert!(filter.matches(0x1000, ValueType::Dword));
        assert!(filter.matches(0x2000, ValueType::Dword));
        assert!(!filter.matches(0xFFF, ValueType::Dword));
        assert!(!filter.matches(0x2001, ValueType::Dword));
    }

    #[test]
    fn test_type_whitelist() {
        let filter = ResultFilter {
            address_range: None,
            type_whitelist: Some([ValueType::Float, ValueType::Double].into_iter().collect()),
        };
        assert!(filter.matches(0x1000, ValueType::Float));
        assert!(!filter.matches(0x1000, ValueType::Dword));
    }
}
