//! 可叠加排位集合计算
//!
//! 可叠加排位只看积分阈值，不占名额、不影响主排位

use std::collections::BTreeSet;

use crate::models::CatalogView;

/// 可叠加排位集合差异
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackableDiff {
    pub added: Vec<i64>,
    pub removed: Vec<i64>,
}

impl StackableDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// 积分可达的全部可叠加排位
pub fn eligible_stackables(catalog: &CatalogView, points: i32) -> BTreeSet<i64> {
    catalog
        .ranks()
        .iter()
        .filter(|r| r.stackable && r.is_reached_by(points))
        .map(|r| r.id)
        .collect()
}

/// 计算当前持有集合到目标集合的差异
pub fn diff(held: &BTreeSet<i64>, eligible: &BTreeSet<i64>) -> StackableDiff {
    StackableDiff {
        added: eligible.difference(held).copied().collect(),
        removed: held.difference(eligible).copied().collect(),
    }
}
