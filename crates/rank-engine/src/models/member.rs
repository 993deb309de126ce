//! 成员排位状态
//!
//! 成员在首次积分交互时惰性创建。排位之间通过 id 引用，不持有对象引用。

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 公会成员的积分与排位状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub guild_id: i64,
    /// 平台侧用户 ID
    pub user_id: i64,
    pub points: i32,
    /// 当前独占排位
    #[sqlx(default)]
    pub main_rank_id: Option<i64>,
    /// 下一个可达独占排位（仅用于展示）
    #[sqlx(default)]
    pub next_rank_id: Option<i64>,
    /// 当前持有的可叠加排位
    #[sqlx(skip)]
    #[serde(default)]
    pub stackable_ranks: BTreeSet<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Member {
    /// 新成员（零积分、无排位）
    pub fn new(guild_id: i64, user_id: i64) -> Self {
        let now = Utc::now();
        Self {
            guild_id,
            user_id,
            points: 0,
            main_rank_id: None,
            next_rank_id: None,
            stackable_ranks: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 成员当前持有的全部排位（独占 + 可叠加）
    pub fn held_rank_ids(&self) -> BTreeSet<i64> {
        let mut held = self.stackable_ranks.clone();
        held.extend(self.main_rank_id);
        held
    }

    /// 增加积分，结果饱和在 i32 范围内
    pub fn add_points(&mut self, amount: i32) {
        self.points = self.points.saturating_add(amount);
    }

    /// 扣减积分，结果饱和在 i32 范围内
    pub fn subtract_points(&mut self, amount: i32) {
        self.points = self.points.saturating_sub(amount);
    }
}
