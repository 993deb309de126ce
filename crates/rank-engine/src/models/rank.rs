//! 排位相关实体定义
//!
//! 排位分为两类：独占排位（每个成员至多一个，可限制名额）和
//! 可叠加排位（按积分阈值任意持有，永不限制名额）。

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 名额限制
///
/// 数据库中以整数存储：`-1` 不限量，`0` 停用（不可分配），正数为名额上限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UserLimit {
    Unlimited,
    Disabled,
    Capped(i32),
}

impl UserLimit {
    pub const UNLIMITED_RAW: i32 = -1;

    /// 从数据库原始值解析，小于 -1 的非法值按不限量处理
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::Disabled,
            n if n > 0 => Self::Capped(n),
            _ => Self::Unlimited,
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            Self::Unlimited => Self::UNLIMITED_RAW,
            Self::Disabled => 0,
            Self::Capped(n) => n,
        }
    }

    /// 当前占用下是否还有空余名额
    pub fn has_room(self, usage: i32) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Disabled => false,
            Self::Capped(limit) => usage < limit,
        }
    }
}

/// 排位定义
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Rank {
    pub id: i64,
    pub guild_id: i64,
    /// 排位名称，公会内唯一
    pub name: String,
    /// 获得该排位所需积分，公会内唯一
    pub points_required: i32,
    /// 名额限制原始值，见 [`UserLimit`]
    pub user_limit: i32,
    /// 是否为可叠加排位
    pub stackable: bool,
    /// 平台侧角色句柄，未绑定角色时为空
    #[sqlx(default)]
    pub role_ref: Option<String>,
    /// 展示颜色（RGB 整数）
    #[sqlx(default)]
    pub color: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rank {
    pub fn limit(&self) -> UserLimit {
        UserLimit::from_raw(self.user_limit)
    }

    /// 是否为可分配的独占排位
    pub fn is_assignable(&self) -> bool {
        !self.stackable && self.limit() != UserLimit::Disabled
    }

    /// 成员积分是否达到该排位阈值
    pub fn is_reached_by(&self, points: i32) -> bool {
        self.points_required <= points
    }
}

/// 公会排位目录的只读视图
///
/// 排位按 `points_required` 升序排列。`retired` 保存正在被删除的排位，
/// 它们不再参与资格计算，但其持有者仍需通过 id 找到对应角色以便撤销。
#[derive(Debug, Clone, Default)]
pub struct CatalogView {
    ranks: Vec<Rank>,
    retired: Vec<Rank>,
}

impl CatalogView {
    pub fn new(mut ranks: Vec<Rank>) -> Self {
        ranks.sort_by_key(|r| (r.points_required, r.id));
        Self {
            ranks,
            retired: Vec::new(),
        }
    }

    /// 将指定排位移出资格计算（用于删除排位前的降级）
    pub fn retire(mut self, rank_id: i64) -> Self {
        if let Some(pos) = self.ranks.iter().position(|r| r.id == rank_id) {
            let rank = self.ranks.remove(pos);
            self.retired.push(rank);
        }
        self
    }

    /// 参与资格计算的排位（升序）
    pub fn ranks(&self) -> &[Rank] {
        &self.ranks
    }

    /// 按 id 查找排位，包括已退役的排位
    pub fn find(&self, rank_id: i64) -> Option<&Rank> {
        self.ranks
            .iter()
            .chain(self.retired.iter())
            .find(|r| r.id == rank_id)
    }

    /// 积分可达的独占排位，按阈值降序
    pub fn exclusive_candidates(&self, points: i32) -> impl Iterator<Item = &Rank> {
        self.ranks
            .iter()
            .rev()
            .filter(move |r| !r.stackable && r.is_reached_by(points))
    }

    /// 阈值严格高于 `floor` 的最低独占排位
    pub fn next_exclusive_above(&self, floor: i32) -> Option<&Rank> {
        self.ranks
            .iter()
            .find(|r| !r.stackable && r.points_required > floor)
    }

    /// 占用名额计数器的排位 ID（独占排位，含已退役），升序
    pub fn counter_ids(&self) -> BTreeSet<i64> {
        self.ranks
            .iter()
            .chain(self.retired.iter())
            .filter(|r| !r.stackable)
            .map(|r| r.id)
            .collect()
    }

    /// 所有绑定了角色的排位的角色句柄
    pub fn role_refs(&self) -> impl Iterator<Item = &str> {
        self.ranks.iter().filter_map(|r| r.role_ref.as_deref())
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }
}
