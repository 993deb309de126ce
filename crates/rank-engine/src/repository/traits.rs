//! 仓储 Trait 定义
//!
//! 服务层只依赖这里的抽象，Postgres 与内存实现均满足相同的加锁语义

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Member, Rank};
use crate::service::dto::NewRank;

/// 单个事务内的排位存储
///
/// 实现需保证：
/// - `lock_capacity` / `lock_member` 获取的行锁持有到 `commit` 或丢弃
/// - 同一事务内重复加锁是可重入的
/// - 丢弃未提交的存储即回滚
#[async_trait]
pub trait RankStore: Send {
    // 排位目录
    /// 公会全部排位，按所需积分升序
    async fn list_ranks(&mut self, guild_id: i64) -> Result<Vec<Rank>>;
    async fn get_rank(&mut self, rank_id: i64) -> Result<Option<Rank>>;
    async fn insert_rank(&mut self, rank: &NewRank) -> Result<Rank>;
    async fn update_rank(&mut self, rank: &Rank) -> Result<Rank>;
    async fn delete_rank(&mut self, rank_id: i64) -> Result<()>;

    // 名额计数器
    /// 读取当前占用（不加锁），计数器不存在时视为 0
    async fn read_capacity(&mut self, rank_id: i64) -> Result<i32>;
    /// 锁定计数器并返回当前占用，计数器不存在时以 0 创建
    async fn lock_capacity(&mut self, rank_id: i64) -> Result<i32>;
    async fn write_capacity(&mut self, rank_id: i64, user_count: i32) -> Result<()>;

    // 成员
    async fn get_member(&mut self, guild_id: i64, user_id: i64) -> Result<Option<Member>>;
    /// 锁定成员行，不存在时以零积分创建
    async fn lock_member(&mut self, guild_id: i64, user_id: i64) -> Result<Member>;
    /// 公会全部成员，按积分降序、用户 ID 升序
    async fn list_members(&mut self, guild_id: i64) -> Result<Vec<Member>>;
    /// 排位变更可能影响到的成员
    ///
    /// 包括积分不低于 `min_points` 的成员，以及主排位、下一排位或
    /// 可叠加排位引用了 `rank_id` 的成员。结果排序同 `list_members`。
    async fn list_members_affected_by(
        &mut self,
        guild_id: i64,
        rank_id: i64,
        min_points: Option<i32>,
    ) -> Result<Vec<Member>>;
    async fn update_points(&mut self, guild_id: i64, user_id: i64, points: i32) -> Result<()>;
    /// 写入主排位与下一排位指针
    async fn update_rank_pointers(&mut self, member: &Member) -> Result<()>;
    async fn apply_stackable_diff(
        &mut self,
        guild_id: i64,
        user_id: i64,
        added: &[i64],
        removed: &[i64],
    ) -> Result<()>;

    /// 提交事务并释放全部行锁
    async fn commit(self) -> Result<()>
    where
        Self: Sized;
}

/// 事务工厂
#[async_trait]
pub trait StoreProvider: Send + Sync {
    type Store: RankStore;

    async fn begin(&self) -> Result<Self::Store>;
}
