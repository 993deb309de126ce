//! 名额账本

use tracing::{debug, instrument, warn};

use crate::error::{RankError, Result};
use crate::models::UserLimit;
use crate::repository::RankStore;
use rank_shared::observability::metrics::RANK_CAPACITY_EXCEEDED_TOTAL;

/// 排位名额账本
///
/// 无状态，所有操作都在调用方传入的事务内执行。计数器在首次访问时以 0 创建，
/// 释放到 0 后保留，随排位删除。
#[derive(Debug, Clone, Copy, Default)]
pub struct CapacityLedger;

impl CapacityLedger {
    pub fn new() -> Self {
        Self
    }

    /// 查询当前占用
    pub async fn get_usage<S: RankStore>(&self, store: &mut S, rank_id: i64) -> Result<i32> {
        store.read_capacity(rank_id).await
    }

    /// 预占一个名额
    ///
    /// 锁定计数器后重新读取排位限制，避免使用事务外读到的过期限制。
    /// 名额已满时返回 `CapacityExceeded`，计数器保持不变。
    #[instrument(skip(self, store))]
    pub async fn reserve<S: RankStore>(&self, store: &mut S, rank_id: i64) -> Result<i32> {
        let usage = store.lock_capacity(rank_id).await?;
        let rank = store
            .get_rank(rank_id)
            .await?
            .ok_or(RankError::RankNotFound(rank_id))?;

        if rank.stackable {
            return Err(RankError::Internal(format!(
                "可叠加排位不占用名额: rank_id={}",
                rank_id
            )));
        }

        let limit = rank.limit();
        if !limit.has_room(usage) {
            metrics::counter!(RANK_CAPACITY_EXCEEDED_TOTAL).increment(1);
            debug!(rank_id, usage, limit = rank.user_limit, "排位名额已满");
            return Err(RankError::CapacityExceeded {
                rank_id,
                limit: rank.user_limit,
            });
        }

        let updated = usage.saturating_add(1);
        store.write_capacity(rank_id, updated).await?;
        debug!(rank_id, usage = updated, "名额预占成功");
        Ok(updated)
    }

    /// 释放一个名额，计数不会低于 0
    #[instrument(skip(self, store))]
    pub async fn release<S: RankStore>(&self, store: &mut S, rank_id: i64) -> Result<i32> {
        let usage = store.lock_capacity(rank_id).await?;
        if usage <= 0 {
            warn!(rank_id, "释放名额时计数器已为 0，忽略");
            return Ok(0);
        }

        let updated = usage - 1;
        store.write_capacity(rank_id, updated).await?;
        debug!(rank_id, usage = updated, "名额已释放");
        Ok(updated)
    }

    /// 校验新的名额限制是否能容纳当前占用
    ///
    /// 在计数器行锁下读取，调用方需在同一事务内写入新限制
    pub async fn ensure_limit_fits<S: RankStore>(
        &self,
        store: &mut S,
        rank_id: i64,
        new_limit: i32,
    ) -> Result<()> {
        let usage = store.lock_capacity(rank_id).await?;
        match UserLimit::from_raw(new_limit) {
            UserLimit::Capped(limit) if usage > limit => Err(RankError::Validation(format!(
                "名额限制 {} 低于当前占用 {}",
                limit, usage
            ))),
            UserLimit::Disabled if usage > 0 => Err(RankError::Validation(format!(
                "排位仍有 {} 名持有者，不能停用",
                usage
            ))),
            _ => Ok(()),
        }
    }
}
