//! 排位晋升引擎
//!
//! 根据成员当前积分与公会排位目录，计算并写入成员应持有的排位。
//!
//! ## 晋升流程
//!
//! 1. 锁定成员行 -> 2. 可叠加排位按阈值增删 -> 3. 按阈值降序选出第一个
//!    未停用且有空余名额的独占排位 -> 4. 计算下一排位指针
//!    -> 5. 预占新名额、释放旧名额 -> 6. 写入指针并记录角色变更
//!
//! ## 加锁顺序
//!
//! 所有事务都先锁成员行（用户 ID 升序），再锁名额计数器（排位 ID 升序）。
//! 单个成员晋升只涉及一个成员和至多两个计数器；批量晋升在开始前通过
//! [`PromotionEngine::lock_batch`] 一次取得全部成员与计数器的锁。
//!
//! 重复调用是幂等的：排位未变化时不写库，也不产生角色变更。
//! 角色变更只记录到 [`RoleChangeSet`]，由调用方在事务提交后下发。

use std::collections::BTreeSet;

use tracing::{debug, info, instrument, warn};

use crate::error::{RankError, Result};
use crate::gateway::RoleChangeSet;
use crate::ledger::CapacityLedger;
use crate::models::{CatalogView, Member, Rank, UserLimit};
use crate::repository::RankStore;
use crate::service::dto::{BatchReport, SkippedMember};
use crate::service::stackable;
use rank_shared::observability::metrics::{RANK_DEMOTIONS_TOTAL, RANK_PROMOTIONS_TOTAL};

/// 单次晋升结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionOutcome {
    /// 晋升后的主排位
    pub main_rank: Option<Rank>,
    /// 本次是否写入了任何变化
    pub changed: bool,
}

/// 排位晋升引擎
#[derive(Debug, Clone, Copy, Default)]
pub struct PromotionEngine {
    ledger: CapacityLedger,
}

impl PromotionEngine {
    pub fn new(ledger: CapacityLedger) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &CapacityLedger {
        &self.ledger
    }

    /// 读取公会排位目录
    pub async fn load_catalog<S: RankStore>(&self, store: &mut S, guild_id: i64) -> Result<CatalogView> {
        Ok(CatalogView::new(store.list_ranks(guild_id).await?))
    }

    /// 重新计算并写入单个成员的排位
    ///
    /// 名额被并发抢占时返回 `CapacityExceeded`，此前已写入的可叠加排位变化保留，
    /// 主排位保持原值等待下次晋升
    #[instrument(skip(self, store, catalog, changes))]
    pub async fn promote<S: RankStore>(
        &self,
        store: &mut S,
        catalog: &CatalogView,
        guild_id: i64,
        user_id: i64,
        changes: &mut RoleChangeSet,
    ) -> Result<PromotionOutcome> {
        let mut member = store.lock_member(guild_id, user_id).await?;
        let mut changed = self.sync_stackables(store, catalog, &member, changes).await?;

        let best = self.select_best(store, catalog, &member).await?;
        let floor = best
            .as_ref()
            .map(|r| r.points_required)
            .unwrap_or(member.points);
        let next_rank_id = catalog.next_exclusive_above(floor).map(|r| r.id);
        let previous = member.main_rank_id;

        let main_rank = match best {
            None => {
                if let Some(prev_id) = previous {
                    self.vacate(store, catalog, &member, prev_id, changes).await?;
                    member.main_rank_id = None;
                    metrics::counter!(RANK_DEMOTIONS_TOTAL).increment(1);
                    info!(guild_id, user_id, rank_id = prev_id, "成员失去主排位");
                }
                None
            }
            Some(best) if previous == Some(best.id) => Some(best),
            Some(best) => {
                self.lock_counters_in_order(store, catalog, best.id, previous)
                    .await?;
                if let Err(e) = self.ledger.reserve(store, best.id).await {
                    // 主排位保持原值，下一排位指针照常写入
                    if matches!(e, RankError::CapacityExceeded { .. })
                        && member.next_rank_id != next_rank_id
                    {
                        member.next_rank_id = next_rank_id;
                        store.update_rank_pointers(&member).await?;
                    }
                    return Err(e);
                }

                if let Some(prev_id) = previous {
                    self.vacate(store, catalog, &member, prev_id, changes).await?;
                }
                changes.grant(guild_id, user_id, &best);
                member.main_rank_id = Some(best.id);

                let previous_points = previous
                    .and_then(|id| catalog.find(id))
                    .map(|r| r.points_required);
                if previous_points.is_some_and(|p| p > best.points_required) {
                    metrics::counter!(RANK_DEMOTIONS_TOTAL).increment(1);
                } else {
                    metrics::counter!(RANK_PROMOTIONS_TOTAL).increment(1);
                }
                info!(
                    guild_id,
                    user_id,
                    from = ?previous,
                    to = best.id,
                    "成员主排位变更"
                );
                Some(best)
            }
        };

        if member.main_rank_id != previous || member.next_rank_id != next_rank_id {
            member.next_rank_id = next_rank_id;
            store.update_rank_pointers(&member).await?;
            changed = true;
        }

        Ok(PromotionOutcome { main_rank, changed })
    }

    /// 按给定顺序批量晋升
    ///
    /// 单个成员名额不足时跳过并记录，其余成员继续；其他错误中止整个批次，
    /// 由调用方回滚事务
    pub async fn promote_batch<S: RankStore>(
        &self,
        store: &mut S,
        catalog: &CatalogView,
        guild_id: i64,
        user_ids: &[i64],
        changes: &mut RoleChangeSet,
    ) -> Result<BatchReport> {
        self.lock_batch(store, guild_id, user_ids, &catalog.counter_ids())
            .await?;
        let mut report = BatchReport::default();

        for &user_id in user_ids {
            report.processed += 1;
            match self
                .promote(store, catalog, guild_id, user_id, changes)
                .await
            {
                Ok(outcome) => {
                    if outcome.changed {
                        report.changed += 1;
                    }
                }
                Err(RankError::CapacityExceeded { rank_id, limit }) => {
                    warn!(guild_id, user_id, rank_id, limit, "名额不足，跳过该成员");
                    report.skipped.push(SkippedMember {
                        user_id,
                        rank_id,
                        reason: format!("排位名额已满 (limit={})", limit),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        debug!(
            guild_id,
            processed = report.processed,
            changed = report.changed,
            skipped = report.skipped.len(),
            "批量晋升完成"
        );
        Ok(report)
    }

    /// 按统一顺序锁定批次涉及的成员行与计数器
    ///
    /// 锁持有到事务结束，之后的晋升只会重入已持有的锁。重复的用户 ID 只锁一次。
    pub async fn lock_batch<S: RankStore>(
        &self,
        store: &mut S,
        guild_id: i64,
        user_ids: &[i64],
        counter_ids: &BTreeSet<i64>,
    ) -> Result<()> {
        let members: BTreeSet<i64> = user_ids.iter().copied().collect();
        for &user_id in &members {
            store.lock_member(guild_id, user_id).await?;
        }
        for &rank_id in counter_ids {
            store.lock_capacity(rank_id).await?;
        }

        debug!(
            guild_id,
            members = members.len(),
            counters = counter_ids.len(),
            "批次行锁已取得"
        );
        Ok(())
    }

    /// 清空成员在指定排位上的主排位
    ///
    /// 用于删除排位时无法转入其他排位的持有者，返回是否清空
    pub async fn vacate_main<S: RankStore>(
        &self,
        store: &mut S,
        catalog: &CatalogView,
        guild_id: i64,
        user_id: i64,
        rank_id: i64,
        changes: &mut RoleChangeSet,
    ) -> Result<bool> {
        let mut member = store.lock_member(guild_id, user_id).await?;
        if member.main_rank_id != Some(rank_id) {
            return Ok(false);
        }

        self.vacate(store, catalog, &member, rank_id, changes).await?;
        member.main_rank_id = None;
        member.next_rank_id = catalog.next_exclusive_above(member.points).map(|r| r.id);
        store.update_rank_pointers(&member).await?;
        metrics::counter!(RANK_DEMOTIONS_TOTAL).increment(1);
        warn!(guild_id, user_id, rank_id, "持有者无法转入其他排位，主排位已清空");
        Ok(true)
    }

    /// 按阈值增删可叠加排位，返回是否有变化
    async fn sync_stackables<S: RankStore>(
        &self,
        store: &mut S,
        catalog: &CatalogView,
        member: &Member,
        changes: &mut RoleChangeSet,
    ) -> Result<bool> {
        let eligible = stackable::eligible_stackables(catalog, member.points);
        let diff = stackable::diff(&member.stackable_ranks, &eligible);
        if diff.is_empty() {
            return Ok(false);
        }

        store
            .apply_stackable_diff(member.guild_id, member.user_id, &diff.added, &diff.removed)
            .await?;

        for rank in diff.added.iter().filter_map(|id| catalog.find(*id)) {
            changes.grant(member.guild_id, member.user_id, rank);
        }
        for rank in diff.removed.iter().filter_map(|id| catalog.find(*id)) {
            changes.revoke(member.guild_id, member.user_id, rank);
        }

        debug!(
            user_id = member.user_id,
            added = ?diff.added,
            removed = ?diff.removed,
            "可叠加排位已更新"
        );
        Ok(true)
    }

    /// 选出成员应持有的独占排位
    ///
    /// 当前持有者始终可以保留自己的排位，即使该排位已满
    async fn select_best<S: RankStore>(
        &self,
        store: &mut S,
        catalog: &CatalogView,
        member: &Member,
    ) -> Result<Option<Rank>> {
        for rank in catalog.exclusive_candidates(member.points) {
            let limit = rank.limit();
            if limit == UserLimit::Disabled {
                continue;
            }
            if member.main_rank_id == Some(rank.id) {
                return Ok(Some(rank.clone()));
            }
            let usage = self.ledger.get_usage(store, rank.id).await?;
            if limit.has_room(usage) {
                return Ok(Some(rank.clone()));
            }
        }
        Ok(None)
    }

    /// 释放旧主排位的名额并记录撤销角色
    ///
    /// 排位已不在目录中（被并发删除）时，计数器已随排位删除，只清理指针
    async fn vacate<S: RankStore>(
        &self,
        store: &mut S,
        catalog: &CatalogView,
        member: &Member,
        rank_id: i64,
        changes: &mut RoleChangeSet,
    ) -> Result<()> {
        if let Some(rank) = catalog.find(rank_id) {
            self.ledger.release(store, rank_id).await?;
            changes.revoke(member.guild_id, member.user_id, rank);
        }
        Ok(())
    }

    /// 按排位 ID 升序锁定新旧两个计数器
    async fn lock_counters_in_order<S: RankStore>(
        &self,
        store: &mut S,
        catalog: &CatalogView,
        target: i64,
        previous: Option<i64>,
    ) -> Result<()> {
        let mut ids = vec![target];
        ids.extend(previous.filter(|id| catalog.find(*id).is_some()));
        ids.sort_unstable();
        for id in ids {
            store.lock_capacity(id).await?;
        }
        Ok(())
    }
}
