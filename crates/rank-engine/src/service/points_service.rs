//! 积分变更服务
//!
//! 积分变更与随后的晋升在同一事务内完成。名额被抢占时积分变更照常提交，
//! 主排位保持原值，调用方收到 `CapacityExceeded` 后可稍后重试晋升。

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::error::{RankError, Result};
use crate::gateway::{RoleChangeSet, RoleGateway};
use crate::models::{CatalogView, Member};
use crate::repository::{RankStore, StoreProvider};
use crate::service::dto::{BatchReport, MemberRankSummary, PointsChangeResult, ResyncReport};
use crate::service::promotion_engine::PromotionEngine;
use crate::service::reconciliation_service::ReconciliationService;

/// 积分变更类型
#[derive(Debug, Clone, Copy)]
enum PointsChange {
    Grant(i32),
    Revoke(i32),
    Set(i32),
}

impl PointsChange {
    fn apply(self, member: &mut Member) {
        match self {
            Self::Grant(amount) => member.add_points(amount),
            Self::Revoke(amount) => member.subtract_points(amount),
            Self::Set(value) => member.points = value,
        }
    }
}

/// 积分变更服务
pub struct PointsService<P: StoreProvider> {
    provider: Arc<P>,
    gateway: Arc<dyn RoleGateway>,
    engine: PromotionEngine,
    reconciler: ReconciliationService<P>,
}

impl<P: StoreProvider> PointsService<P> {
    pub fn new(provider: Arc<P>, gateway: Arc<dyn RoleGateway>) -> Self {
        Self {
            reconciler: ReconciliationService::new(provider.clone(), gateway.clone()),
            provider,
            gateway,
            engine: PromotionEngine::default(),
        }
    }

    /// 增加积分
    pub async fn grant(&self, guild_id: i64, user_id: i64, amount: i32) -> Result<PointsChangeResult> {
        self.change(guild_id, user_id, PointsChange::Grant(amount))
            .await
    }

    /// 扣减积分
    pub async fn revoke(&self, guild_id: i64, user_id: i64, amount: i32) -> Result<PointsChangeResult> {
        self.change(guild_id, user_id, PointsChange::Revoke(amount))
            .await
    }

    /// 直接设置积分
    pub async fn set(&self, guild_id: i64, user_id: i64, value: i32) -> Result<PointsChangeResult> {
        self.change(guild_id, user_id, PointsChange::Set(value))
            .await
    }

    #[instrument(skip(self))]
    async fn change(&self, guild_id: i64, user_id: i64, change: PointsChange) -> Result<PointsChangeResult> {
        let mut store = self.provider.begin().await?;
        let mut member = store.lock_member(guild_id, user_id).await?;
        change.apply(&mut member);
        store.update_points(guild_id, user_id, member.points).await?;

        let catalog = self.engine.load_catalog(&mut store, guild_id).await?;
        let mut changes = RoleChangeSet::new();
        let promoted = self
            .engine
            .promote(&mut store, &catalog, guild_id, user_id, &mut changes)
            .await;

        match promoted {
            Ok(outcome) => {
                let member = store
                    .get_member(guild_id, user_id)
                    .await?
                    .ok_or(RankError::MemberNotFound { guild_id, user_id })?;
                store.commit().await?;
                let gateway = changes.apply(self.gateway.as_ref()).await;

                Ok(PointsChangeResult {
                    member,
                    main_rank: outcome.main_rank,
                    gateway,
                })
            }
            Err(e @ RankError::CapacityExceeded { .. }) => {
                // 积分变更保留，主排位等待下次晋升
                store.commit().await?;
                let gateway = changes.apply(self.gateway.as_ref()).await;
                warn!(
                    guild_id,
                    user_id,
                    points = member.points,
                    gateway_failures = gateway.failures.len(),
                    "积分已更新，但目标排位名额已满"
                );
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// 批量增加积分
    ///
    /// 单个事务内先锁定全部成员与计数器，写入积分后按积分降序逐个晋升
    #[instrument(skip(self, grants), fields(count = grants.len()))]
    pub async fn bulk_grant(&self, guild_id: i64, grants: &[(i64, i32)]) -> Result<BatchReport> {
        let mut store = self.provider.begin().await?;
        let catalog = self.engine.load_catalog(&mut store, guild_id).await?;
        let user_ids: Vec<i64> = grants.iter().map(|&(user_id, _)| user_id).collect();
        self.engine
            .lock_batch(&mut store, guild_id, &user_ids, &catalog.counter_ids())
            .await?;

        let mut totals: BTreeMap<i64, i32> = BTreeMap::new();
        for &(user_id, amount) in grants {
            let mut member = store.lock_member(guild_id, user_id).await?;
            member.add_points(amount);
            store.update_points(guild_id, user_id, member.points).await?;
            totals.insert(user_id, member.points);
        }

        let mut ordered: Vec<(i64, i32)> = totals.into_iter().collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let user_ids: Vec<i64> = ordered.into_iter().map(|(user_id, _)| user_id).collect();

        self.promote_and_commit(store, &catalog, guild_id, &user_ids)
            .await
    }

    /// 对公会全部成员重新晋升
    #[instrument(skip(self))]
    pub async fn promote_all(&self, guild_id: i64) -> Result<BatchReport> {
        let mut store = self.provider.begin().await?;
        let catalog = self.engine.load_catalog(&mut store, guild_id).await?;
        let user_ids: Vec<i64> = store
            .list_members(guild_id)
            .await?
            .into_iter()
            .map(|m| m.user_id)
            .collect();

        self.promote_and_commit(store, &catalog, guild_id, &user_ids)
            .await
    }

    /// 管理员触发的全量角色对账
    pub async fn resync_all(&self, guild_id: i64) -> Result<ResyncReport> {
        self.reconciler.resync_all(guild_id).await
    }

    /// 成员排位概览
    pub async fn member_summary(&self, guild_id: i64, user_id: i64) -> Result<MemberRankSummary> {
        let mut store = self.provider.begin().await?;
        let member = store
            .get_member(guild_id, user_id)
            .await?
            .ok_or(RankError::MemberNotFound { guild_id, user_id })?;
        let catalog = CatalogView::new(store.list_ranks(guild_id).await?);
        store.commit().await?;

        let main_rank = member.main_rank_id.and_then(|id| catalog.find(id)).cloned();
        let next_rank = member.next_rank_id.and_then(|id| catalog.find(id)).cloned();
        let stackable_ranks = member
            .stackable_ranks
            .iter()
            .filter_map(|id| catalog.find(*id))
            .cloned()
            .collect();
        let points_to_next = next_rank
            .as_ref()
            .map(|r| r.points_required.saturating_sub(member.points).max(0));

        Ok(MemberRankSummary {
            guild_id,
            user_id,
            points: member.points,
            main_rank,
            next_rank,
            stackable_ranks,
            points_to_next,
        })
    }

    async fn promote_and_commit(
        &self,
        mut store: P::Store,
        catalog: &CatalogView,
        guild_id: i64,
        user_ids: &[i64],
    ) -> Result<BatchReport> {
        let mut changes = RoleChangeSet::new();
        let mut report = self
            .engine
            .promote_batch(&mut store, catalog, guild_id, user_ids, &mut changes)
            .await?;
        store.commit().await?;

        report.gateway = changes.apply(self.gateway.as_ref()).await;
        info!(
            guild_id,
            processed = report.processed,
            changed = report.changed,
            skipped = report.skipped.len(),
            gateway_failures = report.gateway.failures.len(),
            "批量晋升已提交"
        );
        Ok(report)
    }
}
