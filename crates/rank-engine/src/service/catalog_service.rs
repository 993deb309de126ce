//! 排位目录服务
//!
//! 负责排位定义的增删改与批量导入，校验目录级约束：
//! - 名称、所需积分在公会内唯一
//! - 可叠加排位不能设置名额限制
//! - 每个公会排位数量不超过上限
//!
//! 目录变更会改变成员资格，因此每次变更后在同一事务内对受影响成员
//! 重新晋升，提交后下发角色变更并对这些成员做一次对账。

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::error::{RankError, Result};
use crate::gateway::{RoleChangeSet, RoleGateway};
use crate::models::{CatalogView, Member, Rank, UserLimit};
use crate::repository::{RankStore, StoreProvider};
use crate::service::dto::{
    BatchReport, CreateRankRequest, NewRank, RankImportEntry, ResyncReport, UpdateRankRequest,
};
use crate::service::promotion_engine::PromotionEngine;
use crate::service::reconciliation_service::ReconciliationService;
use rank_shared::config::CatalogConfig;

/// 目录变更结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogChange {
    /// 新建、更新或被删除的排位
    pub ranks: Vec<Rank>,
    pub promotion: BatchReport,
    pub resync: ResyncReport,
}

/// 排位目录服务
pub struct RankCatalog<P: StoreProvider> {
    provider: Arc<P>,
    gateway: Arc<dyn RoleGateway>,
    engine: PromotionEngine,
    reconciler: ReconciliationService<P>,
    max_ranks: usize,
}

impl<P: StoreProvider> RankCatalog<P> {
    pub fn new(provider: Arc<P>, gateway: Arc<dyn RoleGateway>, config: &CatalogConfig) -> Self {
        Self {
            reconciler: ReconciliationService::new(provider.clone(), gateway.clone()),
            provider,
            gateway,
            engine: PromotionEngine::default(),
            max_ranks: config.max_ranks_per_guild,
        }
    }

    /// 公会排位列表，按所需积分升序
    pub async fn list(&self, guild_id: i64) -> Result<Vec<Rank>> {
        let mut store = self.provider.begin().await?;
        let ranks = store.list_ranks(guild_id).await?;
        store.commit().await?;
        Ok(ranks)
    }

    pub async fn get(&self, rank_id: i64) -> Result<Rank> {
        let mut store = self.provider.begin().await?;
        let rank = store.get_rank(rank_id).await?;
        store.commit().await?;
        rank.ok_or(RankError::RankNotFound(rank_id))
    }

    /// 创建排位
    ///
    /// 新排位阈值以上的成员，以及下一排位可能指向新排位的成员会被重新晋升
    #[instrument(skip(self), fields(guild_id = request.guild_id))]
    pub async fn create(&self, request: CreateRankRequest) -> Result<CatalogChange> {
        let request = request.trimmed();
        request.validate()?;
        let new_rank = request.into_new_rank();
        check_definition(&new_rank.name, new_rank.stackable, new_rank.user_limit)?;

        let mut store = self.provider.begin().await?;
        let existing = store.list_ranks(new_rank.guild_id).await?;
        self.check_capacity(new_rank.guild_id, existing.len(), 1)?;
        check_unique(&existing, None, &new_rank.name, new_rank.points_required)?;

        let rank = store.insert_rank(&new_rank).await?;
        let mut ranks = existing;
        ranks.push(rank.clone());
        let catalog = CatalogView::new(ranks);

        let floor = fan_out_floor(&catalog, &rank);
        let affected = store
            .list_members_affected_by(rank.guild_id, rank.id, Some(floor))
            .await?;

        info!(rank_id = rank.id, affected = affected.len(), "排位已创建");
        self.finish(store, &catalog, rank.guild_id, vec![rank], affected, RoleChangeSet::new())
            .await
    }

    /// 编辑排位
    ///
    /// 新名额限制不能低于当前占用；有持有者时不能切换可叠加属性；
    /// 角色句柄变化时持有者从旧角色迁移到新角色。
    /// 先锁定受影响成员与计数器，再在锁内读取持有者与占用。
    #[instrument(skip(self, request))]
    pub async fn edit(&self, rank_id: i64, request: UpdateRankRequest) -> Result<CatalogChange> {
        let request = request.trimmed();
        request.validate()?;
        if request.is_empty() {
            return Err(RankError::Validation("没有需要更新的字段".to_string()));
        }

        let mut store = self.provider.begin().await?;
        let current = store
            .get_rank(rank_id)
            .await?
            .ok_or(RankError::RankNotFound(rank_id))?;
        let updated = request.apply_to(&current);
        check_definition(&updated.name, updated.stackable, updated.user_limit)?;

        let existing = store.list_ranks(current.guild_id).await?;
        check_unique(&existing, Some(rank_id), &updated.name, updated.points_required)?;

        let old_catalog = CatalogView::new(existing);
        let new_catalog = with_rank(&old_catalog, &updated);
        let floor = fan_out_floor(&old_catalog, &current).min(fan_out_floor(&new_catalog, &updated));
        let affected = store
            .list_members_affected_by(current.guild_id, rank_id, Some(floor))
            .await?;
        let user_ids: Vec<i64> = affected.iter().map(|m| m.user_id).collect();
        let mut counter_ids = old_catalog.counter_ids();
        counter_ids.extend(new_catalog.counter_ids());
        self.engine
            .lock_batch(&mut store, current.guild_id, &user_ids, &counter_ids)
            .await?;

        let holders: Vec<Member> = store
            .list_members_affected_by(current.guild_id, rank_id, None)
            .await?
            .into_iter()
            .filter(|m| m.main_rank_id == Some(rank_id) || m.stackable_ranks.contains(&rank_id))
            .collect();

        if updated.stackable != current.stackable && !holders.is_empty() {
            return Err(RankError::Validation(format!(
                "排位仍有 {} 名持有者，不能切换可叠加属性",
                holders.len()
            )));
        }
        if !updated.stackable && updated.user_limit != current.user_limit {
            self.engine
                .ledger()
                .ensure_limit_fits(&mut store, rank_id, updated.user_limit)
                .await?;
        }

        let saved = store.update_rank(&updated).await?;

        let mut changes = RoleChangeSet::new();
        if current.role_ref != saved.role_ref {
            for holder in &holders {
                changes.revoke(holder.guild_id, holder.user_id, &current);
                changes.grant(holder.guild_id, holder.user_id, &saved);
            }
            info!(
                rank_id,
                from = ?current.role_ref,
                to = ?saved.role_ref,
                holders = holders.len(),
                "排位角色已迁移"
            );
        }

        let catalog = with_rank(&old_catalog, &saved);
        info!(rank_id, affected = affected.len(), "排位已更新");
        self.finish(store, &catalog, saved.guild_id, vec![saved], affected, changes)
            .await
    }

    /// 删除排位
    ///
    /// 先把所有持有者晋升到其他排位（释放名额），再删除定义。
    /// 平台侧的角色本身不会被删除。
    #[instrument(skip(self))]
    pub async fn remove(&self, rank_id: i64) -> Result<CatalogChange> {
        let mut store = self.provider.begin().await?;
        let rank = store
            .get_rank(rank_id)
            .await?
            .ok_or(RankError::RankNotFound(rank_id))?;
        let guild_id = rank.guild_id;

        let full_catalog = CatalogView::new(store.list_ranks(guild_id).await?);
        let floor = fan_out_floor(&full_catalog, &rank);
        let catalog = full_catalog.retire(rank_id);

        let affected = store
            .list_members_affected_by(guild_id, rank_id, Some(floor))
            .await?;
        let user_ids: Vec<i64> = affected.iter().map(|m| m.user_id).collect();

        let mut changes = RoleChangeSet::new();
        let promotion = self
            .engine
            .promote_batch(&mut store, &catalog, guild_id, &user_ids, &mut changes)
            .await?;

        // 名额不足而无法转入其他排位的持有者直接清空主排位
        for skipped in &promotion.skipped {
            self.engine
                .vacate_main(&mut store, &catalog, guild_id, skipped.user_id, rank_id, &mut changes)
                .await?;
        }

        store.delete_rank(rank_id).await?;
        store.commit().await?;

        info!(rank_id, guild_id, affected = user_ids.len(), "排位已删除");
        self.after_commit(guild_id, vec![rank], promotion, changes, &user_ids)
            .await
    }

    /// 批量导入排位
    ///
    /// 全部条目先校验（包括条目之间与已有目录的重复），任何一条不合法则整体拒绝
    #[instrument(skip(self, entries), fields(count = entries.len()))]
    pub async fn import(&self, guild_id: i64, entries: Vec<RankImportEntry>) -> Result<CatalogChange> {
        if entries.is_empty() {
            return Err(RankError::Validation("导入列表为空".to_string()));
        }

        let mut new_ranks: Vec<NewRank> = Vec::with_capacity(entries.len());
        for entry in entries {
            let request = entry.into_request(guild_id).trimmed();
            request.validate()?;
            let new_rank = request.into_new_rank();
            check_definition(&new_rank.name, new_rank.stackable, new_rank.user_limit)?;
            new_ranks.push(new_rank);
        }

        let mut names = HashSet::new();
        let mut points = HashSet::new();
        for rank in &new_ranks {
            if !names.insert(rank.name.as_str()) {
                return Err(RankError::Validation(format!("导入列表中排位名称重复: {}", rank.name)));
            }
            if !points.insert(rank.points_required) {
                return Err(RankError::Validation(format!(
                    "导入列表中所需积分重复: {}",
                    rank.points_required
                )));
            }
        }

        let mut store = self.provider.begin().await?;
        let existing = store.list_ranks(guild_id).await?;
        self.check_capacity(guild_id, existing.len(), new_ranks.len())?;
        for rank in &new_ranks {
            check_unique(&existing, None, &rank.name, rank.points_required)?;
        }

        let mut created = Vec::with_capacity(new_ranks.len());
        for rank in &new_ranks {
            created.push(store.insert_rank(rank).await?);
        }

        let mut ranks = existing;
        ranks.extend(created.iter().cloned());
        let catalog = CatalogView::new(ranks);
        let affected = store.list_members(guild_id).await?;

        info!(guild_id, created = created.len(), "排位批量导入完成");
        self.finish(store, &catalog, guild_id, created, affected, RoleChangeSet::new())
            .await
    }

    fn check_capacity(&self, guild_id: i64, existing: usize, adding: usize) -> Result<()> {
        if existing + adding > self.max_ranks {
            return Err(RankError::CatalogFull {
                guild_id,
                limit: self.max_ranks,
            });
        }
        Ok(())
    }

    /// 对受影响成员重新晋升、提交事务、下发角色并对账
    async fn finish(
        &self,
        mut store: P::Store,
        catalog: &CatalogView,
        guild_id: i64,
        ranks: Vec<Rank>,
        affected: Vec<Member>,
        mut changes: RoleChangeSet,
    ) -> Result<CatalogChange> {
        let user_ids: Vec<i64> = affected.iter().map(|m| m.user_id).collect();
        let promotion = self
            .engine
            .promote_batch(&mut store, catalog, guild_id, &user_ids, &mut changes)
            .await?;
        store.commit().await?;

        self.after_commit(guild_id, ranks, promotion, changes, &user_ids)
            .await
    }

    async fn after_commit(
        &self,
        guild_id: i64,
        ranks: Vec<Rank>,
        mut promotion: BatchReport,
        changes: RoleChangeSet,
        user_ids: &[i64],
    ) -> Result<CatalogChange> {
        promotion.gateway = changes.apply(self.gateway.as_ref()).await;

        let resync = match self.reconciler.reconcile_members(guild_id, user_ids).await {
            Ok(report) => report,
            Err(e) => {
                // 目录变更已提交，对账失败只影响平台侧表示
                warn!(guild_id, error = %e, "目录变更后的对账失败");
                ResyncReport {
                    failures: vec![(0, e.to_string())],
                    ..Default::default()
                }
            }
        };

        Ok(CatalogChange {
            ranks,
            promotion,
            resync,
        })
    }
}

/// 以 `rank` 替换目录中同 ID 的排位
fn with_rank(catalog: &CatalogView, rank: &Rank) -> CatalogView {
    CatalogView::new(
        catalog
            .ranks()
            .iter()
            .map(|r| if r.id == rank.id { rank.clone() } else { r.clone() })
            .collect(),
    )
}

/// 排位定义自身的约束
fn check_definition(name: &str, stackable: bool, user_limit: i32) -> Result<()> {
    if name.trim().is_empty() {
        return Err(RankError::Validation("排位名称不能为空".to_string()));
    }
    if stackable && UserLimit::from_raw(user_limit) != UserLimit::Unlimited {
        return Err(RankError::Validation("可叠加排位不能设置名额限制".to_string()));
    }
    if user_limit < UserLimit::UNLIMITED_RAW {
        return Err(RankError::Validation(format!("名额限制不合法: {}", user_limit)));
    }
    Ok(())
}

/// 名称、所需积分在公会内唯一（`skip_id` 为正在编辑的排位）
fn check_unique(existing: &[Rank], skip_id: Option<i64>, name: &str, points_required: i32) -> Result<()> {
    for rank in existing.iter().filter(|r| Some(r.id) != skip_id) {
        if rank.name == name {
            return Err(RankError::Validation(format!("排位名称已存在: {}", name)));
        }
        if rank.points_required == points_required {
            return Err(RankError::Validation(format!(
                "所需积分已被排位 {} 使用: {}",
                rank.name, points_required
            )));
        }
    }
    Ok(())
}

/// 排位变更可能影响到的最低积分
///
/// 可叠加排位只影响达到阈值的成员；独占排位还会改变低一级排位持有者的
/// 下一排位指针，因此从低一级独占排位的阈值开始，没有更低的排位时覆盖全部成员
fn fan_out_floor(catalog: &CatalogView, rank: &Rank) -> i32 {
    if rank.stackable {
        return rank.points_required;
    }
    catalog
        .ranks()
        .iter()
        .filter(|r| !r.stackable && r.id != rank.id && r.points_required < rank.points_required)
        .map(|r| r.points_required)
        .max()
        .unwrap_or(i32::MIN)
}
