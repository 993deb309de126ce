//! 角色对账服务
//!
//! 比较成员在库中的排位集合与平台侧实际持有的角色，补齐缺失角色、
//! 撤销多余的排位角色。只修复表示层漂移，从不修改成员排位或名额账本。

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::error::{RankError, Result};
use crate::gateway::RoleGateway;
use crate::models::{CatalogView, Member};
use crate::repository::{RankStore, StoreProvider};
use crate::service::dto::{ReconcileReport, ResyncReport};
use rank_shared::observability::metrics::{RANK_GATEWAY_FAILURES_TOTAL, RANK_RECONCILE_REPAIRS_TOTAL};

/// 角色对账服务
pub struct ReconciliationService<P: StoreProvider> {
    provider: Arc<P>,
    gateway: Arc<dyn RoleGateway>,
}

impl<P: StoreProvider> Clone for ReconciliationService<P> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            gateway: self.gateway.clone(),
        }
    }
}

impl<P: StoreProvider> ReconciliationService<P> {
    pub fn new(provider: Arc<P>, gateway: Arc<dyn RoleGateway>) -> Self {
        Self { provider, gateway }
    }

    /// 在调用方事务内读取成员状态并对账
    ///
    /// 事务只用于读取，调用方可以直接丢弃
    #[instrument(skip(self, store))]
    pub async fn reconcile<S: RankStore>(
        &self,
        store: &mut S,
        guild_id: i64,
        user_id: i64,
    ) -> Result<ReconcileReport> {
        let catalog = CatalogView::new(store.list_ranks(guild_id).await?);
        let member = store
            .get_member(guild_id, user_id)
            .await?
            .ok_or(RankError::MemberNotFound { guild_id, user_id })?;

        self.reconcile_with(&catalog, &member).await
    }

    /// 对指定成员逐个对账
    ///
    /// 先在一个只读事务内读取快照，释放连接后再调用平台接口；
    /// 单个成员失败只记入报告，不中断其余成员
    pub async fn reconcile_members(&self, guild_id: i64, user_ids: &[i64]) -> Result<ResyncReport> {
        let (catalog, members) = {
            let mut store = self.provider.begin().await?;
            let catalog = CatalogView::new(store.list_ranks(guild_id).await?);
            let mut members = Vec::with_capacity(user_ids.len());
            for &user_id in user_ids {
                if let Some(member) = store.get_member(guild_id, user_id).await? {
                    members.push(member);
                }
            }
            store.commit().await?;
            (catalog, members)
        };

        Ok(self.reconcile_all(&catalog, &members).await)
    }

    /// 管理员触发的全量对账
    #[instrument(skip(self))]
    pub async fn resync_all(&self, guild_id: i64) -> Result<ResyncReport> {
        let (catalog, members) = {
            let mut store = self.provider.begin().await?;
            let catalog = CatalogView::new(store.list_ranks(guild_id).await?);
            let members = store.list_members(guild_id).await?;
            store.commit().await?;
            (catalog, members)
        };

        let report = self.reconcile_all(&catalog, &members).await;
        info!(
            guild_id,
            members = report.members,
            roles_added = report.roles_added,
            roles_removed = report.roles_removed,
            failures = report.failures.len(),
            "全量对账完成"
        );
        Ok(report)
    }

    async fn reconcile_all(&self, catalog: &CatalogView, members: &[Member]) -> ResyncReport {
        let mut report = ResyncReport::default();
        for member in members {
            match self.reconcile_with(catalog, member).await {
                Ok(member_report) => report.absorb(&member_report),
                Err(e) => {
                    warn!(user_id = member.user_id, error = %e, "成员对账失败");
                    report.members += 1;
                    report.failures.push((member.user_id, e.to_string()));
                }
            }
        }
        report
    }

    /// 按库中状态修正平台侧角色
    async fn reconcile_with(&self, catalog: &CatalogView, member: &Member) -> Result<ReconcileReport> {
        let (guild_id, user_id) = (member.guild_id, member.user_id);

        let desired: BTreeSet<&str> = member
            .held_rank_ids()
            .iter()
            .filter_map(|id| catalog.find(*id))
            .filter_map(|r| r.role_ref.as_deref())
            .collect();
        let managed: BTreeSet<&str> = catalog.role_refs().collect();
        let actual: BTreeSet<String> = self
            .gateway
            .member_roles(guild_id, user_id)
            .await?
            .into_iter()
            .collect();

        let mut report = ReconcileReport::new(user_id);

        for role_ref in desired.iter().filter(|r| !actual.contains(**r)) {
            match self.gateway.add_role(guild_id, user_id, role_ref).await {
                Ok(()) => report.added.push(role_ref.to_string()),
                Err(e) => {
                    metrics::counter!(RANK_GATEWAY_FAILURES_TOTAL).increment(1);
                    report.failures.push(format!("add {}: {}", role_ref, e));
                }
            }
        }

        for role_ref in actual
            .iter()
            .filter(|r| managed.contains(r.as_str()) && !desired.contains(r.as_str()))
        {
            match self.gateway.remove_role(guild_id, user_id, role_ref).await {
                Ok(()) => report.removed.push(role_ref.clone()),
                Err(e) => {
                    metrics::counter!(RANK_GATEWAY_FAILURES_TOTAL).increment(1);
                    report.failures.push(format!("remove {}: {}", role_ref, e));
                }
            }
        }

        if report.repairs() > 0 {
            metrics::counter!(RANK_RECONCILE_REPAIRS_TOTAL).increment(report.repairs() as u64);
            info!(
                guild_id,
                user_id,
                added = ?report.added,
                removed = ?report.removed,
                "角色漂移已修复"
            );
        }
        Ok(report)
    }
}
