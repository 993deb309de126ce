//! 角色网关接口与角色变更集

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::Rank;
use rank_shared::observability::metrics::RANK_GATEWAY_FAILURES_TOTAL;

/// 平台角色网关
///
/// `add_role`/`remove_role` 必须幂等：重复授予或撤销不存在的角色都不是错误
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoleGateway: Send + Sync {
    async fn add_role(&self, guild_id: i64, user_id: i64, role_ref: &str) -> Result<()>;
    async fn remove_role(&self, guild_id: i64, user_id: i64, role_ref: &str) -> Result<()>;
    /// 成员在平台侧当前持有的全部角色
    async fn member_roles(&self, guild_id: i64, user_id: i64) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleAction {
    Add,
    Remove,
}

/// 单次角色调用失败
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayFailure {
    pub user_id: i64,
    pub role_ref: String,
    pub action: RoleAction,
    pub error: String,
}

/// 角色下发结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayReport {
    pub applied: usize,
    pub failures: Vec<GatewayFailure>,
}

impl GatewayReport {
    pub fn merge(&mut self, other: GatewayReport) {
        self.applied += other.applied;
        self.failures.extend(other.failures);
    }
}

/// 待下发的角色变更
///
/// 同一成员同一角色的多次变更只保留最后一次
#[derive(Debug, Clone, Default)]
pub struct RoleChangeSet {
    changes: BTreeMap<(i64, i64, String), RoleAction>,
}

impl RoleChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录授予排位对应角色，未绑定角色的排位忽略
    pub fn grant(&mut self, guild_id: i64, user_id: i64, rank: &Rank) {
        if let Some(role_ref) = &rank.role_ref {
            self.push(guild_id, user_id, role_ref, RoleAction::Add);
        }
    }

    /// 记录撤销排位对应角色，未绑定角色的排位忽略
    pub fn revoke(&mut self, guild_id: i64, user_id: i64, rank: &Rank) {
        if let Some(role_ref) = &rank.role_ref {
            self.push(guild_id, user_id, role_ref, RoleAction::Remove);
        }
    }

    pub fn push(&mut self, guild_id: i64, user_id: i64, role_ref: &str, action: RoleAction) {
        self.changes
            .insert((guild_id, user_id, role_ref.to_string()), action);
    }

    pub fn extend(&mut self, other: RoleChangeSet) {
        self.changes.extend(other.changes);
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// 遍历待下发变更
    pub fn iter(&self) -> impl Iterator<Item = (i64, i64, &str, RoleAction)> {
        self.changes
            .iter()
            .map(|((g, u, r), a)| (*g, *u, r.as_str(), *a))
    }

    /// 下发全部变更（应在数据库事务提交之后调用）
    ///
    /// 先撤销后授予；单次失败不影响其余调用，也不重试
    pub async fn apply(self, gateway: &dyn RoleGateway) -> GatewayReport {
        let mut report = GatewayReport::default();
        if self.changes.is_empty() {
            return report;
        }

        let (removals, additions): (Vec<_>, Vec<_>) = self
            .changes
            .into_iter()
            .partition(|(_, action)| *action == RoleAction::Remove);

        for ((guild_id, user_id, role_ref), action) in removals.into_iter().chain(additions) {
            let result = match action {
                RoleAction::Add => gateway.add_role(guild_id, user_id, &role_ref).await,
                RoleAction::Remove => gateway.remove_role(guild_id, user_id, &role_ref).await,
            };

            match result {
                Ok(()) => {
                    debug!(guild_id, user_id, role_ref = %role_ref, ?action, "角色变更已下发");
                    report.applied += 1;
                }
                Err(e) => {
                    warn!(
                        guild_id,
                        user_id,
                        role_ref = %role_ref,
                        ?action,
                        error = %e,
                        "角色变更下发失败，等待对账修复"
                    );
                    metrics::counter!(RANK_GATEWAY_FAILURES_TOTAL).increment(1);
                    report.failures.push(GatewayFailure {
                        user_id,
                        role_ref,
                        action,
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }
}
