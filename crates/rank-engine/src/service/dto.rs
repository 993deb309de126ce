//! 服务层数据传输对象
//!
//! 目录变更请求在进入服务前经过 `validator` 校验，报告类型用于向
//! 调用方（管理命令、定时任务）汇总批量操作的结果

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::gateway::GatewayReport;
use crate::models::{Member, Rank, UserLimit};

/// 排位名称最大长度
pub const MAX_RANK_NAME_LENGTH: u64 = 100;

/// 待写入的排位定义（已通过校验）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRank {
    pub guild_id: i64,
    pub name: String,
    pub points_required: i32,
    pub user_limit: i32,
    pub stackable: bool,
    pub role_ref: Option<String>,
    pub color: Option<i32>,
}

/// 创建排位请求
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateRankRequest {
    pub guild_id: i64,
    #[validate(length(min = 1, max = 100, message = "排位名称长度必须在1-100个字符之间"))]
    pub name: String,
    #[validate(range(min = 0, message = "所需积分不能为负数"))]
    pub points_required: i32,
    #[validate(range(min = -1, message = "名额限制只能是 -1、0 或正数"))]
    #[serde(default = "default_user_limit")]
    pub user_limit: i32,
    #[serde(default)]
    pub stackable: bool,
    pub role_ref: Option<String>,
    #[validate(range(min = 0, max = 0xFFFFFF, message = "颜色必须是 RGB 整数"))]
    pub color: Option<i32>,
}

fn default_user_limit() -> i32 {
    UserLimit::UNLIMITED_RAW
}

impl CreateRankRequest {
    pub fn new(guild_id: i64, name: impl Into<String>, points_required: i32) -> Self {
        Self {
            guild_id,
            name: name.into(),
            points_required,
            user_limit: UserLimit::UNLIMITED_RAW,
            stackable: false,
            role_ref: None,
            color: None,
        }
    }

    pub fn with_limit(mut self, user_limit: i32) -> Self {
        self.user_limit = user_limit;
        self
    }

    pub fn with_stackable(mut self, stackable: bool) -> Self {
        self.stackable = stackable;
        self
    }

    pub fn with_role(mut self, role_ref: impl Into<String>) -> Self {
        self.role_ref = Some(role_ref.into());
        self
    }

    pub fn with_color(mut self, color: i32) -> Self {
        self.color = Some(color);
        self
    }

    /// 去除名称首尾空白，长度校验针对去除后的名称
    pub fn trimmed(mut self) -> Self {
        self.name = self.name.trim().to_string();
        self
    }

    /// 转换为待写入定义，名称去除首尾空白
    pub fn into_new_rank(self) -> NewRank {
        NewRank {
            guild_id: self.guild_id,
            name: self.name.trim().to_string(),
            points_required: self.points_required,
            user_limit: self.user_limit,
            stackable: self.stackable,
            role_ref: self.role_ref,
            color: self.color,
        }
    }
}

/// 编辑排位请求
///
/// 字段为 `None` 表示保持不变；`role_ref`/`color` 的 `Some(None)` 表示清空
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRankRequest {
    #[validate(length(min = 1, max = 100, message = "排位名称长度必须在1-100个字符之间"))]
    pub name: Option<String>,
    #[validate(range(min = 0, message = "所需积分不能为负数"))]
    pub points_required: Option<i32>,
    #[validate(range(min = -1, message = "名额限制只能是 -1、0 或正数"))]
    pub user_limit: Option<i32>,
    pub stackable: Option<bool>,
    #[serde(default, with = "double_option")]
    pub role_ref: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub color: Option<Option<i32>>,
}

impl UpdateRankRequest {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_points(mut self, points_required: i32) -> Self {
        self.points_required = Some(points_required);
        self
    }

    pub fn with_limit(mut self, user_limit: i32) -> Self {
        self.user_limit = Some(user_limit);
        self
    }

    pub fn with_stackable(mut self, stackable: bool) -> Self {
        self.stackable = Some(stackable);
        self
    }

    pub fn with_role(mut self, role_ref: Option<String>) -> Self {
        self.role_ref = Some(role_ref);
        self
    }

    pub fn with_color(mut self, color: Option<i32>) -> Self {
        self.color = Some(color);
        self
    }

    /// 去除名称首尾空白
    pub fn trimmed(mut self) -> Self {
        if let Some(name) = self.name.as_mut() {
            *name = name.trim().to_string();
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.points_required.is_none()
            && self.user_limit.is_none()
            && self.stackable.is_none()
            && self.role_ref.is_none()
            && self.color.is_none()
    }

    /// 在现有定义上叠加变更
    pub fn apply_to(&self, rank: &Rank) -> Rank {
        let mut updated = rank.clone();
        if let Some(name) = &self.name {
            updated.name = name.trim().to_string();
        }
        if let Some(points) = self.points_required {
            updated.points_required = points;
        }
        if let Some(limit) = self.user_limit {
            updated.user_limit = limit;
        }
        if let Some(stackable) = self.stackable {
            updated.stackable = stackable;
        }
        if let Some(role_ref) = &self.role_ref {
            updated.role_ref = role_ref.clone();
        }
        if let Some(color) = self.color {
            updated.color = color;
        }
        updated
    }
}

/// 区分"字段缺省"与"显式置空"
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

/// 批量导入条目
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RankImportEntry {
    #[validate(length(min = 1, max = 100, message = "排位名称长度必须在1-100个字符之间"))]
    pub name: Option<String>,
    #[validate(range(min = 0, message = "所需积分不能为负数"))]
    pub points: i32,
    #[validate(range(min = -1, message = "名额限制只能是 -1、0 或正数"))]
    pub limit: Option<i32>,
    pub role_ref: Option<String>,
    #[validate(range(min = 0, max = 0xFFFFFF, message = "颜色必须是 RGB 整数"))]
    pub color: Option<i32>,
}

impl RankImportEntry {
    /// 转换为创建请求，未命名时以所需积分生成名称
    pub fn into_request(self, guild_id: i64) -> CreateRankRequest {
        let name = self
            .name
            .unwrap_or_else(|| format!("Rank {}", self.points));
        CreateRankRequest {
            guild_id,
            name,
            points_required: self.points,
            user_limit: self.limit.unwrap_or(UserLimit::UNLIMITED_RAW),
            stackable: false,
            role_ref: self.role_ref,
            color: self.color,
        }
    }
}

/// 成员排位概览
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRankSummary {
    pub guild_id: i64,
    pub user_id: i64,
    pub points: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_rank: Option<Rank>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_rank: Option<Rank>,
    pub stackable_ranks: Vec<Rank>,
    /// 距下一排位还差的积分
    #[serde(skip_serializing_if = "Option::is_none")]
    pub points_to_next: Option<i32>,
}

/// 单成员积分变更结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsChangeResult {
    pub member: Member,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_rank: Option<Rank>,
    pub gateway: GatewayReport,
}

/// 批量处理中被跳过的成员
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedMember {
    pub user_id: i64,
    pub rank_id: i64,
    pub reason: String,
}

/// 批量晋升结果
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// 已处理的成员数（含被跳过的）
    pub processed: usize,
    /// 排位发生变化的成员数
    pub changed: usize,
    pub skipped: Vec<SkippedMember>,
    pub gateway: GatewayReport,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.gateway.failures.is_empty()
    }
}

/// 单成员角色对账结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub user_id: i64,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub failures: Vec<String>,
}

impl ReconcileReport {
    pub fn new(user_id: i64) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }

    pub fn repairs(&self) -> usize {
        self.added.len() + self.removed.len()
    }

    pub fn is_converged(&self) -> bool {
        self.repairs() == 0 && self.failures.is_empty()
    }
}

/// 全量对账结果
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncReport {
    pub members: usize,
    pub roles_added: usize,
    pub roles_removed: usize,
    /// 对账失败的成员及原因
    pub failures: Vec<(i64, String)>,
}

impl ResyncReport {
    pub fn absorb(&mut self, report: &ReconcileReport) {
        self.members += 1;
        self.roles_added += report.added.len();
        self.roles_removed += report.removed.len();
        for failure in &report.failures {
            self.failures.push((report.user_id, failure.clone()));
        }
    }
}
