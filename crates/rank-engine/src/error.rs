//! 排位服务错误类型
//!
//! 定义服务层的业务错误和系统错误

use thiserror::Error;

/// 排位服务错误类型
#[derive(Debug, Error)]
pub enum RankError {
    // === 排位目录相关错误 ===
    #[error("排位不存在: {0}")]
    RankNotFound(i64),

    #[error("排位目录已满: guild_id={guild_id}, limit={limit}")]
    CatalogFull { guild_id: i64, limit: usize },

    #[error("参数校验失败: {0}")]
    Validation(String),

    // === 名额账本相关错误 ===
    #[error("排位名额已满: rank_id={rank_id}, limit={limit}")]
    CapacityExceeded { rank_id: i64, limit: i32 },

    // === 成员相关错误 ===
    #[error("成员不存在: guild_id={guild_id}, user_id={user_id}")]
    MemberNotFound { guild_id: i64, user_id: i64 },

    // === 系统错误 ===
    #[error("外部角色网关错误: {0}")]
    Gateway(String),

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON 序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 排位服务 Result 类型别名
pub type Result<T> = std::result::Result<T, RankError>;

impl From<validator::ValidationErrors> for RankError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Validation(errors.to_string())
    }
}

impl RankError {
    /// 检查是否为可重试的错误
    ///
    /// 名额不足在其他成员降级后可能恢复，因此也视为可重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::CapacityExceeded { .. })
    }

    /// 检查是否为业务错误（预期内的结果，而非事故）
    pub fn is_business_error(&self) -> bool {
        !matches!(
            self,
            Self::Database(_) | Self::Serialization(_) | Self::Gateway(_) | Self::Internal(_)
        )
    }

    /// 检查是否为目录校验错误
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::CatalogFull { .. })
    }

    /// 获取错误码（用于调用方展示）
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RankNotFound(_) => "RANK_NOT_FOUND",
            Self::CatalogFull { .. } => "CATALOG_FULL",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Self::MemberNotFound { .. } => "MEMBER_NOT_FOUND",
            Self::Gateway(_) => "GATEWAY_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// 将唯一约束/检查约束冲突转换为校验错误
///
/// 并发创建同名或同阈值排位时，后提交的一方由数据库约束拦截，
/// 对调用方而言与前置校验失败是同一种结果。
pub(crate) fn map_constraint_violation(err: sqlx::Error) -> RankError {
    if let sqlx::Error::Database(ref db_err) = err {
        if db_err.is_unique_violation() {
            let detail = match db_err.constraint() {
                Some("uq_rank_definitions_name") => "排位名称在公会内重复",
                Some("uq_rank_definitions_points") => "所需积分在公会内重复",
                _ => "排位定义违反唯一约束",
            };
            return RankError::Validation(detail.to_string());
        }
        if db_err.is_check_violation() {
            return RankError::Validation(format!("排位定义不合法: {}", db_err.message()));
        }
    }
    RankError::Database(err)
}
