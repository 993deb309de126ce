//! 排位晋升与名额账本引擎
//!
//! 根据成员积分为其分配积分阈值排位，在并发更新下维护排位名额，
//! 并让平台侧角色与库中排位保持一致。
//!
//! ## 核心功能
//!
//! - **排位目录**：按公会维护排位定义，校验名称/阈值唯一、名额限制与目录上限
//! - **名额账本**：每个独占排位一个占用计数器，行锁下预占与释放，不会超卖
//! - **晋升引擎**：按积分计算主排位、下一排位与可叠加排位，重复执行幂等
//! - **角色对账**：修复库中排位与平台侧角色之间的漂移
//! - **积分变更**：增减积分后在同一事务内重新晋升
//!
//! ## 模块结构
//!
//! - `models`: 领域模型定义
//! - `error`: 错误类型定义
//! - `repository`: 存储抽象与 PostgreSQL 实现
//! - `ledger`: 名额账本
//! - `gateway`: 外部角色网关
//! - `service`: 业务服务层
//! - `test_utils`: 内存存储与记录型网关

pub mod error;
pub mod gateway;
pub mod ledger;
pub mod models;
pub mod repository;
pub mod service;
pub mod test_utils;

pub use error::{RankError, Result};
pub use gateway::{DiscordRoleGateway, GatewayReport, RoleChangeSet, RoleGateway};
pub use ledger::CapacityLedger;
pub use models::*;
pub use repository::{PgStore, PgStoreProvider, RankStore, StoreProvider};
pub use service::{
    CatalogChange, PointsService, PromotionEngine, RankCatalog, ReconciliationService, dto,
};
