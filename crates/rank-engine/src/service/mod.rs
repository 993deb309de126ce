//! 服务层
//!
//! 实现排位业务逻辑，协调仓储层、名额账本与外部角色网关。
//!
//! ## 模块结构
//!
//! - `dto`: 数据传输对象定义
//! - `stackable`: 可叠加排位集合计算
//! - `promotion_engine`: 排位晋升引擎
//! - `catalog_service`: 排位目录服务
//! - `reconciliation_service`: 角色对账服务
//! - `points_service`: 积分变更服务

pub mod catalog_service;
pub mod dto;
pub mod points_service;
pub mod promotion_engine;
pub mod reconciliation_service;
pub mod stackable;

pub use catalog_service::{CatalogChange, RankCatalog};
pub use dto::*;
pub use points_service::PointsService;
pub use promotion_engine::{PromotionEngine, PromotionOutcome};
pub use reconciliation_service::ReconciliationService;
