//! 排位服务领域模型
//!
//! 包含排位目录、名额限制与成员排位状态的核心实体定义

pub mod member;
pub mod rank;

// 重新导出常用类型
pub use member::Member;
pub use rank::{CatalogView, Rank, UserLimit};
