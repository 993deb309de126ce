//! 数据库仓储层
//!
//! 提供排位目录、名额计数器与成员状态的数据访问接口。
//!
//! ## 设计原则
//!
//! - 仓储只负责数据持久化，不包含业务逻辑
//! - 每个 `RankStore` 对应一个事务，提交前所有写入对外不可见
//! - 行锁（名额计数器、成员行）持有到事务结束
//! - 定义 trait 接口，服务层可以在内存实现上测试

mod pg_store;
mod traits;

pub use pg_store::{PgStore, PgStoreProvider};
pub use traits::*;
