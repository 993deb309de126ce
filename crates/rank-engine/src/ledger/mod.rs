//! 名额账本模块
//!
//! 每个独占排位对应一个占用计数器，只有账本可以修改它。
//! 预占与释放都在计数器行锁下完成读-改-写，避免并发晋升超卖最后一个名额。

mod capacity_ledger;

pub use capacity_ledger::CapacityLedger;
