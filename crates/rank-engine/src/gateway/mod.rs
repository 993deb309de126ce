//! 外部角色网关
//!
//! 平台侧角色的授予与撤销不在数据库事务内。服务层先把角色变更收集到
//! [`RoleChangeSet`]，事务提交后再统一下发；下发失败只记录日志和指标，
//! 留待对账修复。

mod discord;
mod role_gateway;

pub use discord::DiscordRoleGateway;
pub use role_gateway::{GatewayFailure, GatewayReport, RoleAction, RoleChangeSet, RoleGateway};

#[cfg(test)]
pub use role_gateway::MockRoleGateway;
