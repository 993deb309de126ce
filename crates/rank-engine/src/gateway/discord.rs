//! Discord REST 角色网关
//!
//! 通过 Bot 令牌调用成员角色接口。目标角色或成员不存在（404）时，
//! 授予/撤销按成功处理，读取返回空角色集。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::role_gateway::RoleGateway;
use crate::error::{RankError, Result};
use rank_shared::config::GatewayConfig;

#[derive(Debug, Deserialize)]
struct GuildMemberPayload {
    #[serde(default)]
    roles: Vec<String>,
}

pub struct DiscordRoleGateway {
    client: Client,
    api_base: String,
    bot_token: String,
}

impl DiscordRoleGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        if config.bot_token.is_empty() {
            return Err(RankError::Gateway("未配置 Bot 令牌".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| RankError::Gateway(format!("创建 HTTP 客户端失败: {e}")))?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone(),
        })
    }

    fn member_url(&self, guild_id: i64, user_id: i64) -> String {
        format!("{}/guilds/{}/members/{}", self.api_base, guild_id, user_id)
    }

    fn role_url(&self, guild_id: i64, user_id: i64, role_ref: &str) -> String {
        format!("{}/roles/{}", self.member_url(guild_id, user_id), role_ref)
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.bot_token)
    }

    /// 检查角色变更响应，404 视为幂等成功
    fn check_mutation(status: StatusCode, action: &str) -> Result<()> {
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(RankError::Gateway(format!("{action}返回 HTTP {status}")))
    }
}

#[async_trait]
impl RoleGateway for DiscordRoleGateway {
    #[instrument(skip(self))]
    async fn add_role(&self, guild_id: i64, user_id: i64, role_ref: &str) -> Result<()> {
        let resp = self
            .client
            .put(self.role_url(guild_id, user_id, role_ref))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(|e| RankError::Gateway(format!("授予角色请求失败: {e}")))?;

        debug!(status = %resp.status(), "授予角色响应");
        Self::check_mutation(resp.status(), "授予角色")
    }

    #[instrument(skip(self))]
    async fn remove_role(&self, guild_id: i64, user_id: i64, role_ref: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.role_url(guild_id, user_id, role_ref))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .send()
            .await
            .map_err(|e| RankError::Gateway(format!("撤销角色请求失败: {e}")))?;

        debug!(status = %resp.status(), "撤销角色响应");
        Self::check_mutation(resp.status(), "撤销角色")
    }

    #[instrument(skip(self))]
    async fn member_roles(&self, guild_id: i64, user_id: i64) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(self.member_url(guild_id, user_id))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .send()
            .await
            .map_err(|e| RankError::Gateway(format!("查询成员角色失败: {e}")))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(RankError::Gateway(format!(
                "查询成员角色返回 HTTP {}",
                resp.status()
            )));
        }

        let payload: GuildMemberPayload = resp
            .json()
            .await
            .map_err(|e| RankError::Gateway(format!("解析成员角色失败: {e}")))?;
        Ok(payload.roles)
    }
}
