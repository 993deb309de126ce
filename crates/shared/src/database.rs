//! 数据库连接管理
//!
//! 名额计数器与成员行都通过 `SELECT ... FOR UPDATE` 加锁，连接级别设置
//! `lock_timeout`，等待行锁超时的事务以数据库错误返回，由调用方决定是否重试。

use std::str::FromStr;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::{info, instrument};

use crate::config::DatabaseConfig;
use crate::error::{Result, SharedError};

/// 排位表结构迁移（仓库根目录 migrations/）
static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// 排位库连接池
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = PgConnectOptions::from_str(&config.url)?
            .options([("lock_timeout", format!("{}ms", config.lock_timeout_ms))]);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect_with(options)
            .await?;

        info!(lock_timeout_ms = config.lock_timeout_ms, "数据库连接池已创建");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(SharedError::from)
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("数据库连接池已关闭");
    }

    /// 执行排位表结构迁移
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        info!(migrations = MIGRATOR.iter().count(), "数据库迁移完成");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_database_config;

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_connect_and_migrate() {
        let db = Database::connect(&test_database_config()).await.unwrap();
        db.health_check().await.unwrap();
        db.run_migrations().await.unwrap();

        let lock_timeout: String = sqlx::query_scalar("SHOW lock_timeout")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(lock_timeout, "5s");
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let config = DatabaseConfig {
            url: "not-a-url".to_string(),
            ..test_database_config()
        };
        assert!(Database::connect(&config).await.is_err());
    }
}
