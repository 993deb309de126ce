//! 排位管理命令行工具
//!
//! 提供全量晋升、角色对账、排位导入与查询等管理操作，结果以 JSON 输出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use rank_engine::{
    DiscordRoleGateway, PgStoreProvider, PointsService, RankCatalog, RoleGateway,
    dto::RankImportEntry,
};
use rank_shared::{config::AppConfig, database::Database, observability};

/// 排位管理工具
#[derive(Parser, Debug)]
#[command(name = "rank-admin")]
#[command(version, about = "排位晋升与名额账本管理工具")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 对公会全部成员重新晋升
    PromoteAll {
        #[arg(long)]
        guild: i64,
    },

    /// 让平台侧角色与库中排位保持一致
    Resync {
        #[arg(long)]
        guild: i64,
    },

    /// 从 JSON 文件批量导入排位
    ///
    /// 文件内容为数组：[{"name": "...", "points": 100, "limit": -1, "roleRef": "...", "color": 0}]
    Import {
        #[arg(long)]
        guild: i64,

        #[arg(short, long)]
        file: PathBuf,
    },

    /// 列出公会排位
    List {
        #[arg(long)]
        guild: i64,
    },

    /// 查看成员排位概览
    Show {
        #[arg(long)]
        guild: i64,

        #[arg(long)]
        user: i64,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        // .env 文件是可选的
        if !e.not_found() {
            eprintln!("读取 .env 失败: {e}");
        }
    }

    let cli = Cli::parse();

    // 1. 加载配置并初始化可观测性
    let config = AppConfig::load("rank-admin").context("加载配置失败")?;
    observability::init(&config.observability)?;
    info!(environment = %config.environment, command = ?cli.command, "rank-admin 启动");

    // 2. 初始化数据库连接
    let db = Database::connect(&config.database).await?;
    if config.database.run_migrations {
        db.run_migrations().await?;
    }

    // 3. 组装服务
    let provider = Arc::new(PgStoreProvider::new(db.pool().clone()));
    let gateway: Arc<dyn RoleGateway> = Arc::new(DiscordRoleGateway::new(&config.gateway)?);
    let catalog = RankCatalog::new(provider.clone(), gateway.clone(), &config.catalog);
    let points = PointsService::new(provider, gateway);

    // 4. 执行命令
    let outcome = match cli.command {
        Commands::PromoteAll { guild } => {
            let report = points.promote_all(guild).await?;
            if !report.is_clean() {
                warn!(
                    skipped = report.skipped.len(),
                    gateway_failures = report.gateway.failures.len(),
                    "部分成员未完成晋升"
                );
            }
            print_json(&report)
        }
        Commands::Resync { guild } => print_json(&points.resync_all(guild).await?),
        Commands::Import { guild, file } => {
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("读取导入文件失败: {}", file.display()))?;
            let entries: Vec<RankImportEntry> =
                serde_json::from_str(&content).context("导入文件格式错误")?;
            print_json(&catalog.import(guild, entries).await?)
        }
        Commands::List { guild } => print_json(&catalog.list(guild).await?),
        Commands::Show { guild, user } => print_json(&points.member_summary(guild, user).await?),
    };

    db.close().await;
    outcome
}
