//! 排位目录集成测试
//!
//! 覆盖目录约束校验、变更后的晋升扇出、角色迁移、删除与批量导入。

use std::sync::Arc;
use std::time::Duration;

use rank_engine::dto::{CreateRankRequest, RankImportEntry, UpdateRankRequest};
use rank_engine::error::RankError;
use rank_engine::test_utils::{TestContext, role_for};
use rank_engine::{Rank, RankStore, StoreProvider};
use rank_shared::config::CatalogConfig;

const GUILD: i64 = 3003;

// ==================== 辅助函数 ====================

async fn create_rank(ctx: &TestContext, name: &str, points: i32, limit: i32) -> Rank {
    let request = CreateRankRequest::new(GUILD, name, points)
        .with_limit(limit)
        .with_role(role_for(name));
    ctx.catalog.create(request).await.unwrap().ranks.remove(0)
}

fn import_entry(name: Option<&str>, points: i32, limit: Option<i32>) -> RankImportEntry {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "points": points,
        "limit": limit,
    }))
    .unwrap()
}

// ==================== 创建 ====================

#[tokio::test]
async fn test_create_rejects_duplicate_threshold() {
    let ctx = TestContext::new();
    create_rank(&ctx, "Bronze", 100, -1).await;

    let err = ctx
        .catalog
        .create(CreateRankRequest::new(GUILD, "Copper", 100))
        .await
        .unwrap_err();
    assert!(matches!(err, RankError::Validation(_)));

    // 其他公会可以使用相同阈值
    assert!(ctx
        .catalog
        .create(CreateRankRequest::new(GUILD + 1, "Copper", 100))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_create_rejects_duplicate_name() {
    let ctx = TestContext::new();
    create_rank(&ctx, "Bronze", 100, -1).await;

    let err = ctx
        .catalog
        .create(CreateRankRequest::new(GUILD, "  Bronze  ", 150))
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_create_rejects_limited_stackable() {
    let ctx = TestContext::new();

    let request = CreateRankRequest::new(GUILD, "Star", 10)
        .with_stackable(true)
        .with_limit(5);
    let err = ctx.catalog.create(request).await.unwrap_err();

    assert!(matches!(err, RankError::Validation(_)));
    assert!(ctx.catalog.list(GUILD).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_rejects_blank_and_long_names() {
    let ctx = TestContext::new();

    let blank = ctx
        .catalog
        .create(CreateRankRequest::new(GUILD, "   ", 10))
        .await
        .unwrap_err();
    assert!(blank.is_validation());

    let long = ctx
        .catalog
        .create(CreateRankRequest::new(GUILD, "x".repeat(101), 10))
        .await
        .unwrap_err();
    assert!(long.is_validation());
}

#[tokio::test]
async fn test_create_trims_name() {
    let ctx = TestContext::new();
    let rank = ctx
        .catalog
        .create(CreateRankRequest::new(GUILD, "  Gold ", 10))
        .await
        .unwrap()
        .ranks
        .remove(0);
    assert_eq!(rank.name, "Gold");

    // 长度按去除空白后的名称计算
    let padded = format!("  {}  ", "y".repeat(100));
    let long = ctx
        .catalog
        .create(CreateRankRequest::new(GUILD, padded, 20))
        .await
        .unwrap()
        .ranks
        .remove(0);
    assert_eq!(long.name.len(), 100);

    let renamed = ctx
        .catalog
        .edit(rank.id, UpdateRankRequest::default().with_name(format!(" {} ", "z".repeat(100))))
        .await
        .unwrap();
    assert_eq!(renamed.ranks[0].name, "z".repeat(100));
}

#[tokio::test]
async fn test_catalog_cap() {
    let ctx = TestContext::with_config(&CatalogConfig {
        max_ranks_per_guild: 2,
    });
    create_rank(&ctx, "A", 10, -1).await;
    create_rank(&ctx, "B", 20, -1).await;

    let err = ctx
        .catalog
        .create(CreateRankRequest::new(GUILD, "C", 30))
        .await
        .unwrap_err();
    assert!(matches!(err, RankError::CatalogFull { limit: 2, .. }));
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_create_promotes_eligible_members() {
    let ctx = TestContext::new();
    ctx.points.set(GUILD, 1, 250).await.unwrap();
    ctx.points.set(GUILD, 2, 120).await.unwrap();

    let r2 = create_rank(&ctx, "R2", 200, -1).await;
    assert_eq!(ctx.provider.member(GUILD, 1).unwrap().main_rank_id, Some(r2.id));
    assert_eq!(ctx.provider.member(GUILD, 2).unwrap().next_rank_id, Some(r2.id));

    // 低一级排位的出现改变了下方成员的主排位与下一排位
    let r1 = create_rank(&ctx, "R1", 100, -1).await;
    let member = ctx.provider.member(GUILD, 2).unwrap();
    assert_eq!(member.main_rank_id, Some(r1.id));
    assert_eq!(member.next_rank_id, Some(r2.id));

    let r3 = create_rank(&ctx, "R3", 300, -1).await;
    assert_eq!(ctx.provider.member(GUILD, 1).unwrap().next_rank_id, Some(r3.id));

    assert!(ctx.gateway.roles_of(GUILD, 1).contains(&role_for("R2")));
    assert!(ctx.gateway.roles_of(GUILD, 2).contains(&role_for("R1")));
}

#[tokio::test]
async fn test_list_and_get() {
    let ctx = TestContext::new();
    let high = create_rank(&ctx, "High", 300, -1).await;
    let low = create_rank(&ctx, "Low", 100, -1).await;

    let ids: Vec<i64> = ctx.catalog.list(GUILD).await.unwrap().iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![low.id, high.id]);

    assert_eq!(ctx.catalog.get(high.id).await.unwrap().name, "High");
    assert!(matches!(
        ctx.catalog.get(9999).await.unwrap_err(),
        RankError::RankNotFound(9999)
    ));
}

// ==================== 编辑 ====================

#[tokio::test]
async fn test_edit_cannot_shrink_below_occupancy() {
    let ctx = TestContext::new();
    let gold = create_rank(&ctx, "Gold", 100, 5).await;
    ctx.points.set(GUILD, 1, 150).await.unwrap();
    ctx.points.set(GUILD, 2, 150).await.unwrap();

    let err = ctx
        .catalog
        .edit(gold.id, UpdateRankRequest::default().with_limit(1))
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let err = ctx
        .catalog
        .edit(gold.id, UpdateRankRequest::default().with_limit(0))
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let change = ctx
        .catalog
        .edit(gold.id, UpdateRankRequest::default().with_limit(2))
        .await
        .unwrap();
    assert_eq!(change.ranks[0].user_limit, 2);
    assert_eq!(ctx.provider.capacity(gold.id), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_edit_limit_waits_for_inflight_points_change() {
    let ctx = Arc::new(TestContext::new());
    let gold_id = create_rank(&ctx, "Gold", 100, 2).await.id;
    ctx.points.set(GUILD, 1, 150).await.unwrap();

    // 积分事务先锁住持有者，编辑随后开始
    let mut points_txn = ctx.provider.begin().await.unwrap();
    points_txn.lock_member(GUILD, 1).await.unwrap();

    let edit_ctx = ctx.clone();
    let edit = tokio::spawn(async move {
        edit_ctx
            .catalog
            .edit(gold_id, UpdateRankRequest::default().with_limit(3))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // 编辑只在成员行上等待，积分事务仍能取得计数器锁
    tokio::time::timeout(Duration::from_secs(2), points_txn.lock_capacity(gold_id))
        .await
        .expect("计数器锁被编辑事务占用")
        .unwrap();
    points_txn.update_points(GUILD, 1, 180).await.unwrap();
    points_txn.commit().await.unwrap();

    let change = tokio::time::timeout(Duration::from_secs(2), edit)
        .await
        .expect("编辑未完成")
        .unwrap()
        .unwrap();
    assert_eq!(change.ranks[0].user_limit, 3);
    assert_eq!(ctx.provider.capacity(gold_id), 1);
    assert_eq!(ctx.provider.member(GUILD, 1).unwrap().main_rank_id, Some(gold_id));
}

#[tokio::test]
async fn test_edit_rejects_stackable_toggle_with_holders() {
    let ctx = TestContext::new();
    let gold = create_rank(&ctx, "Gold", 100, -1).await;
    let empty = create_rank(&ctx, "Empty", 900, -1).await;
    ctx.points.set(GUILD, 1, 150).await.unwrap();

    let err = ctx
        .catalog
        .edit(gold.id, UpdateRankRequest::default().with_stackable(true))
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let change = ctx
        .catalog
        .edit(empty.id, UpdateRankRequest::default().with_stackable(true))
        .await
        .unwrap();
    assert!(change.ranks[0].stackable);
}

#[tokio::test]
async fn test_edit_rejects_empty_update() {
    let ctx = TestContext::new();
    let gold = create_rank(&ctx, "Gold", 100, -1).await;

    let err = ctx
        .catalog
        .edit(gold.id, UpdateRankRequest::default())
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_edit_role_moves_holders() {
    let ctx = TestContext::new();
    let gold = create_rank(&ctx, "Gold", 100, -1).await;
    ctx.points.set(GUILD, 1, 150).await.unwrap();
    assert!(ctx.gateway.roles_of(GUILD, 1).contains(&role_for("Gold")));

    let change = ctx
        .catalog
        .edit(gold.id, UpdateRankRequest::default().with_role(Some("role-aurum".to_string())))
        .await
        .unwrap();

    let roles = ctx.gateway.roles_of(GUILD, 1);
    assert!(roles.contains("role-aurum"));
    assert!(!roles.contains(&role_for("Gold")));
    assert!(change.promotion.gateway.failures.is_empty());
    assert_eq!(change.resync.roles_added + change.resync.roles_removed, 0);
}

#[tokio::test]
async fn test_edit_threshold_demotes_ineligible_holders() {
    let ctx = TestContext::new();
    let r1 = create_rank(&ctx, "R1", 100, -1).await;
    let r2 = create_rank(&ctx, "R2", 200, -1).await;
    ctx.points.set(GUILD, 1, 250).await.unwrap();

    ctx.catalog
        .edit(r2.id, UpdateRankRequest::default().with_points(260))
        .await
        .unwrap();

    let member = ctx.provider.member(GUILD, 1).unwrap();
    assert_eq!(member.main_rank_id, Some(r1.id));
    assert_eq!(member.next_rank_id, Some(r2.id));
    assert_eq!(ctx.provider.capacity(r2.id), 0);
    assert_eq!(ctx.provider.capacity(r1.id), 1);
}

#[tokio::test]
async fn test_edit_rejects_duplicate_threshold() {
    let ctx = TestContext::new();
    create_rank(&ctx, "R1", 100, -1).await;
    let r2 = create_rank(&ctx, "R2", 200, -1).await;

    let err = ctx
        .catalog
        .edit(r2.id, UpdateRankRequest::default().with_points(100))
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

// ==================== 删除 ====================

#[tokio::test]
async fn test_remove_promotes_holders_away() {
    let ctx = TestContext::new();
    let r1 = create_rank(&ctx, "R1", 100, -1).await;
    let r2 = create_rank(&ctx, "R2", 200, -1).await;
    ctx.points.set(GUILD, 1, 250).await.unwrap();
    assert_eq!(ctx.provider.capacity(r2.id), 1);

    let change = ctx.catalog.remove(r2.id).await.unwrap();
    assert_eq!(change.ranks[0].id, r2.id);

    let member = ctx.provider.member(GUILD, 1).unwrap();
    assert_eq!(member.main_rank_id, Some(r1.id));
    assert_eq!(member.next_rank_id, None);
    assert_eq!(ctx.provider.capacity(r1.id), 1);
    // 计数器随排位一起删除，不留孤儿记录
    assert!(!ctx.provider.counter_exists(r2.id));
    assert!(ctx.provider.rank(r2.id).is_none());

    let roles = ctx.gateway.roles_of(GUILD, 1);
    assert!(roles.contains(&role_for("R1")));
    assert!(!roles.contains(&role_for("R2")));
}

#[tokio::test]
async fn test_remove_with_full_fallback_leaves_no_rank() {
    let ctx = TestContext::new();
    let r1 = create_rank(&ctx, "R1", 100, 1).await;
    let r2 = create_rank(&ctx, "R2", 200, -1).await;
    ctx.points.set(GUILD, 1, 150).await.unwrap();
    ctx.points.set(GUILD, 2, 250).await.unwrap();

    ctx.catalog.remove(r2.id).await.unwrap();

    let member = ctx.provider.member(GUILD, 2).unwrap();
    assert_eq!(member.main_rank_id, None);
    assert_eq!(ctx.provider.capacity(r1.id), 1);
    assert!(ctx.gateway.roles_of(GUILD, 2).is_empty());
}

#[tokio::test]
async fn test_remove_stackable_revokes_role() {
    let ctx = TestContext::new();
    let star = ctx
        .catalog
        .create(
            CreateRankRequest::new(GUILD, "Star", 10)
                .with_stackable(true)
                .with_role(role_for("Star")),
        )
        .await
        .unwrap()
        .ranks
        .remove(0);
    ctx.points.set(GUILD, 1, 50).await.unwrap();
    assert!(ctx.gateway.roles_of(GUILD, 1).contains(&role_for("Star")));

    ctx.catalog.remove(star.id).await.unwrap();

    assert!(ctx.provider.member(GUILD, 1).unwrap().stackable_ranks.is_empty());
    assert!(!ctx.gateway.roles_of(GUILD, 1).contains(&role_for("Star")));
}

#[tokio::test]
async fn test_remove_unknown_rank() {
    let ctx = TestContext::new();
    let err = ctx.catalog.remove(4242).await.unwrap_err();
    assert_eq!(err.error_code(), "RANK_NOT_FOUND");
}

// ==================== 批量导入 ====================

#[tokio::test]
async fn test_import_creates_ranks_and_promotes() {
    let ctx = TestContext::new();
    ctx.points.set(GUILD, 1, 600).await.unwrap();

    let mut elite = import_entry(Some("Elite"), 500, Some(1));
    elite.role_ref = Some("role-elite".to_string());
    let change = ctx
        .catalog
        .import(GUILD, vec![import_entry(None, 100, None), elite])
        .await
        .unwrap();

    assert_eq!(change.ranks.len(), 2);
    assert_eq!(change.ranks[0].name, "Rank 100");
    assert_eq!(change.ranks[0].user_limit, -1);

    let elite_id = change.ranks[1].id;
    assert_eq!(ctx.provider.member(GUILD, 1).unwrap().main_rank_id, Some(elite_id));
    assert!(ctx.gateway.roles_of(GUILD, 1).contains("role-elite"));
}

#[tokio::test]
async fn test_import_is_all_or_nothing() {
    let ctx = TestContext::new();
    create_rank(&ctx, "Existing", 300, -1).await;

    let duplicate_in_list = ctx
        .catalog
        .import(GUILD, vec![import_entry(None, 100, None), import_entry(Some("Other"), 100, None)])
        .await
        .unwrap_err();
    assert!(duplicate_in_list.is_validation());

    let duplicate_in_catalog = ctx
        .catalog
        .import(GUILD, vec![import_entry(None, 100, None), import_entry(None, 300, None)])
        .await
        .unwrap_err();
    assert!(duplicate_in_catalog.is_validation());

    assert_eq!(ctx.catalog.list(GUILD).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_import_respects_catalog_cap() {
    let ctx = TestContext::with_config(&CatalogConfig {
        max_ranks_per_guild: 2,
    });
    create_rank(&ctx, "Existing", 300, -1).await;

    let err = ctx
        .catalog
        .import(GUILD, vec![import_entry(None, 100, None), import_entry(None, 200, None)])
        .await
        .unwrap_err();
    assert!(matches!(err, RankError::CatalogFull { .. }));
}
