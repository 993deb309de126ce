//! 晋升引擎集成测试
//!
//! 使用内存存储与记录型网关验证阈值计算、幂等、可叠加排位与降级行为。

use rank_engine::dto::CreateRankRequest;
use rank_engine::error::RankError;
use rank_engine::test_utils::{RoleCall, TestContext, role_for};
use rank_engine::{PromotionEngine, Rank, RankStore, RoleChangeSet, StoreProvider};

const GUILD: i64 = 1001;

// ==================== 辅助函数 ====================

async fn create_rank(ctx: &TestContext, name: &str, points: i32, limit: i32, stackable: bool) -> Rank {
    let request = CreateRankRequest::new(GUILD, name, points)
        .with_limit(limit)
        .with_stackable(stackable)
        .with_role(role_for(name));
    let change = ctx.catalog.create(request).await.unwrap();
    change.ranks.into_iter().next().unwrap()
}

/// R1(100) < R2(200) < R3(300)，均为不限量独占排位
async fn seed_ladder(ctx: &TestContext) -> (Rank, Rank, Rank) {
    (
        create_rank(ctx, "R1", 100, -1, false).await,
        create_rank(ctx, "R2", 200, -1, false).await,
        create_rank(ctx, "R3", 300, -1, false).await,
    )
}

async fn promote_once(ctx: &TestContext, user_id: i64) -> (bool, RoleChangeSet) {
    let engine = PromotionEngine::default();
    let mut store = ctx.provider.begin().await.unwrap();
    let catalog = engine.load_catalog(&mut store, GUILD).await.unwrap();
    let mut changes = RoleChangeSet::new();
    let outcome = engine
        .promote(&mut store, &catalog, GUILD, user_id, &mut changes)
        .await
        .unwrap();
    store.commit().await.unwrap();
    (outcome.changed, changes)
}

// ==================== 阈值计算 ====================

#[tokio::test]
async fn test_threshold_resolution() {
    let ctx = TestContext::new();
    let (r1, r2, r3) = seed_ladder(&ctx).await;

    let result = ctx.points.set(GUILD, 1, 250).await.unwrap();
    assert_eq!(result.main_rank.as_ref().map(|r| r.id), Some(r2.id));
    assert_eq!(result.member.next_rank_id, Some(r3.id));

    let result = ctx.points.set(GUILD, 2, 350).await.unwrap();
    assert_eq!(result.member.main_rank_id, Some(r3.id));
    assert_eq!(result.member.next_rank_id, None);

    let result = ctx.points.set(GUILD, 3, 50).await.unwrap();
    assert!(result.main_rank.is_none());
    assert_eq!(result.member.main_rank_id, None);
    assert_eq!(result.member.next_rank_id, Some(r1.id));
}

#[tokio::test]
async fn test_exact_threshold_is_reached() {
    let ctx = TestContext::new();
    let (_, r2, r3) = seed_ladder(&ctx).await;

    let result = ctx.points.set(GUILD, 1, 200).await.unwrap();
    assert_eq!(result.member.main_rank_id, Some(r2.id));
    assert_eq!(result.member.next_rank_id, Some(r3.id));
}

#[tokio::test]
async fn test_disabled_rank_is_skipped_but_still_next() {
    let ctx = TestContext::new();
    let r1 = create_rank(&ctx, "R1", 100, -1, false).await;
    let r2 = create_rank(&ctx, "R2", 200, 0, false).await;

    let result = ctx.points.set(GUILD, 1, 250).await.unwrap();
    assert_eq!(result.member.main_rank_id, Some(r1.id));
    // 下一排位指针不看名额状态
    assert_eq!(result.member.next_rank_id, Some(r2.id));
    assert!(!ctx.provider.counter_exists(r2.id));
}

#[tokio::test]
async fn test_full_rank_falls_back_to_lower_rank() {
    let ctx = TestContext::new();
    let r1 = create_rank(&ctx, "R1", 100, -1, false).await;
    let r2 = create_rank(&ctx, "R2", 200, 1, false).await;

    ctx.points.set(GUILD, 1, 300).await.unwrap();
    let second = ctx.points.set(GUILD, 2, 250).await.unwrap();

    assert_eq!(ctx.provider.member(GUILD, 1).unwrap().main_rank_id, Some(r2.id));
    assert_eq!(second.member.main_rank_id, Some(r1.id));
    assert_eq!(second.member.next_rank_id, Some(r2.id));
    assert_eq!(ctx.provider.capacity(r2.id), 1);
    assert_eq!(ctx.provider.capacity(r1.id), 1);
}

#[tokio::test]
async fn test_current_holder_keeps_full_rank() {
    let ctx = TestContext::new();
    let r1 = create_rank(&ctx, "R1", 100, 1, false).await;

    ctx.points.set(GUILD, 1, 150).await.unwrap();
    let again = ctx.points.grant(GUILD, 1, 10).await.unwrap();

    assert_eq!(again.member.main_rank_id, Some(r1.id));
    assert_eq!(ctx.provider.capacity(r1.id), 1);
}

// ==================== 幂等 ====================

#[tokio::test]
async fn test_promote_is_idempotent() {
    let ctx = TestContext::new();
    let (_, r2, _) = seed_ladder(&ctx).await;
    create_rank(&ctx, "Star", 50, -1, true).await;

    ctx.points.set(GUILD, 7, 260).await.unwrap();
    let before = ctx.provider.member(GUILD, 7).unwrap();
    ctx.gateway.clear_calls();

    let (changed, changes) = promote_once(&ctx, 7).await;
    assert!(!changed);
    assert!(changes.is_empty());

    let (changed, changes) = promote_once(&ctx, 7).await;
    assert!(!changed);
    assert!(changes.is_empty());

    let after = ctx.provider.member(GUILD, 7).unwrap();
    assert_eq!(after.main_rank_id, before.main_rank_id);
    assert_eq!(after.next_rank_id, before.next_rank_id);
    assert_eq!(after.stackable_ranks, before.stackable_ranks);
    assert_eq!(ctx.provider.capacity(r2.id), 1);
    assert!(ctx.gateway.mutation_calls().is_empty());
}

#[tokio::test]
async fn test_promote_all_twice_issues_no_gateway_calls() {
    let ctx = TestContext::new();
    seed_ladder(&ctx).await;
    for (user, points) in [(1, 120), (2, 220), (3, 320)] {
        ctx.points.set(GUILD, user, points).await.unwrap();
    }
    ctx.gateway.clear_calls();

    let first = ctx.points.promote_all(GUILD).await.unwrap();
    let second = ctx.points.promote_all(GUILD).await.unwrap();

    assert_eq!(first.processed, 3);
    assert_eq!(first.changed, 0);
    assert_eq!(second.changed, 0);
    assert_eq!(second.gateway.applied, 0);
    assert!(ctx.gateway.mutation_calls().is_empty());
}

// ==================== 可叠加排位 ====================

#[tokio::test]
async fn test_stackable_ranks_are_independent() {
    let ctx = TestContext::new();
    let r1 = create_rank(&ctx, "R1", 100, -1, false).await;
    let s1 = create_rank(&ctx, "S1", 50, -1, true).await;
    let s2 = create_rank(&ctx, "S2", 150, -1, true).await;
    let r2 = create_rank(&ctx, "R2", 200, 1, false).await;

    let a = ctx.points.set(GUILD, 1, 250).await.unwrap().member;
    let b = ctx.points.set(GUILD, 2, 250).await.unwrap().member;

    assert_eq!(a.main_rank_id, Some(r2.id));
    assert_eq!(b.main_rank_id, Some(r1.id));
    for member in [&a, &b] {
        assert_eq!(
            member.stackable_ranks.iter().copied().collect::<Vec<_>>(),
            vec![s1.id, s2.id]
        );
    }

    // 可叠加排位从不占用名额
    assert!(!ctx.provider.counter_exists(s1.id));
    assert!(!ctx.provider.counter_exists(s2.id));

    let roles = ctx.gateway.roles_of(GUILD, 2);
    assert!(roles.contains(&role_for("S1")));
    assert!(roles.contains(&role_for("S2")));
    assert!(roles.contains(&role_for("R1")));
}

#[tokio::test]
async fn test_stackable_removed_on_point_loss() {
    let ctx = TestContext::new();
    let s1 = create_rank(&ctx, "S1", 50, -1, true).await;
    let s2 = create_rank(&ctx, "S2", 150, -1, true).await;

    ctx.points.set(GUILD, 1, 200).await.unwrap();
    let member = ctx.points.revoke(GUILD, 1, 100).await.unwrap().member;

    assert_eq!(member.stackable_ranks.iter().copied().collect::<Vec<_>>(), vec![s1.id]);
    assert!(!member.stackable_ranks.contains(&s2.id));
    assert!(member.main_rank_id.is_none());
    assert!(!ctx.gateway.roles_of(GUILD, 1).contains(&role_for("S2")));
}

// ==================== 降级 ====================

#[tokio::test]
async fn test_downgrade_releases_exactly_one_slot() {
    let ctx = TestContext::new();
    let (r1, r2, _) = seed_ladder(&ctx).await;

    ctx.points.set(GUILD, 1, 250).await.unwrap();
    ctx.points.set(GUILD, 2, 220).await.unwrap();
    assert_eq!(ctx.provider.capacity(r2.id), 2);
    ctx.gateway.clear_calls();

    let result = ctx.points.revoke(GUILD, 1, 100).await.unwrap();
    assert_eq!(result.member.main_rank_id, Some(r1.id));
    assert_eq!(ctx.provider.capacity(r2.id), 1);
    assert_eq!(ctx.provider.capacity(r1.id), 1);

    let calls = ctx.gateway.mutation_calls();
    assert!(calls.contains(&RoleCall::Remove {
        user_id: 1,
        role_ref: role_for("R2"),
    }));
    assert!(calls.contains(&RoleCall::Add {
        user_id: 1,
        role_ref: role_for("R1"),
    }));

    let result = ctx.points.revoke(GUILD, 1, 100).await.unwrap();
    assert!(result.main_rank.is_none());
    assert_eq!(result.member.next_rank_id, Some(r1.id));
    assert_eq!(ctx.provider.capacity(r1.id), 0);
    // 释放后计数器保留为 0
    assert!(ctx.provider.counter_exists(r1.id));
}

// ==================== 积分变更 ====================

#[tokio::test]
async fn test_points_saturate() {
    let ctx = TestContext::new();

    ctx.points.set(GUILD, 1, i32::MAX - 5).await.unwrap();
    let result = ctx.points.grant(GUILD, 1, 100).await.unwrap();
    assert_eq!(result.member.points, i32::MAX);

    ctx.points.set(GUILD, 2, i32::MIN + 5).await.unwrap();
    let result = ctx.points.revoke(GUILD, 2, 100).await.unwrap();
    assert_eq!(result.member.points, i32::MIN);
}

#[tokio::test]
async fn test_member_summary() {
    let ctx = TestContext::new();
    let (_, r2, r3) = seed_ladder(&ctx).await;
    let star = create_rank(&ctx, "Star", 10, -1, true).await;

    ctx.points.set(GUILD, 5, 240).await.unwrap();
    let summary = ctx.points.member_summary(GUILD, 5).await.unwrap();

    assert_eq!(summary.points, 240);
    assert_eq!(summary.main_rank.map(|r| r.id), Some(r2.id));
    assert_eq!(summary.next_rank.map(|r| r.id), Some(r3.id));
    assert_eq!(summary.points_to_next, Some(60));
    assert_eq!(summary.stackable_ranks.len(), 1);
    assert_eq!(summary.stackable_ranks[0].id, star.id);

    let missing = ctx.points.member_summary(GUILD, 999).await.unwrap_err();
    assert!(matches!(missing, RankError::MemberNotFound { .. }));
}

#[tokio::test]
async fn test_ranks_without_role_skip_gateway() {
    let ctx = TestContext::new();
    let request = CreateRankRequest::new(GUILD, "Plain", 10);
    let rank = ctx.catalog.create(request).await.unwrap().ranks.remove(0);
    ctx.gateway.clear_calls();

    let result = ctx.points.set(GUILD, 1, 20).await.unwrap();
    assert_eq!(result.member.main_rank_id, Some(rank.id));
    assert!(ctx.gateway.mutation_calls().is_empty());
}
