//! PostgreSQL 排位存储
//!
//! 每个 `PgStore` 独占一个数据库事务。行锁通过 `SELECT ... FOR UPDATE`
//! 获取，Postgres 在同一事务内重复加锁不会阻塞，锁随事务提交或回滚释放。

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use super::traits::{RankStore, StoreProvider};
use crate::error::{RankError, Result, map_constraint_violation};
use crate::models::{Member, Rank};
use crate::service::dto::NewRank;

const RANK_COLUMNS: &str = "id, guild_id, name, points_required, user_limit, stackable, role_ref, color, created_at, updated_at";

const MEMBER_COLUMNS: &str =
    "guild_id, user_id, points, main_rank_id, next_rank_id, created_at, updated_at";

/// 基于连接池的事务工厂
#[derive(Clone)]
pub struct PgStoreProvider {
    pool: PgPool,
}

impl PgStoreProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StoreProvider for PgStoreProvider {
    type Store = PgStore;

    async fn begin(&self) -> Result<PgStore> {
        let tx = self.pool.begin().await?;
        Ok(PgStore { tx })
    }
}

/// 单事务排位存储
pub struct PgStore {
    tx: Transaction<'static, Postgres>,
}

impl PgStore {
    /// 为成员补齐可叠加排位集合
    async fn attach_stackables(&mut self, guild_id: i64, members: &mut [Member]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }

        let user_ids: Vec<i64> = members.iter().map(|m| m.user_id).collect();
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT user_id, rank_id
            FROM rank_member_stackables
            WHERE guild_id = $1 AND user_id = ANY($2)
            "#,
        )
        .bind(guild_id)
        .bind(&user_ids)
        .fetch_all(&mut *self.tx)
        .await?;

        let mut by_user: HashMap<i64, BTreeSet<i64>> = HashMap::new();
        for (user_id, rank_id) in rows {
            by_user.entry(user_id).or_default().insert(rank_id);
        }

        for member in members.iter_mut() {
            member.stackable_ranks = by_user.remove(&member.user_id).unwrap_or_default();
        }
        Ok(())
    }
}

#[async_trait]
impl RankStore for PgStore {
    async fn list_ranks(&mut self, guild_id: i64) -> Result<Vec<Rank>> {
        let ranks = sqlx::query_as::<_, Rank>(&format!(
            "SELECT {} FROM rank_definitions WHERE guild_id = $1 ORDER BY points_required ASC, id ASC",
            RANK_COLUMNS
        ))
        .bind(guild_id)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(ranks)
    }

    async fn get_rank(&mut self, rank_id: i64) -> Result<Option<Rank>> {
        let rank = sqlx::query_as::<_, Rank>(&format!(
            "SELECT {} FROM rank_definitions WHERE id = $1",
            RANK_COLUMNS
        ))
        .bind(rank_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(rank)
    }

    async fn insert_rank(&mut self, rank: &NewRank) -> Result<Rank> {
        let created = sqlx::query_as::<_, Rank>(&format!(
            r#"
            INSERT INTO rank_definitions (guild_id, name, points_required, user_limit, stackable, role_ref, color)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            RANK_COLUMNS
        ))
        .bind(rank.guild_id)
        .bind(&rank.name)
        .bind(rank.points_required)
        .bind(rank.user_limit)
        .bind(rank.stackable)
        .bind(&rank.role_ref)
        .bind(rank.color)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_constraint_violation)?;

        Ok(created)
    }

    async fn update_rank(&mut self, rank: &Rank) -> Result<Rank> {
        let updated = sqlx::query_as::<_, Rank>(&format!(
            r#"
            UPDATE rank_definitions
            SET name = $2, points_required = $3, user_limit = $4, stackable = $5,
                role_ref = $6, color = $7, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            RANK_COLUMNS
        ))
        .bind(rank.id)
        .bind(&rank.name)
        .bind(rank.points_required)
        .bind(rank.user_limit)
        .bind(rank.stackable)
        .bind(&rank.role_ref)
        .bind(rank.color)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_constraint_violation)?;

        updated.ok_or(RankError::RankNotFound(rank.id))
    }

    async fn delete_rank(&mut self, rank_id: i64) -> Result<()> {
        // 计数器与可叠加持有记录随外键级联删除
        let result = sqlx::query("DELETE FROM rank_definitions WHERE id = $1")
            .bind(rank_id)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RankError::RankNotFound(rank_id));
        }
        Ok(())
    }

    async fn read_capacity(&mut self, rank_id: i64) -> Result<i32> {
        let count: Option<i32> =
            sqlx::query_scalar("SELECT user_count FROM rank_capacity WHERE rank_id = $1")
                .bind(rank_id)
                .fetch_optional(&mut *self.tx)
                .await?;

        Ok(count.unwrap_or(0))
    }

    async fn lock_capacity(&mut self, rank_id: i64) -> Result<i32> {
        sqlx::query(
            r#"
            INSERT INTO rank_capacity (rank_id, user_count)
            VALUES ($1, 0)
            ON CONFLICT (rank_id) DO NOTHING
            "#,
        )
        .bind(rank_id)
        .execute(&mut *self.tx)
        .await?;

        let count: i32 = sqlx::query_scalar(
            "SELECT user_count FROM rank_capacity WHERE rank_id = $1 FOR UPDATE",
        )
        .bind(rank_id)
        .fetch_one(&mut *self.tx)
        .await?;

        debug!(rank_id, user_count = count, "名额计数器已锁定");
        Ok(count)
    }

    async fn write_capacity(&mut self, rank_id: i64, user_count: i32) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rank_capacity (rank_id, user_count)
            VALUES ($1, $2)
            ON CONFLICT (rank_id) DO UPDATE SET user_count = EXCLUDED.user_count
            "#,
        )
        .bind(rank_id)
        .bind(user_count.max(0))
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn get_member(&mut self, guild_id: i64, user_id: i64) -> Result<Option<Member>> {
        let member = sqlx::query_as::<_, Member>(&format!(
            "SELECT {} FROM rank_members WHERE guild_id = $1 AND user_id = $2",
            MEMBER_COLUMNS
        ))
        .bind(guild_id)
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        match member {
            Some(member) => {
                let mut members = [member];
                self.attach_stackables(guild_id, &mut members).await?;
                let [member] = members;
                Ok(Some(member))
            }
            None => Ok(None),
        }
    }

    async fn lock_member(&mut self, guild_id: i64, user_id: i64) -> Result<Member> {
        sqlx::query(
            r#"
            INSERT INTO rank_members (guild_id, user_id, points)
            VALUES ($1, $2, 0)
            ON CONFLICT (guild_id, user_id) DO NOTHING
            "#,
        )
        .bind(guild_id)
        .bind(user_id)
        .execute(&mut *self.tx)
        .await?;

        let member = sqlx::query_as::<_, Member>(&format!(
            "SELECT {} FROM rank_members WHERE guild_id = $1 AND user_id = $2 FOR UPDATE",
            MEMBER_COLUMNS
        ))
        .bind(guild_id)
        .bind(user_id)
        .fetch_one(&mut *self.tx)
        .await?;

        let mut members = [member];
        self.attach_stackables(guild_id, &mut members).await?;
        let [member] = members;
        Ok(member)
    }

    async fn list_members(&mut self, guild_id: i64) -> Result<Vec<Member>> {
        let mut members = sqlx::query_as::<_, Member>(&format!(
            "SELECT {} FROM rank_members WHERE guild_id = $1 ORDER BY points DESC, user_id ASC",
            MEMBER_COLUMNS
        ))
        .bind(guild_id)
        .fetch_all(&mut *self.tx)
        .await?;

        self.attach_stackables(guild_id, &mut members).await?;
        Ok(members)
    }

    async fn list_members_affected_by(
        &mut self,
        guild_id: i64,
        rank_id: i64,
        min_points: Option<i32>,
    ) -> Result<Vec<Member>> {
        let mut members = sqlx::query_as::<_, Member>(&format!(
            r#"
            SELECT {} FROM rank_members m
            WHERE m.guild_id = $1 AND (
                ($3::INTEGER IS NOT NULL AND m.points >= $3)
                OR m.main_rank_id = $2
                OR m.next_rank_id = $2
                OR EXISTS (
                    SELECT 1 FROM rank_member_stackables s
                    WHERE s.guild_id = m.guild_id AND s.user_id = m.user_id AND s.rank_id = $2
                )
            )
            ORDER BY m.points DESC, m.user_id ASC
            "#,
            MEMBER_COLUMNS
        ))
        .bind(guild_id)
        .bind(rank_id)
        .bind(min_points)
        .fetch_all(&mut *self.tx)
        .await?;

        self.attach_stackables(guild_id, &mut members).await?;
        Ok(members)
    }

    async fn update_points(&mut self, guild_id: i64, user_id: i64, points: i32) -> Result<()> {
        let result = sqlx::query(
            "UPDATE rank_members SET points = $3, updated_at = NOW() WHERE guild_id = $1 AND user_id = $2",
        )
        .bind(guild_id)
        .bind(user_id)
        .bind(points)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RankError::MemberNotFound { guild_id, user_id });
        }
        Ok(())
    }

    async fn update_rank_pointers(&mut self, member: &Member) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE rank_members
            SET main_rank_id = $3, next_rank_id = $4, updated_at = NOW()
            WHERE guild_id = $1 AND user_id = $2
            "#,
        )
        .bind(member.guild_id)
        .bind(member.user_id)
        .bind(member.main_rank_id)
        .bind(member.next_rank_id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RankError::MemberNotFound {
                guild_id: member.guild_id,
                user_id: member.user_id,
            });
        }
        Ok(())
    }

    async fn apply_stackable_diff(
        &mut self,
        guild_id: i64,
        user_id: i64,
        added: &[i64],
        removed: &[i64],
    ) -> Result<()> {
        if !removed.is_empty() {
            sqlx::query(
                r#"
                DELETE FROM rank_member_stackables
                WHERE guild_id = $1 AND user_id = $2 AND rank_id = ANY($3)
                "#,
            )
            .bind(guild_id)
            .bind(user_id)
            .bind(removed)
            .execute(&mut *self.tx)
            .await?;
        }

        for rank_id in added {
            sqlx::query(
                r#"
                INSERT INTO rank_member_stackables (guild_id, user_id, rank_id)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(guild_id)
            .bind(user_id)
            .bind(rank_id)
            .execute(&mut *self.tx)
            .await?;
        }

        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
