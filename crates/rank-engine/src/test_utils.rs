//! 测试工具模块
//!
//! 提供内存版排位存储与可记录调用的角色网关，服务层测试无需数据库。
//!
//! `MemoryStore` 与 `PgStore` 保持相同的加锁语义：名额计数器与成员行的
//! 行锁在同一事务内可重入，持有到提交或丢弃；未提交即丢弃的事务会回滚。

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

use crate::error::{RankError, Result};
use crate::gateway::RoleGateway;
use crate::models::{Member, Rank};
use crate::repository::{RankStore, StoreProvider};
use crate::service::dto::NewRank;
use crate::service::{PointsService, RankCatalog, ReconciliationService};
use rank_shared::config::CatalogConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LockKey {
    Capacity(i64),
    Member(i64, i64),
}

#[derive(Debug, Default)]
struct MemoryState {
    next_rank_id: i64,
    ranks: BTreeMap<i64, Rank>,
    capacity: HashMap<i64, i32>,
    members: BTreeMap<(i64, i64), Member>,
}

/// 回滚记录：修改前的值
enum Undo {
    Rank(i64, Option<Rank>),
    Capacity(i64, Option<i32>),
    Member((i64, i64), Option<Member>),
}

#[derive(Default)]
struct MemoryDb {
    state: Mutex<MemoryState>,
    locks: Mutex<HashMap<LockKey, Arc<RowLock<()>>>>,
}

/// 内存存储的事务工厂，同时提供测试断言用的快照读取
#[derive(Clone, Default)]
pub struct MemoryStoreProvider {
    db: Arc<MemoryDb>,
}

impl MemoryStoreProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已提交的名额计数（计数器不存在时为 0）
    pub fn capacity(&self, rank_id: i64) -> i32 {
        self.db
            .state
            .lock()
            .capacity
            .get(&rank_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn counter_exists(&self, rank_id: i64) -> bool {
        self.db.state.lock().capacity.contains_key(&rank_id)
    }

    pub fn member(&self, guild_id: i64, user_id: i64) -> Option<Member> {
        self.db.state.lock().members.get(&(guild_id, user_id)).cloned()
    }

    pub fn rank(&self, rank_id: i64) -> Option<Rank> {
        self.db.state.lock().ranks.get(&rank_id).cloned()
    }

    /// 直接写入成员（绕过服务层，用于构造漂移场景）
    pub fn put_member(&self, member: Member) {
        self.db
            .state
            .lock()
            .members
            .insert((member.guild_id, member.user_id), member);
    }
}

#[async_trait]
impl StoreProvider for MemoryStoreProvider {
    type Store = MemoryStore;

    async fn begin(&self) -> Result<MemoryStore> {
        Ok(MemoryStore {
            db: self.db.clone(),
            held: HashMap::new(),
            undo: Vec::new(),
            committed: false,
        })
    }
}

/// 内存事务
pub struct MemoryStore {
    db: Arc<MemoryDb>,
    held: HashMap<LockKey, OwnedMutexGuard<()>>,
    undo: Vec<Undo>,
    committed: bool,
}

impl MemoryStore {
    async fn lock(&mut self, key: LockKey) {
        if self.held.contains_key(&key) {
            return;
        }
        let row = self.db.locks.lock().entry(key).or_default().clone();
        let guard = row.lock_owned().await;
        self.held.insert(key, guard);
    }

    fn check_rank_constraints(state: &MemoryState, rank_id: Option<i64>, rank: &NewRank) -> Result<()> {
        if rank.stackable && rank.user_limit != -1 {
            return Err(RankError::Validation(
                "排位定义不合法: 可叠加排位必须不限量".to_string(),
            ));
        }
        for other in state
            .ranks
            .values()
            .filter(|r| r.guild_id == rank.guild_id && Some(r.id) != rank_id)
        {
            if other.name == rank.name {
                return Err(RankError::Validation("排位名称在公会内重复".to_string()));
            }
            if other.points_required == rank.points_required {
                return Err(RankError::Validation("所需积分在公会内重复".to_string()));
            }
        }
        Ok(())
    }

    fn remember_member(&mut self, state: &MemoryState, key: (i64, i64)) {
        self.undo
            .push(Undo::Member(key, state.members.get(&key).cloned()));
    }

    fn sorted(mut members: Vec<Member>) -> Vec<Member> {
        members.sort_by(|a, b| b.points.cmp(&a.points).then(a.user_id.cmp(&b.user_id)));
        members
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if self.committed || self.undo.is_empty() {
            return;
        }
        let mut state = self.db.state.lock();
        for undo in self.undo.drain(..).rev() {
            match undo {
                Undo::Rank(id, Some(rank)) => {
                    state.ranks.insert(id, rank);
                }
                Undo::Rank(id, None) => {
                    state.ranks.remove(&id);
                }
                Undo::Capacity(id, Some(count)) => {
                    state.capacity.insert(id, count);
                }
                Undo::Capacity(id, None) => {
                    state.capacity.remove(&id);
                }
                Undo::Member(key, Some(member)) => {
                    state.members.insert(key, member);
                }
                Undo::Member(key, None) => {
                    state.members.remove(&key);
                }
            }
        }
    }
}

#[async_trait]
impl RankStore for MemoryStore {
    async fn list_ranks(&mut self, guild_id: i64) -> Result<Vec<Rank>> {
        let state = self.db.state.lock();
        let mut ranks: Vec<Rank> = state
            .ranks
            .values()
            .filter(|r| r.guild_id == guild_id)
            .cloned()
            .collect();
        ranks.sort_by_key(|r| (r.points_required, r.id));
        Ok(ranks)
    }

    async fn get_rank(&mut self, rank_id: i64) -> Result<Option<Rank>> {
        Ok(self.db.state.lock().ranks.get(&rank_id).cloned())
    }

    async fn insert_rank(&mut self, rank: &NewRank) -> Result<Rank> {
        let db = self.db.clone();
        let mut state = db.state.lock();
        Self::check_rank_constraints(&state, None, rank)?;

        state.next_rank_id += 1;
        let now = Utc::now();
        let created = Rank {
            id: state.next_rank_id,
            guild_id: rank.guild_id,
            name: rank.name.clone(),
            points_required: rank.points_required,
            user_limit: rank.user_limit,
            stackable: rank.stackable,
            role_ref: rank.role_ref.clone(),
            color: rank.color,
            created_at: now,
            updated_at: now,
        };
        state.ranks.insert(created.id, created.clone());
        self.undo.push(Undo::Rank(created.id, None));
        Ok(created)
    }

    async fn update_rank(&mut self, rank: &Rank) -> Result<Rank> {
        let db = self.db.clone();
        let mut state = db.state.lock();
        let previous = state
            .ranks
            .get(&rank.id)
            .cloned()
            .ok_or(RankError::RankNotFound(rank.id))?;

        let candidate = NewRank {
            guild_id: previous.guild_id,
            name: rank.name.clone(),
            points_required: rank.points_required,
            user_limit: rank.user_limit,
            stackable: rank.stackable,
            role_ref: rank.role_ref.clone(),
            color: rank.color,
        };
        Self::check_rank_constraints(&state, Some(rank.id), &candidate)?;

        let mut updated = rank.clone();
        updated.guild_id = previous.guild_id;
        updated.created_at = previous.created_at;
        updated.updated_at = Utc::now();
        state.ranks.insert(rank.id, updated.clone());
        self.undo.push(Undo::Rank(rank.id, Some(previous)));
        Ok(updated)
    }

    async fn delete_rank(&mut self, rank_id: i64) -> Result<()> {
        let db = self.db.clone();
        let mut state = db.state.lock();
        let removed = state
            .ranks
            .remove(&rank_id)
            .ok_or(RankError::RankNotFound(rank_id))?;
        self.undo.push(Undo::Rank(rank_id, Some(removed)));

        if let Some(count) = state.capacity.remove(&rank_id) {
            self.undo.push(Undo::Capacity(rank_id, Some(count)));
        }

        let referencing: Vec<(i64, i64)> = state
            .members
            .iter()
            .filter(|(_, m)| {
                m.main_rank_id == Some(rank_id)
                    || m.next_rank_id == Some(rank_id)
                    || m.stackable_ranks.contains(&rank_id)
            })
            .map(|(key, _)| *key)
            .collect();
        for key in referencing {
            self.remember_member(&state, key);
            if let Some(member) = state.members.get_mut(&key) {
                if member.main_rank_id == Some(rank_id) {
                    member.main_rank_id = None;
                }
                if member.next_rank_id == Some(rank_id) {
                    member.next_rank_id = None;
                }
                member.stackable_ranks.remove(&rank_id);
            }
        }
        Ok(())
    }

    async fn read_capacity(&mut self, rank_id: i64) -> Result<i32> {
        Ok(self
            .db
            .state
            .lock()
            .capacity
            .get(&rank_id)
            .copied()
            .unwrap_or(0))
    }

    async fn lock_capacity(&mut self, rank_id: i64) -> Result<i32> {
        self.lock(LockKey::Capacity(rank_id)).await;

        let db = self.db.clone();
        let mut state = db.state.lock();
        if !state.ranks.contains_key(&rank_id) {
            return Err(RankError::RankNotFound(rank_id));
        }
        if let Some(count) = state.capacity.get(&rank_id) {
            return Ok(*count);
        }
        state.capacity.insert(rank_id, 0);
        self.undo.push(Undo::Capacity(rank_id, None));
        Ok(0)
    }

    async fn write_capacity(&mut self, rank_id: i64, user_count: i32) -> Result<()> {
        let db = self.db.clone();
        let mut state = db.state.lock();
        let previous = state.capacity.insert(rank_id, user_count.max(0));
        self.undo.push(Undo::Capacity(rank_id, previous));
        Ok(())
    }

    async fn get_member(&mut self, guild_id: i64, user_id: i64) -> Result<Option<Member>> {
        Ok(self
            .db
            .state
            .lock()
            .members
            .get(&(guild_id, user_id))
            .cloned())
    }

    async fn lock_member(&mut self, guild_id: i64, user_id: i64) -> Result<Member> {
        self.lock(LockKey::Member(guild_id, user_id)).await;

        let db = self.db.clone();
        let mut state = db.state.lock();
        let key = (guild_id, user_id);
        if let Some(member) = state.members.get(&key) {
            return Ok(member.clone());
        }
        let member = Member::new(guild_id, user_id);
        state.members.insert(key, member.clone());
        self.undo.push(Undo::Member(key, None));
        Ok(member)
    }

    async fn list_members(&mut self, guild_id: i64) -> Result<Vec<Member>> {
        let members = self
            .db
            .state
            .lock()
            .members
            .values()
            .filter(|m| m.guild_id == guild_id)
            .cloned()
            .collect();
        Ok(Self::sorted(members))
    }

    async fn list_members_affected_by(
        &mut self,
        guild_id: i64,
        rank_id: i64,
        min_points: Option<i32>,
    ) -> Result<Vec<Member>> {
        let members = self
            .db
            .state
            .lock()
            .members
            .values()
            .filter(|m| m.guild_id == guild_id)
            .filter(|m| {
                min_points.is_some_and(|min| m.points >= min)
                    || m.main_rank_id == Some(rank_id)
                    || m.next_rank_id == Some(rank_id)
                    || m.stackable_ranks.contains(&rank_id)
            })
            .cloned()
            .collect();
        Ok(Self::sorted(members))
    }

    async fn update_points(&mut self, guild_id: i64, user_id: i64, points: i32) -> Result<()> {
        let db = self.db.clone();
        let mut state = db.state.lock();
        let key = (guild_id, user_id);
        if !state.members.contains_key(&key) {
            return Err(RankError::MemberNotFound { guild_id, user_id });
        }
        self.remember_member(&state, key);
        if let Some(member) = state.members.get_mut(&key) {
            member.points = points;
            member.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_rank_pointers(&mut self, member: &Member) -> Result<()> {
        let db = self.db.clone();
        let mut state = db.state.lock();
        let key = (member.guild_id, member.user_id);
        if !state.members.contains_key(&key) {
            return Err(RankError::MemberNotFound {
                guild_id: member.guild_id,
                user_id: member.user_id,
            });
        }
        self.remember_member(&state, key);
        if let Some(stored) = state.members.get_mut(&key) {
            stored.main_rank_id = member.main_rank_id;
            stored.next_rank_id = member.next_rank_id;
            stored.updated_at = Utc::now();
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
        let db = self.db.clone();
        let mut state = db.state.lock();
        let key = (guild_id, user_id);
        if !state.members.contains_key(&key) {
            return Err(RankError::MemberNotFound { guild_id, user_id });
        }
        if let Some(missing) = added.iter().find(|id| !state.ranks.contains_key(*id)) {
            return Err(RankError::RankNotFound(*missing));
        }
        self.remember_member(&state, key);
        if let Some(member) = state.members.get_mut(&key) {
            for id in removed {
                member.stackable_ranks.remove(id);
            }
            member.stackable_ranks.extend(added.iter().copied());
        }
        Ok(())
    }

    async fn commit(mut self) -> Result<()> {
        self.committed = true;
        Ok(())
    }
}

/// 网关调用记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleCall {
    Add { user_id: i64, role_ref: String },
    Remove { user_id: i64, role_ref: String },
    Read { user_id: i64 },
}

#[derive(Debug, Default)]
struct RecordingState {
    calls: Vec<RoleCall>,
    roles: HashMap<(i64, i64), BTreeSet<String>>,
    failing: HashSet<String>,
}

/// 记录调用并维护成员角色集合的网关
#[derive(Debug, Default)]
pub struct RecordingRoleGateway {
    state: Mutex<RecordingState>,
}

impl RecordingRoleGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RoleCall> {
        self.state.lock().calls.clone()
    }

    /// 授予/撤销调用（不含读取）
    pub fn mutation_calls(&self) -> Vec<RoleCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| !matches!(c, RoleCall::Read { .. }))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn roles_of(&self, guild_id: i64, user_id: i64) -> BTreeSet<String> {
        self.state
            .lock()
            .roles
            .get(&(guild_id, user_id))
            .cloned()
            .unwrap_or_default()
    }

    /// 直接设置平台侧角色（用于构造漂移）
    pub fn seed_roles<I, R>(&self, guild_id: i64, user_id: i64, roles: I)
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        self.state
            .lock()
            .roles
            .insert((guild_id, user_id), roles.into_iter().map(Into::into).collect());
    }

    /// 让指定角色的授予/撤销失败
    pub fn fail_role(&self, role_ref: &str) {
        self.state.lock().failing.insert(role_ref.to_string());
    }

    pub fn heal_role(&self, role_ref: &str) {
        self.state.lock().failing.remove(role_ref);
    }
}

#[async_trait]
impl RoleGateway for RecordingRoleGateway {
    async fn add_role(&self, guild_id: i64, user_id: i64, role_ref: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(RoleCall::Add {
            user_id,
            role_ref: role_ref.to_string(),
        });
        if state.failing.contains(role_ref) {
            return Err(RankError::Gateway(format!("角色 {} 不可用", role_ref)));
        }
        state
            .roles
            .entry((guild_id, user_id))
            .or_default()
            .insert(role_ref.to_string());
        Ok(())
    }

    async fn remove_role(&self, guild_id: i64, user_id: i64, role_ref: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(RoleCall::Remove {
            user_id,
            role_ref: role_ref.to_string(),
        });
        if state.failing.contains(role_ref) {
            return Err(RankError::Gateway(format!("角色 {} 不可用", role_ref)));
        }
        if let Some(roles) = state.roles.get_mut(&(guild_id, user_id)) {
            roles.remove(role_ref);
        }
        Ok(())
    }

    async fn member_roles(&self, guild_id: i64, user_id: i64) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        state.calls.push(RoleCall::Read { user_id });
        Ok(state
            .roles
            .get(&(guild_id, user_id))
            .map(|roles| roles.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// 组装好的内存测试环境
pub struct TestContext {
    pub provider: Arc<MemoryStoreProvider>,
    pub gateway: Arc<RecordingRoleGateway>,
    pub catalog: RankCatalog<MemoryStoreProvider>,
    pub points: PointsService<MemoryStoreProvider>,
    pub reconciler: ReconciliationService<MemoryStoreProvider>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(&CatalogConfig::default())
    }

    pub fn with_config(config: &CatalogConfig) -> Self {
        let provider = Arc::new(MemoryStoreProvider::new());
        let gateway = Arc::new(RecordingRoleGateway::new());
        let dyn_gateway: Arc<dyn RoleGateway> = gateway.clone();

        Self {
            catalog: RankCatalog::new(provider.clone(), dyn_gateway.clone(), config),
            points: PointsService::new(provider.clone(), dyn_gateway.clone()),
            reconciler: ReconciliationService::new(provider.clone(), dyn_gateway),
            provider,
            gateway,
        }
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// 测试用角色句柄
pub fn role_for(name: &str) -> String {
    format!("role-{}", name.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_rank(guild_id: i64, name: &str, points: i32) -> NewRank {
        NewRank {
            guild_id,
            name: name.to_string(),
            points_required: points,
            user_limit: -1,
            stackable: false,
            role_ref: None,
            color: None,
        }
    }

    #[tokio::test]
    async fn test_uncommitted_store_rolls_back() {
        let provider = MemoryStoreProvider::new();

        let mut store = provider.begin().await.unwrap();
        let rank = store.insert_rank(&new_rank(1, "Gold", 100)).await.unwrap();
        store.lock_member(1, 42).await.unwrap();
        store.lock_capacity(rank.id).await.unwrap();
        store.write_capacity(rank.id, 3).await.unwrap();
        drop(store);

        assert!(provider.rank(rank.id).is_none());
        assert!(provider.member(1, 42).is_none());
        assert!(!provider.counter_exists(rank.id));
    }

    #[tokio::test]
    async fn test_duplicate_threshold_rejected() {
        let provider = MemoryStoreProvider::new();
        let mut store = provider.begin().await.unwrap();
        store.insert_rank(&new_rank(1, "A", 100)).await.unwrap();

        let err = store.insert_rank(&new_rank(1, "B", 100)).await.unwrap_err();
        assert!(err.is_validation());
        // 不同公会互不影响
        assert!(store.insert_rank(&new_rank(2, "B", 100)).await.is_ok());
    }

    #[tokio::test]
    async fn test_row_lock_blocks_other_transactions_until_commit() {
        let provider = MemoryStoreProvider::new();
        let mut setup = provider.begin().await.unwrap();
        let rank = setup.insert_rank(&new_rank(1, "Gold", 100)).await.unwrap();
        setup.commit().await.unwrap();

        let mut first = provider.begin().await.unwrap();
        first.lock_capacity(rank.id).await.unwrap();
        // 同一事务内可重入
        first.lock_capacity(rank.id).await.unwrap();

        let contender = provider.clone();
        let rank_id = rank.id;
        let handle = tokio::spawn(async move {
            let mut second = contender.begin().await.unwrap();
            second.lock_capacity(rank_id).await.unwrap()
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        first.write_capacity(rank.id, 1).await.unwrap();
        first.commit().await.unwrap();

        assert_eq!(handle.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_recording_gateway_is_idempotent() {
        let gateway = RecordingRoleGateway::new();
        gateway.add_role(1, 2, "r").await.unwrap();
        gateway.add_role(1, 2, "r").await.unwrap();
        gateway.remove_role(1, 2, "missing").await.unwrap();

        assert_eq!(gateway.roles_of(1, 2).len(), 1);
        assert_eq!(gateway.mutation_calls().len(), 3);

        gateway.fail_role("r");
        assert!(gateway.remove_role(1, 2, "r").await.is_err());
        assert!(gateway.roles_of(1, 2).contains("r"));
    }
}
