//! Robot groups: shared working memory across cooperating robots.
//!
//! Every member mirrors the same set of node ids in its own working
//! memory, converged through the store's pub/sub channel. Members hold
//! `active` or `passive` roles; a failover promotes the first passive. A
//! member whose subscription lapses marks itself out of sync and heals on
//! the next `sync_all`.

use crate::error::{Error, Result};
use crate::long_term::{LongTermMemory, RecallOptions};
use crate::store::Store;
use crate::types::{ActiveFilter, Metadata, SearchHit};
use crate::working_memory::WorkingMemory;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Channel name prefix; the full channel is `htm.group.<group_name>`.
pub const GROUP_CHANNEL_PREFIX: &str = "htm.group.";

/// Membership role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    /// Serves group recalls and may originate writes.
    Active,
    /// Mirrors the shared set, promotable on failover.
    Passive,
    /// No longer synchronized.
    Left,
}

/// Operation carried by a group event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupOp {
    /// A node entered the shared working memory.
    Added,
    /// A node left the shared working memory.
    Removed,
}

/// Wire payload published on the group channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEvent {
    /// Affected node.
    pub node_id: i64,
    /// What happened.
    pub op: GroupOp,
    /// Publishing member instance, so members skip their own events.
    pub origin: Uuid,
}

/// Snapshot returned by [`RobotGroup::status`].
#[derive(Debug, Clone, PartialEq)]
pub struct GroupStatus {
    /// Names of active members.
    pub active: Vec<String>,
    /// Names of passive members.
    pub passive: Vec<String>,
    /// All members not in `left`.
    pub total_members: usize,
    /// Whether every active member mirrors the shared set.
    pub in_sync: bool,
    /// Tokens held by the canonical shared set.
    pub working_memory_tokens: usize,
    /// `working_memory_tokens / max_tokens`.
    pub token_utilization: f32,
}

struct Member {
    robot_id: i64,
    name: String,
    role: MemberRole,
    instance: Uuid,
    working_memory: Arc<WorkingMemory>,
    out_of_sync: Arc<AtomicBool>,
    listener: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for Member {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

/// A set of robots sharing a live working-memory view.
pub struct RobotGroup {
    name: String,
    channel: String,
    ltm: LongTermMemory,
    store: Arc<dyn Store>,
    max_tokens: usize,
    members: RwLock<Vec<Member>>,
}

impl RobotGroup {
    /// Create a group and join the initial members.
    pub async fn create(
        name: &str,
        ltm: LongTermMemory,
        initial_active: &[&str],
        initial_passive: &[&str],
        max_tokens: usize,
    ) -> Result<Self> {
        let store = Arc::clone(ltm.store());
        let group = Self {
            name: name.to_string(),
            channel: format!("{GROUP_CHANNEL_PREFIX}{name}"),
            ltm,
            store,
            max_tokens,
            members: RwLock::new(Vec::new()),
        };
        for member in initial_active {
            group.join(member, MemberRole::Active).await?;
        }
        for member in initial_passive {
            group.join(member, MemberRole::Passive).await?;
        }
        info!(group = %group.name, "robot group created");
        Ok(group)
    }

    /// Group name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channel this group synchronizes over.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Add an active member.
    pub async fn add_active(&self, robot_name: &str) -> Result<()> {
        self.join(robot_name, MemberRole::Active).await
    }

    /// Add a passive member.
    pub async fn add_passive(&self, robot_name: &str) -> Result<()> {
        self.join(robot_name, MemberRole::Passive).await
    }

    async fn join(&self, robot_name: &str, role: MemberRole) -> Result<()> {
        {
            let mut members = self.members.write().await;
            if let Some(idx) = members.iter().position(|m| m.name == robot_name) {
                if members[idx].role != MemberRole::Left {
                    members[idx].role = role;
                    return Ok(());
                }
                // Rejoining from `left` needs a fresh subscription; drop the
                // stale entry and fall through to a full join.
                members.remove(idx);
            }
        }

        let robot = self.store.upsert_robot(robot_name).await?;
        let working_memory = Arc::new(WorkingMemory::new(self.max_tokens));
        let out_of_sync = Arc::new(AtomicBool::new(false));
        let instance = Uuid::new_v4();

        let listener = self
            .spawn_listener(robot.id, instance, Arc::clone(&working_memory), Arc::clone(&out_of_sync))
            .await?;

        let mut members = self.members.write().await;
        members.push(Member {
            robot_id: robot.id,
            name: robot_name.to_string(),
            role,
            instance,
            working_memory,
            out_of_sync,
            listener: Some(listener),
        });
        debug!(group = %self.name, robot = robot_name, ?role, "member joined");
        Ok(())
    }

    async fn spawn_listener(
        &self,
        robot_id: i64,
        instance: Uuid,
        working_memory: Arc<WorkingMemory>,
        out_of_sync: Arc<AtomicBool>,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let mut stream = self.store.subscribe(&self.channel).await?;
        let store = Arc::clone(&self.store);
        let channel = self.channel.clone();

        Ok(tokio::spawn(async move {
            while let Some(payload) = stream.recv().await {
                let event: GroupEvent = match serde_json::from_str(&payload) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "malformed group event, skipping");
                        continue;
                    }
                };
                if event.origin == instance {
                    continue;
                }
                match event.op {
                    GroupOp::Added => {
                        let node = match store.node_by_id(event.node_id, ActiveFilter::Active).await
                        {
                            Ok(Some(node)) => node,
                            Ok(None) => continue,
                            Err(e) => {
                                warn!(error = %e, "failed to load replicated node");
                                continue;
                            }
                        };
                        let evicted = working_memory.add(
                            node.id,
                            node.content,
                            node.token_count,
                            1.0,
                            true,
                        );
                        let _ = store.set_in_working_memory(robot_id, node.id, true).await;
                        for evicted_id in evicted {
                            let _ = store
                                .set_in_working_memory(robot_id, evicted_id, false)
                                .await;
                        }
                    }
                    GroupOp::Removed => {
                        working_memory.remove(event.node_id);
                        let _ = store
                            .set_in_working_memory(robot_id, event.node_id, false)
                            .await;
                    }
                }
            }
            // The subscription lapsed: replay is gone, so flag for sync_all
            out_of_sync.store(true, Ordering::Release);
        }))
    }

    /// Remember through a member and replicate to the rest of the group.
    ///
    /// The originator must be an active member. Returns the node id.
    pub async fn remember(
        &self,
        content: &str,
        originator: &str,
        tags: &[String],
        metadata: Option<Metadata>,
    ) -> Result<i64> {
        let (robot_id, instance, working_memory) = {
            let members = self.members.read().await;
            let member = members
                .iter()
                .find(|m| m.name == originator && m.role == MemberRole::Active)
                .ok_or_else(|| {
                    Error::Validation(format!("{originator:?} is not an active member"))
                })?;
            (
                member.robot_id,
                member.instance,
                Arc::clone(&member.working_memory),
            )
        };

        let node = self.ltm.remember(robot_id, content, tags, metadata).await?;
        let evicted = working_memory.add(node.id, node.content.clone(), node.token_count, 1.0, false);
        for evicted_id in evicted {
            self.store
                .set_in_working_memory(robot_id, evicted_id, false)
                .await?;
        }

        let event = GroupEvent {
            node_id: node.id,
            op: GroupOp::Added,
            origin: instance,
        };
        self.store
            .notify(&self.channel, &serde_json::to_string(&event)?)
            .await?;
        Ok(node.id)
    }

    /// Recall over the shared store as the group's representative.
    ///
    /// Results are identical regardless of which active member asks.
    pub async fn recall(&self, query: &str, options: &RecallOptions) -> Result<Vec<SearchHit>> {
        let members = self.members.read().await;
        if !members.iter().any(|m| m.role == MemberRole::Active) {
            return Err(Error::Validation(format!(
                "group {:?} has no active members",
                self.name
            )));
        }
        drop(members);
        self.ltm.recall(query, options).await
    }

    /// Force-push the canonical shared set into every member's cache.
    ///
    /// Reconciles any events missed while a subscription was down.
    pub async fn sync_all(&self) -> Result<()> {
        let shared = self.shared_node_ids().await?;
        let mut nodes = Vec::with_capacity(shared.len());
        for node_id in &shared {
            if let Some(node) = self.store.node_by_id(*node_id, ActiveFilter::Active).await? {
                nodes.push(node);
            }
        }

        let members = self.members.read().await;
        for member in members.iter().filter(|m| m.role != MemberRole::Left) {
            member.working_memory.clear();
            for node in &nodes {
                let evicted = member.working_memory.add(
                    node.id,
                    node.content.clone(),
                    node.token_count,
                    1.0,
                    true,
                );
                self.store
                    .set_in_working_memory(member.robot_id, node.id, true)
                    .await?;
                for evicted_id in evicted {
                    self.store
                        .set_in_working_memory(member.robot_id, evicted_id, false)
                        .await?;
                }
            }
            member.out_of_sync.store(false, Ordering::Release);
        }
        debug!(group = %self.name, nodes = nodes.len(), "sync_all complete");
        Ok(())
    }

    /// Promote a passive member to active.
    pub async fn promote(&self, robot_name: &str) -> Result<()> {
        let mut members = self.members.write().await;
        let member = members
            .iter_mut()
            .find(|m| m.name == robot_name && m.role != MemberRole::Left)
            .ok_or_else(|| Error::NotFound(format!("group member {robot_name}")))?;
        member.role = MemberRole::Active;
        Ok(())
    }

    /// Promote the first passive member to active, demoting current actives.
    ///
    /// Returns the promoted member's name.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] when the group has no passive members.
    pub async fn failover(&self) -> Result<String> {
        let mut members = self.members.write().await;
        let promoted = members
            .iter()
            .position(|m| m.role == MemberRole::Passive)
            .ok_or_else(|| {
                Error::Validation(format!("group {:?} has no passive members", self.name))
            })?;

        for member in members.iter_mut() {
            if member.role == MemberRole::Active {
                member.role = MemberRole::Passive;
            }
        }
        members[promoted].role = MemberRole::Active;
        let name = members[promoted].name.clone();
        info!(group = %self.name, promoted = %name, "failover");
        Ok(name)
    }

    /// Remove a member; it stops synchronizing.
    pub async fn remove(&self, robot_name: &str) -> Result<()> {
        let mut members = self.members.write().await;
        let member = members
            .iter_mut()
            .find(|m| m.name == robot_name)
            .ok_or_else(|| Error::NotFound(format!("group member {robot_name}")))?;
        member.role = MemberRole::Left;
        if let Some(listener) = member.listener.take() {
            listener.abort();
        }
        member.working_memory.clear();
        Ok(())
    }

    /// The working memory mirrored by a member, for inspection.
    pub async fn member_working_memory(&self, robot_name: &str) -> Result<Arc<WorkingMemory>> {
        let members = self.members.read().await;
        members
            .iter()
            .find(|m| m.name == robot_name)
            .map(|m| Arc::clone(&m.working_memory))
            .ok_or_else(|| Error::NotFound(format!("group member {robot_name}")))
    }

    /// Group health snapshot.
    pub async fn status(&self) -> Result<GroupStatus> {
        let shared = self.shared_node_ids().await?;
        let mut working_memory_tokens = 0usize;
        for node_id in &shared {
            if let Some(node) = self.store.node_by_id(*node_id, ActiveFilter::Active).await? {
                working_memory_tokens += node.token_count;
            }
        }

        let members = self.members.read().await;
        let mut active = Vec::new();
        let mut passive = Vec::new();
        let mut in_sync = true;
        for member in members.iter() {
            match member.role {
                MemberRole::Active => {
                    active.push(member.name.clone());
                    if member.out_of_sync.load(Ordering::Acquire)
                        || member.working_memory.node_ids() != shared
                    {
                        in_sync = false;
                    }
                }
                MemberRole::Passive => passive.push(member.name.clone()),
                MemberRole::Left => {}
            }
        }

        let total_members = active.len() + passive.len();
        Ok(GroupStatus {
            active,
            passive,
            total_members,
            in_sync,
            working_memory_tokens,
            token_utilization: if self.max_tokens == 0 {
                0.0
            } else {
                working_memory_tokens as f32 / self.max_tokens as f32
            },
        })
    }

    /// The canonical shared set: every member's flagged node ids, sorted.
    async fn shared_node_ids(&self) -> Result<Vec<i64>> {
        let robot_ids: Vec<i64> = {
            let members = self.members.read().await;
            members
                .iter()
                .filter(|m| m.role != MemberRole::Left)
                .map(|m| m.robot_id)
                .collect()
        };
        self.store.working_memory_node_ids(&robot_ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HtmConfig, JobBackend};
    use crate::job::{Enricher, InlineRunner, JobRunner};
    use crate::provider::testing::{HashEmbedder, SilentTagger};
    use crate::provider::{EmbeddingService, HeuristicCounter, TagService};
    use crate::store::memory::MemoryStore;
    use crate::tag::TagIndex;
    use std::time::Duration;

    async fn group_fixture(active: &[&str], passive: &[&str]) -> RobotGroup {
        let config = Arc::new(
            HtmConfig::builder()
                .embedder(Arc::new(HashEmbedder))
                .tag_extractor(Arc::new(SilentTagger))
                .token_counter(Arc::new(HeuristicCounter))
                .job_backend(JobBackend::Inline)
                .build()
                .unwrap(),
        );
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let enricher = Enricher::new(
            Arc::clone(&store),
            EmbeddingService::new(&config),
            TagService::new(&config),
            TagIndex::new(
                Arc::clone(&store),
                config.max_tag_depth,
                config.tag_ontology_sample_size,
            ),
        );
        let runner: Arc<dyn JobRunner> = Arc::new(InlineRunner::new(enricher));
        let ltm = LongTermMemory::new(store, config, runner);
        RobotGroup::create("ops", ltm, active, passive, 10_000)
            .await
            .unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within timeout");
    }

    #[tokio::test]
    async fn remember_replicates_to_other_members() {
        let group = group_fixture(&["alpha"], &["beta"]).await;
        let node_id = group
            .remember("shared plan", "alpha", &[], None)
            .await
            .unwrap();

        let beta = group.member_working_memory("beta").await.unwrap();
        wait_until(|| beta.contains(node_id)).await;

        let alpha = group.member_working_memory("alpha").await.unwrap();
        assert!(alpha.contains(node_id));
    }

    #[tokio::test]
    async fn passive_members_cannot_originate() {
        let group = group_fixture(&["alpha"], &["beta"]).await;
        let err = group
            .remember("from the wrong seat", "beta", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn failover_promotes_first_passive() {
        let group = group_fixture(&["alpha"], &["beta", "gamma"]).await;
        let node_id = group.remember("plan", "alpha", &[], None).await.unwrap();

        let beta = group.member_working_memory("beta").await.unwrap();
        wait_until(|| beta.contains(node_id)).await;

        let promoted = group.failover().await.unwrap();
        assert_eq!(promoted, "beta");

        let status = group.status().await.unwrap();
        assert_eq!(status.active, vec!["beta".to_string()]);
        assert!(status.passive.contains(&"alpha".to_string()));
        assert!(status.in_sync);
        assert!(beta.contains(node_id));
    }

    #[tokio::test]
    async fn failover_without_passives_fails() {
        let group = group_fixture(&["alpha"], &[]).await;
        assert!(matches!(group.failover().await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn sync_all_reconciles_a_fresh_member() {
        let group = group_fixture(&["alpha"], &[]).await;
        let node_id = group.remember("early fact", "alpha", &[], None).await.unwrap();

        // gamma joins after the event was published, so it missed it
        group.add_passive("gamma").await.unwrap();
        let gamma = group.member_working_memory("gamma").await.unwrap();
        assert!(!gamma.contains(node_id));

        group.sync_all().await.unwrap();
        assert!(gamma.contains(node_id));
    }

    #[tokio::test]
    async fn removed_members_stop_synchronizing() {
        let group = group_fixture(&["alpha"], &["beta"]).await;
        group.remove("beta").await.unwrap();

        let node_id = group.remember("after removal", "alpha", &[], None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let beta = group.member_working_memory("beta").await.unwrap();
        assert!(!beta.contains(node_id));

        let status = group.status().await.unwrap();
        assert_eq!(status.total_members, 1);
    }

    #[tokio::test]
    async fn group_recall_requires_an_active_member() {
        let group = group_fixture(&["alpha"], &["beta"]).await;
        group.remember("searchable plan", "alpha", &[], None).await.unwrap();

        let hits = group
            .recall("searchable plan", &RecallOptions::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        group.remove("alpha").await.unwrap();
        // beta is passive; nobody can represent the group
        assert!(matches!(
            group.recall("searchable plan", &RecallOptions::default()).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn status_reports_token_utilization() {
        let group = group_fixture(&["alpha"], &[]).await;
        group.remember("0123456789abcdef", "alpha", &[], None).await.unwrap();

        let status = group.status().await.unwrap();
        assert_eq!(status.working_memory_tokens, 4);
        assert!(status.token_utilization > 0.0);
        assert!(status.in_sync);
    }
}
