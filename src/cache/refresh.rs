//! Descriptor-driven cache refresh orchestrator.
//!
//! One orchestrator serves every cached entity type. Full rebuilds run on a
//! cron schedule and at startup, mutually excluded across processes by the
//! distributed lock. Incremental updates are driven by [`ChangeEvent`]s
//! drained from the in-process queue.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use metrics::counter;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::repos::{
    AssessmentsRepo, PapersRepo, QuestionResultsRepo, SessionsRepo, StudentsRepo,
};
use crate::domain::types::AssessmentKind;

use super::events::{ChangeEvent, EventKind, EventQueue};
use super::keys;
use super::store::{CacheError, LockOutcome, RedisStore};

/// Whether an entity type reacts to change events or only to full rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStrategy {
    FullOnly,
    FullAndIncremental,
}

impl RefreshStrategy {
    pub fn from_incremental(enabled: bool) -> Self {
        if enabled {
            Self::FullAndIncremental
        } else {
            Self::FullOnly
        }
    }

    fn incremental(self) -> bool {
        matches!(self, Self::FullAndIncremental)
    }
}

/// What one descriptor refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTarget {
    SessionInfo(AssessmentKind),
    SessionResults(AssessmentKind),
    UserIndexes(AssessmentKind),
    PaperBlobs,
    EmailList,
}

/// Declarative configuration of one refresh routine.
///
/// The namespace doubles as the lock name and the bulk-delete pattern base.
#[derive(Debug, Clone, Copy)]
pub struct RefreshDescriptor {
    pub name: &'static str,
    pub target: RefreshTarget,
    pub namespace: &'static str,
    pub ttl_seconds: u64,
    pub strategy: RefreshStrategy,
}

/// Runtime knobs shared by every descriptor.
#[derive(Debug, Clone, Copy)]
pub struct RefreshConfig {
    pub ttl_seconds: u64,
    pub lock_ttl_seconds: u64,
    pub strategy: RefreshStrategy,
    pub event_drain_batch: usize,
}

/// Dependent rows captured before a cascading delete commits.
#[derive(Debug, Clone)]
struct CapturedCascade {
    kind: AssessmentKind,
    sessions: Vec<(Uuid, Option<Uuid>)>,
}

pub struct CacheRefresher {
    store: RedisStore,
    sessions: Arc<dyn SessionsRepo>,
    results: Arc<dyn QuestionResultsRepo>,
    papers: Arc<dyn PapersRepo>,
    students: Arc<dyn StudentsRepo>,
    assessments: Arc<dyn AssessmentsRepo>,
    events: Arc<EventQueue>,
    config: RefreshConfig,
    pending_cascades: DashMap<Uuid, CapturedCascade>,
}

impl CacheRefresher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: RedisStore,
        sessions: Arc<dyn SessionsRepo>,
        results: Arc<dyn QuestionResultsRepo>,
        papers: Arc<dyn PapersRepo>,
        students: Arc<dyn StudentsRepo>,
        assessments: Arc<dyn AssessmentsRepo>,
        events: Arc<EventQueue>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            store,
            sessions,
            results,
            papers,
            students,
            assessments,
            events,
            config,
            pending_cascades: DashMap::new(),
        }
    }

    pub fn events(&self) -> &Arc<EventQueue> {
        &self.events
    }

    /// Every refresh routine this deployment runs, one per cached entity
    /// type.
    pub fn descriptors(&self) -> Vec<RefreshDescriptor> {
        let ttl = self.config.ttl_seconds;
        let strategy = self.config.strategy;
        vec![
            RefreshDescriptor {
                name: "practice_session_info",
                target: RefreshTarget::SessionInfo(AssessmentKind::Practice),
                namespace: keys::PRACTICE_SESSION_INFO_NS,
                ttl_seconds: ttl,
                strategy,
            },
            RefreshDescriptor {
                name: "exam_session_info",
                target: RefreshTarget::SessionInfo(AssessmentKind::Exam),
                namespace: keys::EXAM_SESSION_INFO_NS,
                ttl_seconds: ttl,
                strategy,
            },
            RefreshDescriptor {
                name: "practice_session_results",
                target: RefreshTarget::SessionResults(AssessmentKind::Practice),
                namespace: keys::PRACTICE_SESSION_NS,
                ttl_seconds: ttl,
                strategy,
            },
            RefreshDescriptor {
                name: "exam_session_results",
                target: RefreshTarget::SessionResults(AssessmentKind::Exam),
                namespace: keys::EXAM_SESSION_NS,
                ttl_seconds: ttl,
                strategy,
            },
            RefreshDescriptor {
                name: "user_practice_index",
                target: RefreshTarget::UserIndexes(AssessmentKind::Practice),
                namespace: keys::USER_PRACTICE_INDEX_PREFIX,
                ttl_seconds: ttl,
                strategy,
            },
            RefreshDescriptor {
                name: "user_exam_index",
                target: RefreshTarget::UserIndexes(AssessmentKind::Exam),
                namespace: keys::USER_EXAM_INDEX_PREFIX,
                ttl_seconds: ttl,
                strategy,
            },
            RefreshDescriptor {
                name: "paper_blobs",
                target: RefreshTarget::PaperBlobs,
                namespace: keys::PAPER_BLOB_NS,
                ttl_seconds: ttl,
                strategy,
            },
            RefreshDescriptor {
                name: "student_emails",
                target: RefreshTarget::EmailList,
                namespace: keys::EMAIL_LIST_KEY,
                ttl_seconds: ttl,
                strategy,
            },
        ]
    }

    /// Full rebuild of every descriptor. Failures are logged per descriptor
    /// so one entity type cannot starve the rest.
    pub async fn refresh_all(&self) {
        for descriptor in self.descriptors() {
            match self.refresh(&descriptor).await {
                Ok(true) => {
                    counter!("quaderno_cache_refresh_total", "descriptor" => descriptor.name, "result" => "ok")
                        .increment(1);
                }
                Ok(false) => {
                    counter!("quaderno_cache_refresh_total", "descriptor" => descriptor.name, "result" => "skipped")
                        .increment(1);
                }
                Err(err) => {
                    counter!("quaderno_cache_refresh_total", "descriptor" => descriptor.name, "result" => "error")
                        .increment(1);
                    warn!(
                        target = "cache::refresh::refresh_all",
                        descriptor = descriptor.name,
                        error = %err,
                        "refresh failed"
                    );
                }
            }
        }
    }

    /// Full rebuild of one descriptor under its distributed lock.
    ///
    /// Returns `false` when another process holds the lock; that is the
    /// expected outcome when instances share a schedule.
    pub async fn refresh(&self, descriptor: &RefreshDescriptor) -> Result<bool, CacheError> {
        let outcome = self
            .store
            .execute_with_lock(descriptor.namespace, self.config.lock_ttl_seconds, || {
                self.run_target(descriptor)
            })
            .await?;

        match outcome {
            LockOutcome::Completed(result) => {
                result?;
                info!(
                    target = "cache::refresh::refresh",
                    descriptor = descriptor.name,
                    "full refresh complete"
                );
                Ok(true)
            }
            LockOutcome::Skipped => Ok(false),
        }
    }

    async fn run_target(&self, descriptor: &RefreshDescriptor) -> Result<(), CacheError> {
        match descriptor.target {
            RefreshTarget::SessionInfo(kind) => {
                self.rebuild_session_info(kind, descriptor).await
            }
            RefreshTarget::SessionResults(kind) => {
                self.rebuild_session_results(kind, descriptor).await
            }
            RefreshTarget::UserIndexes(kind) => self.rebuild_user_indexes(kind, descriptor).await,
            RefreshTarget::PaperBlobs => self.rebuild_paper_blobs(descriptor).await,
            RefreshTarget::EmailList => self.rebuild_email_list(descriptor).await,
        }
    }

    async fn rebuild_session_info(
        &self,
        kind: AssessmentKind,
        descriptor: &RefreshDescriptor,
    ) -> Result<(), CacheError> {
        let infos = match self.sessions.list_session_infos(kind).await {
            Ok(infos) => infos,
            Err(err) => {
                warn!(
                    target = "cache::refresh::rebuild_session_info",
                    descriptor = descriptor.name,
                    error = %err,
                    "source fetch failed, keeping existing cache"
                );
                return Ok(());
            }
        };

        self.store
            .delete_keys_by_pattern(&keys::namespace_pattern(descriptor.namespace))
            .await?;

        let mut written = 0usize;
        for info in infos {
            match serde_json::to_value(&info) {
                Ok(Value::Object(obj)) => {
                    match self
                        .store
                        .set_flattened_object_to_hash(
                            descriptor.namespace,
                            &obj,
                            "id",
                            descriptor.ttl_seconds,
                        )
                        .await
                    {
                        Ok(true) => written += 1,
                        Ok(false) => {}
                        Err(err) => {
                            warn!(
                                target = "cache::refresh::rebuild_session_info",
                                session_id = %info.id,
                                error = %err,
                                "item caching failed, skipped"
                            );
                        }
                    }
                }
                _ => {
                    warn!(
                        target = "cache::refresh::rebuild_session_info",
                        session_id = %info.id,
                        "item failed to serialize, skipped"
                    );
                }
            }
        }

        debug!(
            target = "cache::refresh::rebuild_session_info",
            descriptor = descriptor.name,
            written,
            "session info hashes rebuilt"
        );
        Ok(())
    }

    async fn rebuild_session_results(
        &self,
        kind: AssessmentKind,
        descriptor: &RefreshDescriptor,
    ) -> Result<(), CacheError> {
        let sessions = match self.results.sessions_with_results(kind).await {
            Ok(sessions) => sessions,
            Err(err) => {
                warn!(
                    target = "cache::refresh::rebuild_session_results",
                    descriptor = descriptor.name,
                    error = %err,
                    "source fetch failed, keeping existing cache"
                );
                return Ok(());
            }
        };

        self.store
            .delete_keys_by_pattern(&keys::namespace_pattern(descriptor.namespace))
            .await?;

        let parents: Vec<Value> = sessions
            .iter()
            .filter_map(|session| serde_json::to_value(session).ok())
            .collect();

        let outcome = self
            .store
            .cache_nested_objects_to_hashes(
                descriptor.namespace,
                &parents,
                "id",
                "question_results",
                keys::QRESULT_NS,
                "id",
                descriptor.ttl_seconds,
            )
            .await?;

        debug!(
            target = "cache::refresh::rebuild_session_results",
            descriptor = descriptor.name,
            written = outcome.written,
            failed = outcome.failed,
            "nested result hashes rebuilt"
        );
        Ok(())
    }

    async fn rebuild_user_indexes(
        &self,
        kind: AssessmentKind,
        descriptor: &RefreshDescriptor,
    ) -> Result<(), CacheError> {
        let links = match self.sessions.session_user_links(kind).await {
            Ok(links) => links,
            Err(err) => {
                warn!(
                    target = "cache::refresh::rebuild_user_indexes",
                    descriptor = descriptor.name,
                    error = %err,
                    "source fetch failed, keeping existing cache"
                );
                return Ok(());
            }
        };

        let mut by_user: HashMap<Uuid, Vec<String>> = HashMap::new();
        for link in links {
            if let Some(user_id) = link.user_id {
                by_user
                    .entry(user_id)
                    .or_default()
                    .push(link.session_id.to_string());
            }
        }

        self.store
            .delete_keys_by_pattern(&keys::namespace_pattern(descriptor.namespace))
            .await?;

        let entries: Vec<(Uuid, Vec<String>)> = by_user.into_iter().collect();
        let outcome = self
            .store
            .rebuild_user_index_sets(descriptor.namespace, &entries, descriptor.ttl_seconds)
            .await?;

        debug!(
            target = "cache::refresh::rebuild_user_indexes",
            descriptor = descriptor.name,
            written = outcome.written,
            failed = outcome.failed,
            "reverse indexes rebuilt"
        );
        Ok(())
    }

    async fn rebuild_paper_blobs(&self, descriptor: &RefreshDescriptor) -> Result<(), CacheError> {
        let blobs = match self.papers.list_paper_blobs().await {
            Ok(blobs) => blobs,
            Err(err) => {
                warn!(
                    target = "cache::refresh::rebuild_paper_blobs",
                    error = %err,
                    "source fetch failed, keeping existing cache"
                );
                return Ok(());
            }
        };

        self.store
            .delete_keys_by_pattern(&keys::namespace_pattern(descriptor.namespace))
            .await?;

        let items: Vec<Value> = blobs
            .into_iter()
            .map(|blob| {
                serde_json::json!({
                    "id": blob.id.to_string(),
                    "content": blob.content,
                })
            })
            .collect();

        let outcome = self
            .store
            .set_items_to_cache(descriptor.namespace, &items, "id", descriptor.ttl_seconds)
            .await?;

        debug!(
            target = "cache::refresh::rebuild_paper_blobs",
            written = outcome.written,
            skipped = outcome.skipped,
            failed = outcome.failed,
            "paper blobs rebuilt"
        );
        Ok(())
    }

    async fn rebuild_email_list(&self, descriptor: &RefreshDescriptor) -> Result<(), CacheError> {
        let emails = match self.students.list_student_emails().await {
            Ok(emails) => emails,
            Err(err) => {
                warn!(
                    target = "cache::refresh::rebuild_email_list",
                    error = %err,
                    "source fetch failed, keeping existing cache"
                );
                return Ok(());
            }
        };

        self.store
            .update_list_cache(keys::EMAIL_LIST_KEY, &emails, descriptor.ttl_seconds)
            .await?;

        debug!(
            target = "cache::refresh::rebuild_email_list",
            count = emails.len(),
            "email list rebuilt"
        );
        Ok(())
    }

    // ========================================================================
    // Incremental updates
    // ========================================================================

    /// Drains pending change events and applies them.
    ///
    /// Called on a timer and opportunistically after write paths publish.
    pub async fn consume(&self) {
        let batch = self.events.drain(self.config.event_drain_batch);
        for event in batch {
            self.handle_event(&event).await;
        }
    }

    async fn handle_event(&self, event: &ChangeEvent) {
        if !self.config.strategy.incremental()
            && !matches!(event.kind, EventKind::WarmupOnStartup)
        {
            debug!(
                target = "cache::refresh::handle_event",
                event_id = %event.id,
                "incremental strategy disabled, event dropped"
            );
            return;
        }

        let result = match &event.kind {
            EventKind::SessionsCreated { kind, session_ids } => {
                self.apply_sessions_created(*kind, session_ids).await
            }
            EventKind::SessionsUpdated { kind, session_ids } => {
                self.apply_sessions_updated(*kind, session_ids).await
            }
            EventKind::SessionsDeleted { kind, session_ids } => {
                self.apply_sessions_deleted(*kind, session_ids).await
            }
            EventKind::SessionResultsChanged { kind, session_id } => {
                self.apply_session_results_changed(*kind, *session_id).await
            }
            EventKind::PapersUpserted { paper_ids } => self.apply_papers_upserted(paper_ids).await,
            EventKind::PapersDeleted { paper_ids } => self.apply_papers_deleted(paper_ids).await,
            EventKind::StudentsChanged => {
                let descriptor = RefreshDescriptor {
                    name: "student_emails",
                    target: RefreshTarget::EmailList,
                    namespace: keys::EMAIL_LIST_KEY,
                    ttl_seconds: self.config.ttl_seconds,
                    strategy: self.config.strategy,
                };
                self.rebuild_email_list(&descriptor).await
            }
            EventKind::WarmupOnStartup => {
                self.refresh_all().await;
                Ok(())
            }
        };

        if let Err(err) = result {
            warn!(
                target = "cache::refresh::handle_event",
                event_id = %event.id,
                event_kind = ?event.kind,
                error = %err,
                "incremental update failed, next full refresh will repair"
            );
        }
    }

    /// New sessions: cache their info hashes and grow the reverse indexes,
    /// no full rebuild.
    async fn apply_sessions_created(
        &self,
        kind: AssessmentKind,
        session_ids: &[Uuid],
    ) -> Result<(), CacheError> {
        self.overwrite_session_infos(kind, session_ids).await?;

        for session_id in session_ids {
            let link = match self.sessions.session_user_link(*session_id).await {
                Ok(link) => link,
                Err(err) => {
                    warn!(
                        target = "cache::refresh::apply_sessions_created",
                        session_id = %session_id,
                        error = %err,
                        "user link fetch failed, index not updated"
                    );
                    continue;
                }
            };
            if let Some(user_id) = link.and_then(|l| l.user_id) {
                self.store
                    .add_to_set(
                        &keys::index_key(keys::user_index_prefix(kind), user_id),
                        &session_id.to_string(),
                        self.config.ttl_seconds,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn apply_sessions_updated(
        &self,
        kind: AssessmentKind,
        session_ids: &[Uuid],
    ) -> Result<(), CacheError> {
        self.overwrite_session_infos(kind, session_ids).await
    }

    /// Deleted sessions: drop cache entries directly, the source rows are
    /// already gone.
    async fn apply_sessions_deleted(
        &self,
        kind: AssessmentKind,
        session_ids: &[Uuid],
    ) -> Result<(), CacheError> {
        for session_id in session_ids {
            let id = session_id.to_string();
            self.store
                .delete_key(&keys::item_key(keys::session_info_ns(kind), &id))
                .await?;
            self.store
                .delete_keys_by_pattern(&keys::children_pattern(
                    keys::session_parent_ns(kind),
                    &id,
                    keys::QRESULT_NS,
                ))
                .await?;
        }
        Ok(())
    }

    async fn apply_session_results_changed(
        &self,
        kind: AssessmentKind,
        session_id: Uuid,
    ) -> Result<(), CacheError> {
        let results = match self.results.list_for_session(session_id).await {
            Ok(results) => results,
            Err(err) => {
                warn!(
                    target = "cache::refresh::apply_session_results_changed",
                    session_id = %session_id,
                    error = %err,
                    "result fetch failed, cache left as is"
                );
                return Ok(());
            }
        };

        let parent = serde_json::json!({
            "id": session_id.to_string(),
            "question_results": results,
        });
        self.store
            .cache_nested_objects_to_hashes(
                keys::session_parent_ns(kind),
                std::slice::from_ref(&parent),
                "id",
                "question_results",
                keys::QRESULT_NS,
                "id",
                self.config.ttl_seconds,
            )
            .await?;
        Ok(())
    }

    async fn apply_papers_upserted(&self, paper_ids: &[Uuid]) -> Result<(), CacheError> {
        let blobs = match self.papers.paper_blobs_by_ids(paper_ids).await {
            Ok(blobs) => blobs,
            Err(err) => {
                warn!(
                    target = "cache::refresh::apply_papers_upserted",
                    error = %err,
                    "paper fetch failed, cache left as is"
                );
                return Ok(());
            }
        };
        let items: Vec<Value> = blobs
            .into_iter()
            .map(|blob| {
                serde_json::json!({
                    "id": blob.id.to_string(),
                    "content": blob.content,
                })
            })
            .collect();
        self.store
            .set_items_to_cache(keys::PAPER_BLOB_NS, &items, "id", self.config.ttl_seconds)
            .await?;
        Ok(())
    }

    async fn apply_papers_deleted(&self, paper_ids: &[Uuid]) -> Result<(), CacheError> {
        for paper_id in paper_ids {
            self.store
                .delete_key(&keys::item_key(keys::PAPER_BLOB_NS, &paper_id.to_string()))
                .await?;
        }
        Ok(())
    }

    async fn overwrite_session_infos(
        &self,
        kind: AssessmentKind,
        session_ids: &[Uuid],
    ) -> Result<(), CacheError> {
        let infos = match self.sessions.session_infos_by_ids(kind, session_ids).await {
            Ok(infos) => infos,
            Err(err) => {
                warn!(
                    target = "cache::refresh::overwrite_session_infos",
                    error = %err,
                    "session info fetch failed, cache left as is"
                );
                return Ok(());
            }
        };

        for info in infos {
            if let Ok(Value::Object(obj)) = serde_json::to_value(&info) {
                self.store
                    .set_flattened_object_to_hash(
                        keys::session_info_ns(kind),
                        &obj,
                        "id",
                        self.config.ttl_seconds,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Two-phase cascade cleanup
    // ========================================================================

    /// Phase one: capture the sessions an assessment delete will cascade
    /// over, before the delete commits. The data source will not emit
    /// per-row events for them.
    pub async fn prepare_assessment_delete(&self, assessment_id: Uuid) -> Result<(), CacheError> {
        let kind = match self.assessments.assessment(assessment_id).await {
            Ok(Some(assessment)) => assessment.kind,
            Ok(None) => return Ok(()),
            Err(err) => {
                warn!(
                    target = "cache::refresh::prepare_assessment_delete",
                    assessment_id = %assessment_id,
                    error = %err,
                    "assessment fetch failed, cascade not captured"
                );
                return Ok(());
            }
        };

        let links = match self
            .sessions
            .session_user_links_for_assessment(assessment_id)
            .await
        {
            Ok(links) => links,
            Err(err) => {
                warn!(
                    target = "cache::refresh::prepare_assessment_delete",
                    assessment_id = %assessment_id,
                    error = %err,
                    "dependent session query failed, cascade not captured"
                );
                return Ok(());
            }
        };

        let sessions: Vec<(Uuid, Option<Uuid>)> = links
            .into_iter()
            .map(|link| (link.session_id, link.user_id))
            .collect();

        info!(
            target = "cache::refresh::prepare_assessment_delete",
            assessment_id = %assessment_id,
            captured = sessions.len(),
            "cascade capture recorded"
        );
        self.pending_cascades
            .insert(assessment_id, CapturedCascade { kind, sessions });
        Ok(())
    }

    /// Phase two: after the delete is confirmed, remove the cache entries
    /// for every captured dependent.
    pub async fn complete_assessment_delete(&self, assessment_id: Uuid) -> Result<(), CacheError> {
        let Some((_, cascade)) = self.pending_cascades.remove(&assessment_id) else {
            debug!(
                target = "cache::refresh::complete_assessment_delete",
                assessment_id = %assessment_id,
                "no captured cascade, nothing to clean"
            );
            return Ok(());
        };

        for (session_id, user_id) in &cascade.sessions {
            let id = session_id.to_string();
            self.store
                .delete_key(&keys::item_key(keys::session_info_ns(cascade.kind), &id))
                .await?;
            self.store
                .delete_keys_by_pattern(&keys::children_pattern(
                    keys::session_parent_ns(cascade.kind),
                    &id,
                    keys::QRESULT_NS,
                ))
                .await?;
            if let Some(user_id) = user_id {
                self.store
                    .remove_from_set(
                        &keys::index_key(keys::user_index_prefix(cascade.kind), *user_id),
                        &id,
                        self.config.ttl_seconds,
                    )
                    .await?;
            }
        }

        info!(
            target = "cache::refresh::complete_assessment_delete",
            assessment_id = %assessment_id,
            cleaned = cascade.sessions.len(),
            "cascade cleanup complete"
        );
        Ok(())
    }

    /// Drops a capture whose delete never committed.
    pub fn abort_assessment_delete(&self, assessment_id: Uuid) {
        if self.pending_cascades.remove(&assessment_id).is_some() {
            debug!(
                target = "cache::refresh::abort_assessment_delete",
                assessment_id = %assessment_id,
                "cascade capture dropped"
            );
        }
    }
}
