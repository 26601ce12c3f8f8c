//! Tracker assignments and the replacement assigner.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pitchside_common::id::{prefix, prefixed_ulid};
use pitchside_common::protocol::{Assignment, AssignmentScope};

use crate::absence::AbsenceBook;
use crate::error::Result;
use crate::persist::Persistence;

/// Assignments retired and created by one transfer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transfer {
    pub retired: Vec<Assignment>,
    pub created: Vec<Assignment>,
}

/// Source of tracker identities and assignment state.
///
/// Backed by the storage layer in production and an in-memory list in tests.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Every identity with the tracker role.
    async fn tracker_pool(&self) -> Result<Vec<String>>;
    async fn active_assignments(&self, match_id: &str) -> Result<Vec<Assignment>>;
    /// Atomically retire `from`'s active assignments in the match and create
    /// equivalent ones for `to`.
    async fn transfer(&self, match_id: &str, from: &str, to: &str) -> Result<Transfer>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct StoreState {
    pool: Vec<String>,
    assignments: Vec<Assignment>,
}

pub struct MemoryAssignmentStore {
    state: Mutex<StoreState>,
}

impl MemoryAssignmentStore {
    pub fn new() -> Self {
        Self::with_pool(Vec::<String>::new())
    }

    pub fn with_pool<I, S>(pool: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Mutex::new(StoreState {
                pool: pool.into_iter().map(Into::into).collect(),
                assignments: Vec::new(),
            }),
        }
    }

    pub fn add_tracker(&self, tracker_id: impl Into<String>) {
        let tracker_id = tracker_id.into();
        let mut state = self.state.lock();
        if !state.pool.contains(&tracker_id) {
            state.pool.push(tracker_id);
        }
    }

    /// Give `tracker_id` the scope, retiring whoever held it.
    pub fn assign(&self, match_id: &str, tracker_id: &str, scope: AssignmentScope) -> Assignment {
        let mut state = self.state.lock();
        for existing in state
            .assignments
            .iter_mut()
            .filter(|a| a.active && a.match_id == match_id && a.scope == scope)
        {
            existing.active = false;
        }
        let assignment = Assignment {
            id: prefixed_ulid(prefix::ASSIGNMENT),
            match_id: match_id.to_string(),
            tracker_id: tracker_id.to_string(),
            scope,
            active: true,
            replaces: None,
        };
        state.assignments.push(assignment.clone());
        assignment
    }

    /// Every assignment ever made, retired ones included.
    pub fn all(&self) -> Vec<Assignment> {
        self.state.lock().assignments.clone()
    }
}

impl Default for MemoryAssignmentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssignmentStore for MemoryAssignmentStore {
    async fn tracker_pool(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().pool.clone())
    }

    async fn active_assignments(&self, match_id: &str) -> Result<Vec<Assignment>> {
        Ok(self
            .state
            .lock()
            .assignments
            .iter()
            .filter(|a| a.active && a.match_id == match_id)
            .cloned()
            .collect())
    }

    async fn transfer(&self, match_id: &str, from: &str, to: &str) -> Result<Transfer> {
        let mut state = self.state.lock();
        let mut transfer = Transfer::default();
        for existing in state
            .assignments
            .iter_mut()
            .filter(|a| a.active && a.match_id == match_id && a.tracker_id == from)
        {
            existing.active = false;
            transfer.retired.push(existing.clone());
        }
        for old in &transfer.retired {
            transfer.created.push(Assignment {
                id: prefixed_ulid(prefix::ASSIGNMENT),
                match_id: match_id.to_string(),
                tracker_id: to.to_string(),
                scope: old.scope.clone(),
                active: true,
                replaces: Some(old.id.clone()),
            });
        }
        state.assignments.extend(transfer.created.iter().cloned());
        Ok(transfer)
    }
}

// ---------------------------------------------------------------------------
// Replacement assigner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ReassignOutcome {
    Reassigned {
        absent_tracker_id: String,
        replacement_tracker_id: String,
        transfer: Transfer,
    },
    /// Nobody eligible; the absent tracker keeps its assignments.
    /// `first_notice` is set only on the first attempt for this absence.
    NoReplacement {
        absent_tracker_id: String,
        first_notice: bool,
    },
    /// The absence was already handled (replaced or back online).
    AlreadyResolved { absent_tracker_id: String },
    /// The tracker holds no active assignment, so there is nothing to move.
    NothingAssigned { absent_tracker_id: String },
    /// The tracker is not flagged absent.
    NotAbsent { absent_tracker_id: String },
}

pub struct ReplacementAssigner {
    store: Arc<dyn AssignmentStore>,
    persistence: Arc<dyn Persistence>,
    /// Serializes reassignments so a scan and a manual trigger cannot race.
    gate: tokio::sync::Mutex<()>,
}

impl ReplacementAssigner {
    pub fn new(store: Arc<dyn AssignmentStore>, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            store,
            persistence,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// First eligible tracker by identity: not the absent one, not holding an
    /// active assignment in the match, not flagged absent.
    pub async fn find_replacement(
        &self,
        absent_tracker_id: &str,
        match_id: &str,
        absent: &HashSet<String>,
    ) -> Result<Option<String>> {
        let active = self.store.active_assignments(match_id).await?;
        let pool = self.store.tracker_pool().await?;
        Ok(pick_replacement(pool, &active, absent_tracker_id, absent))
    }

    pub async fn reassign(
        &self,
        absent_tracker_id: &str,
        match_id: &str,
        book: &dyn AbsenceBook,
    ) -> Result<ReassignOutcome> {
        let _guard = self.gate.lock().await;
        let absent_tracker_id = absent_tracker_id.to_string();

        let Some(record) = book.absence(&absent_tracker_id) else {
            return Ok(ReassignOutcome::NotAbsent { absent_tracker_id });
        };
        if record.resolved {
            return Ok(ReassignOutcome::AlreadyResolved { absent_tracker_id });
        }

        let active = self.store.active_assignments(match_id).await?;
        if !active.iter().any(|a| a.tracker_id == absent_tracker_id) {
            book.mark_resolved(&absent_tracker_id);
            return Ok(ReassignOutcome::NothingAssigned { absent_tracker_id });
        }

        let pool = self.store.tracker_pool().await?;
        let absent = book.absent_trackers();
        let Some(replacement) = pick_replacement(pool, &active, &absent_tracker_id, &absent) else {
            let first_notice = book.note_no_replacement(&absent_tracker_id);
            if first_notice {
                tracing::warn!(tracker_id = %absent_tracker_id, %match_id, "no replacement tracker available");
            }
            return Ok(ReassignOutcome::NoReplacement {
                absent_tracker_id,
                first_notice,
            });
        };

        let transfer = self
            .store
            .transfer(match_id, &absent_tracker_id, &replacement)
            .await?;
        book.mark_replaced(&absent_tracker_id, &replacement);

        tracing::info!(
            absent = %absent_tracker_id,
            replacement = %replacement,
            moved = transfer.created.len(),
            "tracker reassigned"
        );

        for assignment in transfer.retired.iter().chain(transfer.created.iter()) {
            if let Err(err) = self.persistence.persist_assignment(assignment).await {
                tracing::error!(?err, assignment_id = %assignment.id, "failed to persist assignment");
            }
        }

        Ok(ReassignOutcome::Reassigned {
            absent_tracker_id,
            replacement_tracker_id: replacement,
            transfer,
        })
    }
}

fn pick_replacement(
    mut pool: Vec<String>,
    active: &[Assignment],
    absent_tracker_id: &str,
    absent: &HashSet<String>,
) -> Option<String> {
    let busy: HashSet<&str> = active.iter().map(|a| a.tracker_id.as_str()).collect();
    pool.sort();
    pool.dedup();
    pool.into_iter().find(|candidate| {
        candidate != absent_tracker_id
            && !busy.contains(candidate.as_str())
            && !absent.contains(candidate)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::absence::AbsenceDetector;
    use crate::persist::MemoryPersistence;
    use pitchside_common::protocol::{EventType, TeamSide};

    fn home_scope() -> AssignmentScope {
        AssignmentScope::Player {
            team_id: TeamSide::Home,
            player_id: None,
        }
    }

    fn setup(pool: &[&str]) -> (Arc<MemoryAssignmentStore>, Arc<MemoryPersistence>, ReplacementAssigner) {
        let store = Arc::new(MemoryAssignmentStore::with_pool(pool.iter().copied()));
        let persistence = Arc::new(MemoryPersistence::new());
        let assigner = ReplacementAssigner::new(store.clone(), persistence.clone());
        (store, persistence, assigner)
    }

    fn book_with_absent(ids: &[&str]) -> Mutex<AbsenceDetector> {
        let mut detector = AbsenceDetector::new(180_000, 3);
        for id in ids {
            detector.flag_departed(id, 0);
        }
        Mutex::new(detector)
    }

    #[test]
    fn pick_replacement_excludes_busy_absent_and_self() {
        let active = vec![Assignment {
            id: "a1".to_string(),
            match_id: "m1".to_string(),
            tracker_id: "t2".to_string(),
            scope: home_scope(),
            active: true,
            replaces: None,
        }];
        let absent: HashSet<String> = ["t1".to_string(), "t3".to_string()].into();
        let pool = vec!["t5", "t1", "t2", "t3", "t4"].into_iter().map(String::from).collect();

        assert_eq!(
            pick_replacement(pool, &active, "t1", &absent),
            Some("t4".to_string())
        );
    }

    #[test]
    fn pick_replacement_empty_pool() {
        assert_eq!(pick_replacement(Vec::new(), &[], "t1", &HashSet::new()), None);
    }

    #[tokio::test]
    async fn reassign_moves_assignment_to_idle_tracker() {
        let (store, persistence, assigner) = setup(&["t1", "t2"]);
        let original = store.assign("m1", "t1", home_scope());
        let book = book_with_absent(&["t1"]);

        let outcome = assigner.reassign("t1", "m1", &book).await.unwrap();
        let ReassignOutcome::Reassigned { replacement_tracker_id, transfer, .. } = outcome else {
            panic!("expected reassignment, got {outcome:?}");
        };
        assert_eq!(replacement_tracker_id, "t2");
        assert_eq!(transfer.retired.len(), 1);
        assert_eq!(transfer.created[0].replaces.as_deref(), Some(original.id.as_str()));

        let active = store.active_assignments("m1").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].tracker_id, "t2");
        assert_eq!(active[0].scope, home_scope());

        // Retired and created copies both persisted.
        assert_eq!(persistence.assignments().len(), 2);
        assert!(book.absence("t1").unwrap().resolved);
    }

    #[tokio::test]
    async fn reassign_twice_is_a_noop() {
        let (store, _, assigner) = setup(&["t1", "t2", "t3"]);
        store.assign("m1", "t1", home_scope());
        let book = book_with_absent(&["t1"]);

        assigner.reassign("t1", "m1", &book).await.unwrap();
        let before = store.all();
        let second = assigner.reassign("t1", "m1", &book).await.unwrap();

        assert!(matches!(second, ReassignOutcome::AlreadyResolved { .. }));
        assert_eq!(store.all(), before);
    }

    #[tokio::test]
    async fn no_replacement_keeps_assignment_and_notifies_once() {
        let (store, _, assigner) = setup(&["t1"]);
        let original = store.assign("m1", "t1", home_scope());
        let book = book_with_absent(&["t1"]);

        let first = assigner.reassign("t1", "m1", &book).await.unwrap();
        assert_eq!(
            first,
            ReassignOutcome::NoReplacement {
                absent_tracker_id: "t1".to_string(),
                first_notice: true
            }
        );
        let second = assigner.reassign("t1", "m1", &book).await.unwrap();
        assert!(matches!(second, ReassignOutcome::NoReplacement { first_notice: false, .. }));

        let active = store.active_assignments("m1").await.unwrap();
        assert_eq!(active, vec![original]);
        assert!(!book.absence("t1").unwrap().resolved);
    }

    #[tokio::test]
    async fn busy_and_absent_trackers_are_never_chosen() {
        let (store, _, assigner) = setup(&["t1", "t2", "t3"]);
        store.assign("m1", "t1", home_scope());
        store.assign(
            "m1",
            "t2",
            AssignmentScope::General {
                event_types: vec![EventType::Pass],
            },
        );
        let book = book_with_absent(&["t1", "t3"]);

        let outcome = assigner.reassign("t1", "m1", &book).await.unwrap();
        assert!(matches!(outcome, ReassignOutcome::NoReplacement { .. }));
        assert_eq!(
            assigner
                .find_replacement("t1", "m1", &book.absent_trackers())
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn assignment_in_another_match_does_not_make_tracker_busy() {
        let (store, _, assigner) = setup(&["t1", "t2"]);
        store.assign("m1", "t1", home_scope());
        store.assign("m2", "t2", home_scope());
        let book = book_with_absent(&["t1"]);

        let found = assigner
            .find_replacement("t1", "m1", &book.absent_trackers())
            .await
            .unwrap();
        assert_eq!(found.as_deref(), Some("t2"));
    }

    #[tokio::test]
    async fn tracker_without_assignments_resolves_without_moving() {
        let (store, _, assigner) = setup(&["t1", "t2"]);
        let book = book_with_absent(&["t1"]);

        let outcome = assigner.reassign("t1", "m1", &book).await.unwrap();
        assert!(matches!(outcome, ReassignOutcome::NothingAssigned { .. }));
        assert!(store.all().is_empty());
        assert!(book.absence("t1").unwrap().resolved);
    }

    #[tokio::test]
    async fn reassign_for_unflagged_tracker_is_rejected() {
        let (store, _, assigner) = setup(&["t1", "t2"]);
        store.assign("m1", "t1", home_scope());
        let book = book_with_absent(&[]);

        let outcome = assigner.reassign("t1", "m1", &book).await.unwrap();
        assert!(matches!(outcome, ReassignOutcome::NotAbsent { .. }));
        assert_eq!(store.active_assignments("m1").await.unwrap()[0].tracker_id, "t1");
    }

    #[tokio::test]
    async fn persistence_failure_does_not_roll_back() {
        let (store, persistence, assigner) = setup(&["t1", "t2"]);
        store.assign("m1", "t1", home_scope());
        persistence.set_failing(true);
        let book = book_with_absent(&["t1"]);

        let outcome = assigner.reassign("t1", "m1", &book).await.unwrap();
        assert!(matches!(outcome, ReassignOutcome::Reassigned { .. }));
        assert_eq!(store.active_assignments("m1").await.unwrap()[0].tracker_id, "t2");
    }

    #[test]
    fn assign_retires_previous_holder_of_same_scope() {
        let store = MemoryAssignmentStore::with_pool(["t1", "t2"]);
        store.assign("m1", "t1", home_scope());
        store.assign("m1", "t2", home_scope());

        let all = store.all();
        assert_eq!(all.iter().filter(|a| a.active).count(), 1);
        assert_eq!(all.iter().find(|a| a.active).unwrap().tracker_id, "t2");
    }
}
