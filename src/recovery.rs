//! # Crash Recovery
//!
//! Decides what a brook's true tail is after an append died mid-flight,
//! and repairs the documents to match.
//!
//! A pending-head marker is the whole crash protocol: it exists exactly
//! while an append is between "staged" and "committed". Finding one means
//! inspecting which of the batch's event documents actually landed:
//!
//! ```text
//! pending { original, target }, events observed in [original, target)
//!
//!   all landed ──► the batch was durable; finish the commit
//!   some landed ─► half a batch is garbage; delete it, keep head at original
//!   none landed ─► nothing happened; just clear the marker
//! ```
//!
//! Both outcomes converge on a brook a writer can append to, and both are
//! idempotent: a second crash during repair re-runs the same decision.
//!
//! The decision itself is a pure function ([`reconcile`]) over values read
//! from the store; [`BrookRecovery`] wires it to the repository and applies
//! the resulting actions. Every append runs this before staging, so repair
//! needs no background process.

use std::collections::BTreeSet;

use log::warn;

use crate::error::Result;
use crate::repository::{BrookRepository, PendingHeadDocument};
use crate::types::{BrookKey, BrookPosition};

// =============================================================================
// Reconciliation Plan
// =============================================================================

/// One repair step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Upsert the head to `position` and clear the pending marker.
    CommitHead { position: BrookPosition },
    /// Delete the orphaned event document at `position`.
    DeleteEvent { position: BrookPosition },
    /// Clear the pending marker, leaving the head untouched.
    DeletePendingHead,
}

/// Outcome of [`reconcile`]: the brook's true tail plus the repairs that
/// make the documents agree with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub position: BrookPosition,
    pub actions: Vec<RecoveryAction>,
}

impl Reconciliation {
    fn clean(position: BrookPosition) -> Self {
        Self {
            position,
            actions: Vec::new(),
        }
    }
}

/// Decides the true tail from the committed head, the pending marker, and
/// the event positions observed in the marker's window.
///
/// `observed` must be the existing positions in `[pending.original,
/// pending.target)`. The committed head is authoritative: a marker whose
/// target the head has already reached or passed is leftover cleanup, never
/// a reason to move the head back.
pub fn reconcile(
    head: BrookPosition,
    pending: Option<&PendingHeadDocument>,
    observed: &BTreeSet<BrookPosition>,
) -> Reconciliation {
    let Some(pending) = pending else {
        return Reconciliation::clean(head);
    };

    if head >= pending.target {
        return Reconciliation {
            position: head,
            actions: vec![RecoveryAction::DeletePendingHead],
        };
    }

    let expected = pending.target.distance_from(pending.original);
    if observed.len() as u64 == expected {
        // Every event of the interrupted batch is durable; the append only
        // missed its head commit.
        return Reconciliation {
            position: pending.target,
            actions: vec![RecoveryAction::CommitHead {
                position: pending.target,
            }],
        };
    }

    // A partial batch rolls back. An empty window needs no event deletes.
    let mut actions: Vec<RecoveryAction> = observed
        .iter()
        .map(|&position| RecoveryAction::DeleteEvent { position })
        .collect();
    actions.push(RecoveryAction::DeletePendingHead);
    Reconciliation {
        position: pending.original,
        actions,
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Reads a brook's recovery inputs, plans, and repairs.
#[derive(Clone)]
pub struct BrookRecovery {
    repository: BrookRepository,
}

impl BrookRecovery {
    pub fn new(repository: BrookRepository) -> Self {
        Self { repository }
    }

    /// The brook's true tail, repairing any interrupted append on the way.
    ///
    /// The caller must hold the brook's writer lock; repair mutates
    /// documents. Clean brooks take the fast path: one head read, one
    /// pending read, no event scan.
    pub async fn get_or_recover_position(&self, key: &BrookKey) -> Result<BrookPosition> {
        let head = self.repository.head_position(key).await?;
        let pending = self.repository.get_pending_head_document(key).await?;

        let Some(pending) = pending else {
            return Ok(head);
        };

        let observed = self
            .repository
            .get_existing_event_positions(key, pending.original, pending.target)
            .await?;
        let plan = reconcile(head, Some(&pending), &observed);
        self.log_plan(key, head, &pending, observed.len(), &plan);

        for action in &plan.actions {
            match *action {
                RecoveryAction::CommitHead { position } => {
                    self.repository.commit_head_position(key, position).await?;
                }
                RecoveryAction::DeleteEvent { position } => {
                    self.repository.delete_event(key, position).await?;
                }
                RecoveryAction::DeletePendingHead => {
                    self.repository.delete_pending_head(key).await?;
                }
            }
        }
        Ok(plan.position)
    }

    fn log_plan(
        &self,
        key: &BrookKey,
        head: BrookPosition,
        pending: &PendingHeadDocument,
        landed: usize,
        plan: &Reconciliation,
    ) {
        let expected = pending.target.distance_from(pending.original);
        if head >= pending.target {
            warn!(
                "brook '{key}': pending marker at or behind committed head {head}; clearing it"
            );
        } else if plan.position == pending.target {
            warn!(
                "brook '{key}': interrupted append left all {expected} events durable; \
                 committing head {} -> {}",
                pending.original, pending.target
            );
        } else {
            warn!(
                "brook '{key}': rolling back interrupted append ({landed}/{expected} events \
                 landed); head stays at {}",
                pending.original
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
