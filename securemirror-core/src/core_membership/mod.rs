/*
    core_membership - Cross-principal membership propagation

    - queue: pending membership entries under /users/{id}/dataQueue
    - updater: writes after add/remove/update fan out into indexes and queues
    - reconciler: drains a principal's queue into its personal index
*/

pub mod queue;
pub mod reconciler;
pub mod updater;

pub use queue::{PendingQueueEntry, QueueWrite};
pub use reconciler::{DrainReport, UserQueueReconciler};
pub use updater::{MembershipAction, MembershipReport, UsersMembershipUpdater};
