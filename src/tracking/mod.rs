// ============================================================================
// Change Tracking
// ============================================================================
//
// `ChangeTracker` implements the persistence hooks and folds every observed
// effect into the ledger bound to the running scope. `ModelIndex` limits
// tracking to registered entity types.
//
// ============================================================================

pub mod ledger;
pub mod registry;
pub mod tracker;

pub use ledger::{EntityDiff, MutationLedger, RelationshipChange};
pub use registry::{ModelIndex, RegisteredModel};
pub use tracker::{ChangeCallback, ChangeTracker};
