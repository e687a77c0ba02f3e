//! Starling Engine - Identity Merge, Resolution, Netting and Fact Assembly
//!
//! Turns staging batches into an identity-resolved star schema: identity facts
//! are merged into the `user_identity_map` and `dim_user` SCD2 tables, staging
//! events are deduplicated and resolved to the canonical user valid at their
//! event time, payments are netted per appointment, and the resulting fact rows
//! are checked against the dimensions they reference.

pub mod assembler;
pub mod dedupe;
pub mod merge;
pub mod netting;
pub mod pipeline;
pub mod resolver;
pub mod validation;

pub use assembler::{assemble, FactSet};
pub use dedupe::{
    dedupe, dedupe_appointments, dedupe_payments, dedupe_sessions, payment_order,
};
pub use merge::{AbortedKey, IdentityMergeEngine, MergeCounts, MergeResult, RejectedFact};
pub use netting::{net, NetPosition, Netting, NettingLedger};
pub use pipeline::{Pipeline, PipelineRun, StagingBatch};
pub use resolver::{anonymous_for_device, anonymous_for_login, mint_canonical, IdentityResolver};
pub use validation::{
    interval_violations, netting_discrepancies, orphaned_references, validate,
    DiscrepancyKind, FactTable, IntervalViolation, NettingDiscrepancy, OrphanedReference,
    ReferenceTarget, ValidationReport,
};
