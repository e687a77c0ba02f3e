//! One staging batch end to end.
//!
//! Type-1 dimensions are upserted and identity facts merged first; every later
//! step reads a single snapshot taken after the merge.

use crate::assembler::{assemble, FactSet};
use crate::merge::{IdentityMergeEngine, MergeResult};
use crate::validation::{validate, ValidationReport};
use serde::{Deserialize, Serialize};
use starling_core::{
    AppointmentRecord, EngineConfig, IdentityFact, InsurancePlanRecord, PaymentRecord,
    ProviderRecord, RecordError, RecordRef, SessionRecord, StarlingResult,
};
use starling_storage::DimensionStore;

/// Staging rows delivered together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagingBatch {
    pub identity_facts: Vec<IdentityFact>,
    pub sessions: Vec<SessionRecord>,
    pub appointments: Vec<AppointmentRecord>,
    pub payments: Vec<PaymentRecord>,
    pub providers: Vec<ProviderRecord>,
    pub insurance_plans: Vec<InsurancePlanRecord>,
}

/// Everything one [`Pipeline::run`] produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub merge: MergeResult,
    pub facts: FactSet,
    pub report: ValidationReport,
    /// Provider and insurance plan rows that were not upserted.
    pub rejected_dimensions: Vec<RecordError>,
}

#[derive(Debug)]
pub struct Pipeline<S: DimensionStore> {
    store: S,
    config: EngineConfig,
}

impl<S: DimensionStore> Pipeline<S> {
    pub fn new(store: S, config: EngineConfig) -> StarlingResult<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn run(&self, batch: &StagingBatch) -> StarlingResult<PipelineRun> {
        let rejected_dimensions = self.upsert_dimensions(batch)?;

        let merge = IdentityMergeEngine::new(&self.store, &self.config)
            .apply_batch(&batch.identity_facts)?;

        let snapshot = self.store.snapshot()?;
        let facts = assemble(
            &snapshot,
            &self.config,
            &batch.sessions,
            &batch.appointments,
            &batch.payments,
        )?;
        let report = validate(&snapshot, &facts, &self.config);

        tracing::info!(
            identity_facts = batch.identity_facts.len(),
            versions_opened = merge.versions_opened(),
            versions_closed = merge.versions_closed(),
            merge_rejected = merge.rejected.len(),
            merge_aborted = merge.aborted.len(),
            fact_rejected = facts.rejected.len(),
            dimension_rejected = rejected_dimensions.len(),
            clean = report.is_clean(),
            "Pipeline run complete"
        );

        Ok(PipelineRun {
            merge,
            facts,
            report,
            rejected_dimensions,
        })
    }

    fn upsert_dimensions(&self, batch: &StagingBatch) -> StarlingResult<Vec<RecordError>> {
        let mut rejected = Vec::new();

        for provider in &batch.providers {
            if provider.provider_id.is_blank() {
                rejected.push(blank_id(RecordRef::Provider {
                    provider_id: provider.provider_id.clone(),
                }));
                continue;
            }
            self.store.provider_upsert(provider)?;
        }

        for plan in &batch.insurance_plans {
            if plan.insurance_plan_id.is_blank() {
                rejected.push(blank_id(RecordRef::InsurancePlan {
                    insurance_plan_id: plan.insurance_plan_id.clone(),
                }));
                continue;
            }
            self.store.insurance_plan_upsert(plan)?;
        }

        tracing::debug!(
            providers = batch.providers.len(),
            insurance_plans = batch.insurance_plans.len(),
            rejected = rejected.len(),
            "Dimensions upserted"
        );
        Ok(rejected)
    }
}

fn blank_id(record: RecordRef) -> RecordError {
    tracing::warn!(record = %record, "Dimension row rejected");
    RecordError::MalformedInput {
        record,
        reason: "blank id".to_string(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use starling_core::{CanonicalUserId, PaymentStatus, ProviderId};
    use starling_storage::InMemoryDimensionStore;
    use starling_test_utils::{assertions, dec, fixtures};

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            max_commit_retries: 0,
            ..EngineConfig::default()
        };
        let result = Pipeline::new(InMemoryDimensionStore::new(), config);
        assertions::assert_config_error(&result);
    }

    #[test]
    fn test_run_end_to_end() {
        let pipeline =
            Pipeline::new(InMemoryDimensionStore::new(), EngineConfig::default()).unwrap();

        let mut appointment = fixtures::appointment("A1", Some("L1"), None, 100);
        appointment.provider_id = Some(ProviderId::new("PRV1"));

        let batch = StagingBatch {
            identity_facts: vec![fixtures::hinted_fact(Some("L1"), Some("D9"), "U1", 0)],
            sessions: vec![fixtures::session("S1", None, Some("D9"), 50)],
            appointments: vec![appointment],
            payments: vec![
                fixtures::payment("P1", "A1", 50, PaymentStatus::Paid, 110),
                fixtures::payment("P2", "A1", 50, PaymentStatus::Refunded, 120),
            ],
            providers: vec![fixtures::provider("PRV1", "Dr. A")],
            insurance_plans: vec![],
        };

        let run = pipeline.run(&batch).unwrap();
        assert!(run.merge.is_clean());
        assert!(run.report.is_clean(), "{:?}", run.report);
        assert!(run.rejected_dimensions.is_empty());
        assert_eq!(run.facts.fact_session[0].canonical_user_id, CanonicalUserId::new("U1"));
        assert_eq!(run.facts.fact_appointment[0].net_amount, dec(0));
        assert!(run.facts.fact_appointment[0].provider_key.is_some());
        assertions::assert_store_valid(pipeline.store());
    }

    #[test]
    fn test_blank_dimension_ids_rejected() {
        let pipeline =
            Pipeline::new(InMemoryDimensionStore::new(), EngineConfig::default()).unwrap();
        let batch = StagingBatch {
            providers: vec![fixtures::provider(" ", "Nobody")],
            insurance_plans: vec![fixtures::insurance_plan("", "Nobody")],
            ..StagingBatch::default()
        };

        let run = pipeline.run(&batch).unwrap();
        assert_eq!(run.rejected_dimensions.len(), 2);
        assert!(pipeline.store().snapshot().unwrap().providers.is_empty());
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let pipeline =
            Pipeline::new(InMemoryDimensionStore::new(), EngineConfig::default()).unwrap();
        let batch = StagingBatch {
            identity_facts: vec![
                fixtures::identity_fact(Some("L1"), Some("D1"), 0),
                fixtures::identity_fact(None, Some("D1"), 10),
            ],
            appointments: vec![fixtures::appointment("A1", None, Some("D1"), 20)],
            payments: vec![fixtures::payment("P1", "A1", 25, PaymentStatus::Paid, 30)],
            ..StagingBatch::default()
        };

        let first = pipeline.run(&batch).unwrap();
        let rows_after_first = pipeline.store().identity_row_count().unwrap();
        let second = pipeline.run(&batch).unwrap();

        assert_eq!(second.merge.versions_opened(), 0);
        assert_eq!(pipeline.store().identity_row_count().unwrap(), rows_after_first);
        assert_eq!(first.facts, second.facts);
    }
}
