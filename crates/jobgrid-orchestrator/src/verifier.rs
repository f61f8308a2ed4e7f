//! Result verification.

use async_trait::async_trait;

use jobgrid_core::{Execution, ExecutionId, Job};

use crate::error::OrchestratorResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub execution_id: ExecutionId,
    pub verified: bool,
}

/// Judges the proposed results of a job once enough have arrived.
#[async_trait]
pub trait Verifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// One result per proposed execution.
    async fn verify(
        &self,
        job: &Job,
        proposed: &[Execution],
    ) -> OrchestratorResult<Vec<VerificationResult>>;
}

/// Accepts every proposed result.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopVerifier;

#[async_trait]
impl Verifier for NoopVerifier {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn verify(
        &self,
        _job: &Job,
        proposed: &[Execution],
    ) -> OrchestratorResult<Vec<VerificationResult>> {
        Ok(proposed
            .iter()
            .map(|e| VerificationResult {
                execution_id: e.id.clone(),
                verified: true,
            })
            .collect())
    }
}
