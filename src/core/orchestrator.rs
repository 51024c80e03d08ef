//! Deployment pipeline
//!
//! Ties safety analysis, dry-run, confirmation, apply and the audit trail
//! together. One deployment attempt moves through:
//!
//! ```text
//! SafetyChecked -> SafetyCleared -> DryRunPassed -> Confirmed -> Applying -> Deployed | Failed
//! ```
//!
//! Front ends drive it either through the two-phase API
//! ([`DeploymentOrchestrator::propose`], [`DeploymentOrchestrator::validate`],
//! [`DeploymentOrchestrator::confirm`]) or through
//! [`DeploymentOrchestrator::deploy_with`] and a [`Confirmer`].
//!
//! Apply runs on a spawned tokio task. Its stage and final result come back
//! over channels on the returned [`DeployHandle`]; nothing on the caller's
//! side is mutated from the task. Only one apply may be in flight per
//! orchestrator.

use crate::audit::AuditAction;
use crate::core::applier::{ApplyOutcome, RulesetApplier};
use crate::core::error::{Error, Result};
use crate::core::policy::{PolicyId, SnapshotKind, snapshot_name};
use crate::core::safety::{SafetyAnalyzer, SafetyVerdict};
use crate::core::store::PolicyStore;
use crate::validators;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Where a deployment attempt currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum DeployStage {
    /// Safety analysis done, verdict not yet cleared
    SafetyChecked,
    /// Verdict was safe, or the operator overrode the warning
    SafetyCleared,
    DryRunPassed,
    Confirmed,
    Applying,
    Deployed,
    Failed,
}

/// One deployment attempt awaiting operator decisions
#[derive(Debug, Clone)]
pub struct Proposal {
    id: Uuid,
    ruleset: String,
    verdict: SafetyVerdict,
    stage: DeployStage,
    risk_acknowledged: bool,
    dry_run: Option<ApplyOutcome>,
    source: Option<PolicyId>,
}

impl Proposal {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn ruleset(&self) -> &str {
        &self.ruleset
    }

    pub fn verdict(&self) -> &SafetyVerdict {
        &self.verdict
    }

    pub fn stage(&self) -> DeployStage {
        self.stage
    }

    /// Stored policy this attempt re-deploys, if any
    pub fn source(&self) -> Option<PolicyId> {
        self.source
    }

    /// Dry-run result once [`DeploymentOrchestrator::validate`] has run
    pub fn dry_run(&self) -> Option<&ApplyOutcome> {
        self.dry_run.as_ref()
    }

    /// True while an unsafe verdict has not been overridden
    pub fn needs_override(&self) -> bool {
        self.stage == DeployStage::SafetyChecked
    }

    /// Operator override of a safety warning
    pub fn acknowledge_risk(&mut self) {
        if self.stage == DeployStage::SafetyChecked {
            warn!(proposal = %self.id, "Safety warning overridden: {}", self.verdict.reason);
            self.risk_acknowledged = true;
            self.stage = DeployStage::SafetyCleared;
        }
    }

    fn audit_detail(&self, output: &str) -> String {
        let mut detail = format!("Safety: {} - {}", self.verdict.label(), self.verdict.reason);
        if self.risk_acknowledged {
            detail.push_str(" (override acknowledged)");
        }
        if let Some(source) = self.source {
            detail.push_str(&format!("; redeployed from policy #{source}"));
        }
        let output = output.trim();
        if !output.is_empty() {
            detail.push_str("; ");
            detail.push_str(output);
        }
        detail
    }
}

/// Successful deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub proposal: Uuid,
    /// Snapshot of exactly what was applied
    pub policy_id: PolicyId,
    pub output: String,
}

/// Result of the simulate path
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub verdict: SafetyVerdict,
    pub dry_run: ApplyOutcome,
    pub policy_id: PolicyId,
}

/// Operator decisions for [`DeploymentOrchestrator::deploy_with`]
pub trait Confirmer {
    /// Asked only when safety analysis warns. `false` aborts.
    fn acknowledge_risk(&self, verdict: &SafetyVerdict) -> bool;

    /// Asked after a passing dry-run, right before apply. `false` aborts.
    fn confirm_apply(&self, proposal: &Proposal) -> bool;
}

/// Tracks a running apply
#[derive(Debug)]
pub struct DeployHandle {
    id: Uuid,
    stage: watch::Receiver<DeployStage>,
    result: oneshot::Receiver<Result<Deployment>>,
}

impl DeployHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Latest stage reported by the apply task
    pub fn stage(&self) -> DeployStage {
        *self.stage.borrow()
    }

    /// Waits for the next stage change; `None` once the task has finished
    pub async fn stage_changed(&mut self) -> Option<DeployStage> {
        self.stage.changed().await.ok()?;
        Some(*self.stage.borrow_and_update())
    }

    /// Waits for the apply task to report.
    ///
    /// # Errors
    ///
    /// Returns the deployment's failure (`ApplyFailed`, launch or store
    /// errors); every failure has already been audited unless it is a store error.
    pub async fn wait(self) -> Result<Deployment> {
        self.result
            .await
            .map_err(|_| Error::Internal("deploy task ended without reporting".to_string()))?
    }
}

/// Releases the in-flight flag when dropped
struct FlightGuard(Arc<AtomicBool>);

impl FlightGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::DeployInFlight)?;
        Ok(Self(Arc::clone(flag)))
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The deployment safety pipeline
#[derive(Debug, Clone)]
pub struct DeploymentOrchestrator {
    applier: RulesetApplier,
    analyzer: SafetyAnalyzer,
    store: Arc<PolicyStore>,
    in_flight: Arc<AtomicBool>,
}

impl DeploymentOrchestrator {
    pub fn new(applier: RulesetApplier, analyzer: SafetyAnalyzer, store: Arc<PolicyStore>) -> Self {
        Self {
            applier,
            analyzer,
            store,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn applier(&self) -> &RulesetApplier {
        &self.applier
    }

    /// True while an apply task is running
    pub fn is_deploying(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn analyze(&self, ruleset: &str) -> SafetyVerdict {
        self.analyzer.analyze(ruleset)
    }

    /// Stand-alone dry-run. Not audited: nothing changes.
    ///
    /// # Errors
    ///
    /// Returns `Err` only if the rule engine cannot be launched.
    pub async fn dry_run(&self, ruleset: &str) -> Result<ApplyOutcome> {
        validators::validate_ruleset_text(ruleset).map_err(Error::InvalidInput)?;
        self.applier.dry_run(ruleset).await
    }

    /// Saves a manual version; `name` defaults to `policy-<timestamp>`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` or `Error::Store`.
    pub fn save(&self, name: Option<&str>, ruleset: &str) -> Result<PolicyId> {
        let name = name.map_or_else(
            || snapshot_name(SnapshotKind::Manual, Utc::now()),
            str::to_string,
        );
        self.store.save_policy(&name, ruleset)
    }

    /// # Errors
    ///
    /// Returns `Error::PolicyNotFound` or `Error::Store`.
    pub fn delete(&self, id: PolicyId) -> Result<()> {
        self.store.delete_policy(id)
    }

    /// Safety check plus dry-run, always recorded as a `sim-` snapshot with a
    /// `simulate` audit entry carrying the safety reason, whatever the dry-run says.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` for unusable text, `Error::Store` if the
    /// record cannot be written.
    pub async fn simulate(&self, ruleset: &str) -> Result<SimulationReport> {
        validators::validate_ruleset_text(ruleset).map_err(Error::InvalidInput)?;

        let verdict = self.analyzer.analyze(ruleset);
        let dry_run = match self.applier.dry_run(ruleset).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Simulation dry-run could not run: {e}");
                ApplyOutcome {
                    ok: false,
                    output: e.to_string(),
                    exit_code: None,
                }
            }
        };

        let name = snapshot_name(SnapshotKind::Simulation, Utc::now());
        let policy_id =
            self.store
                .record_snapshot(&name, ruleset, AuditAction::Simulate, &verdict.reason)?;

        info!(
            "Simulation #{policy_id}: safety {}, dry-run {}",
            verdict.label(),
            if dry_run.ok { "OK" } else { "FAILED" }
        );
        Ok(SimulationReport {
            verdict,
            dry_run,
            policy_id,
        })
    }

    /// Starts a deployment attempt: runs safety analysis.
    ///
    /// # Errors
    ///
    /// Returns `Error::DeployInFlight` while another apply runs,
    /// `Error::InvalidInput` for unusable text.
    pub fn propose(&self, ruleset: impl Into<String>) -> Result<Proposal> {
        self.propose_inner(ruleset.into(), None)
    }

    /// Starts a deployment attempt for a stored version.
    ///
    /// # Errors
    ///
    /// As [`Self::propose`], plus `Error::PolicyNotFound`.
    pub fn propose_policy(&self, id: PolicyId) -> Result<Proposal> {
        let policy = self.store.get_policy(id)?.ok_or(Error::PolicyNotFound(id))?;
        self.propose_inner(policy.content, Some(id))
    }

    fn propose_inner(&self, ruleset: String, source: Option<PolicyId>) -> Result<Proposal> {
        if self.is_deploying() {
            return Err(Error::DeployInFlight);
        }
        validators::validate_ruleset_text(&ruleset).map_err(Error::InvalidInput)?;

        let verdict = self.analyzer.analyze(&ruleset);
        let id = Uuid::new_v4();
        let stage = if verdict.safe {
            DeployStage::SafetyCleared
        } else {
            warn!(proposal = %id, "Safety warning: {}", verdict.reason);
            DeployStage::SafetyChecked
        };
        info!(proposal = %id, "Proposed deployment (safety {})", verdict.label());

        Ok(Proposal {
            id,
            ruleset,
            verdict,
            stage,
            risk_acknowledged: false,
            dry_run: None,
            source,
        })
    }

    /// Dry-runs a proposal whose safety verdict is cleared.
    ///
    /// # Errors
    ///
    /// - `Error::SafetyWarning` if the verdict warned and was not overridden
    /// - `Error::ValidationFailed` if the rule engine rejected the text
    /// - launch errors from the applier
    pub async fn validate(&self, proposal: &mut Proposal) -> Result<()> {
        match proposal.stage {
            DeployStage::SafetyChecked => {
                info!(proposal = %proposal.id, "Deploy aborted (safety)");
                return Err(Error::SafetyWarning {
                    reason: proposal.verdict.reason.clone(),
                });
            }
            DeployStage::SafetyCleared | DeployStage::DryRunPassed => {}
            stage => {
                return Err(Error::Internal(format!(
                    "cannot dry-run a proposal at stage {stage}"
                )));
            }
        }

        let outcome = self.applier.dry_run(&proposal.ruleset).await?;
        let ok = outcome.ok;
        let output = outcome.output.clone();
        proposal.dry_run = Some(outcome);

        if ok {
            proposal.stage = DeployStage::DryRunPassed;
            Ok(())
        } else {
            proposal.stage = DeployStage::SafetyCleared;
            Err(Error::ValidationFailed { output })
        }
    }

    /// Operator confirmed: applies the proposal on a background task.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotValidated` without a passing dry-run,
    /// `Error::DeployInFlight` if another apply is running, and
    /// `Error::Internal` when called outside a tokio runtime.
    pub fn confirm(&self, mut proposal: Proposal) -> Result<DeployHandle> {
        if proposal.stage != DeployStage::DryRunPassed {
            return Err(Error::NotValidated);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("confirm needs a tokio runtime: {e}")))?;
        let flight = FlightGuard::acquire(&self.in_flight)?;
        proposal.stage = DeployStage::Confirmed;
        info!(proposal = %proposal.id, "Deployment confirmed");

        let (stage_tx, stage_rx) = watch::channel(DeployStage::Confirmed);
        let (result_tx, result_rx) = oneshot::channel();
        let id = proposal.id;
        let applier = self.applier.clone();
        let store = Arc::clone(&self.store);

        runtime.spawn(async move {
            stage_tx.send_replace(DeployStage::Applying);
            let result = apply_and_record(&applier, &store, &proposal).await;
            stage_tx.send_replace(if result.is_ok() {
                DeployStage::Deployed
            } else {
                DeployStage::Failed
            });

            // Free the slot before reporting so the caller can deploy again at once
            drop(flight);
            if result_tx.send(result).is_err() {
                warn!(proposal = %id, "Deploy result dropped: handle no longer awaited");
            }
        });

        Ok(DeployHandle {
            id,
            stage: stage_rx,
            result: result_rx,
        })
    }

    /// Runs the whole pipeline, asking `confirmer` at each gate.
    ///
    /// # Errors
    ///
    /// `SafetyWarning`, `ValidationFailed` and `Unconfirmed` abort without
    /// touching the store; `ApplyFailed` and launch errors arrive after a
    /// `deploy_failed` entry was written.
    pub async fn deploy_with<C: Confirmer + ?Sized>(
        &self,
        ruleset: impl Into<String>,
        confirmer: &C,
    ) -> Result<Deployment> {
        let proposal = self.propose(ruleset)?;
        self.drive(proposal, confirmer).await
    }

    /// [`Self::deploy_with`] for a stored version.
    ///
    /// # Errors
    ///
    /// As [`Self::deploy_with`], plus `Error::PolicyNotFound`.
    pub async fn deploy_policy_with<C: Confirmer + ?Sized>(
        &self,
        id: PolicyId,
        confirmer: &C,
    ) -> Result<Deployment> {
        let proposal = self.propose_policy(id)?;
        self.drive(proposal, confirmer).await
    }

    async fn drive<C: Confirmer + ?Sized>(
        &self,
        mut proposal: Proposal,
        confirmer: &C,
    ) -> Result<Deployment> {
        if proposal.needs_override() && confirmer.acknowledge_risk(&proposal.verdict) {
            proposal.acknowledge_risk();
        }
        self.validate(&mut proposal).await?;

        if !confirmer.confirm_apply(&proposal) {
            info!(proposal = %proposal.id, "Deployment not confirmed");
            return Err(Error::Unconfirmed);
        }

        self.confirm(proposal)?.wait().await
    }
}

/// Applies and writes exactly one audit entry for the outcome.
async fn apply_and_record(
    applier: &RulesetApplier,
    store: &PolicyStore,
    proposal: &Proposal,
) -> Result<Deployment> {
    let failure = match applier.apply(&proposal.ruleset).await {
        Ok(outcome) if outcome.ok => {
            let name = snapshot_name(SnapshotKind::Deployed, Utc::now());
            let detail = proposal.audit_detail(&outcome.output);
            let policy_id = store
                .record_snapshot(&name, &proposal.ruleset, AuditAction::Deploy, &detail)
                .inspect_err(|e| {
                    error!(proposal = %proposal.id, "Ruleset applied but not recorded: {e}");
                })?;
            info!(proposal = %proposal.id, "Deployed as policy #{policy_id}");
            return Ok(Deployment {
                proposal: proposal.id,
                policy_id,
                output: outcome.output,
            });
        }
        Ok(outcome) => Error::ApplyFailed {
            output: outcome.detail(),
        },
        Err(e) => e,
    };

    let detail = failure
        .diagnostic_output()
        .map_or_else(|| failure.to_string(), str::to_string);
    error!(proposal = %proposal.id, "Deployment failed: {detail}");
    store
        .log_audit(AuditAction::DeployFailed, None, &detail)
        .inspect_err(|e| {
            error!(proposal = %proposal.id, "Could not record failed deployment ({detail}): {e}");
        })?;
    Err(failure)
}
