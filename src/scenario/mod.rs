//! Features, scenarios and their assertions
//!
//! A [`Feature`] is a named group of steps sharing one namespace:
//!
//! 1. setup steps, in order; the first failure skips everything after it
//! 2. assessments, in order; each one is recorded and the rest still run
//!
//! An assessment is either a [`Scenario`] (submit one object, compare the
//! [`AdmissionOutcome`] with an [`Expectation`]) or a free-form step.

mod report;

pub use report::{FeatureReport, StepPhase, StepResult, StepStatus, TestHarness};
pub(crate) use report::panic_message;

use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_POLL_INTERVAL, DEFAULT_READY_TIMEOUT};
use crate::env::TestEnvironment;
use crate::kube_utils::{manifest_metadata, poll_until};
use crate::probe::{AdmissionOutcome, InfraError, InfraErrorKind, ObjectTarget, ResourceSubmitter};
use crate::template::{TemplateEngine, TemplateValues};
use crate::Error;

/// How a denial expectation is matched against an outcome
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DenialMatching {
    /// Only an admission denial satisfies a denial expectation
    #[default]
    Strict,
    /// Any failed submission satisfies a denial expectation
    AnyError,
}

/// What a scenario expects the API server to do
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expectation {
    /// The object is persisted
    Admitted,
    /// Admission refuses the object
    Denied {
        /// Why the denial is expected; shown when the scenario fails
        reason: Option<String>,
    },
}

/// Compare an outcome with an expectation
pub fn evaluate(
    expectation: &Expectation,
    outcome: &AdmissionOutcome,
    matching: DenialMatching,
) -> Result<(), String> {
    match (expectation, outcome) {
        (Expectation::Admitted, AdmissionOutcome::Admitted) => Ok(()),
        (Expectation::Admitted, AdmissionOutcome::Denied(d)) => {
            Err(format!("expected admission but was denied: {}", d.message))
        }
        (Expectation::Admitted, AdmissionOutcome::InfrastructureError(e)) => Err(format!(
            "expected admission but hit an infrastructure error ({:?}): {}",
            e.kind, e.message
        )),
        (Expectation::Denied { reason }, AdmissionOutcome::Admitted) => Err(format!(
            "expected denial{} but the object was admitted",
            expected_because(reason)
        )),
        (Expectation::Denied { .. }, AdmissionOutcome::Denied(_)) => Ok(()),
        (Expectation::Denied { reason }, AdmissionOutcome::InfrastructureError(e)) => {
            match matching {
                DenialMatching::AnyError => {
                    warn!(kind = ?e.kind, error = %e.message, "accepting infrastructure error as denial");
                    Ok(())
                }
                DenialMatching::Strict => Err(format!(
                    "expected denial{} but hit an infrastructure error ({:?}): {}",
                    expected_because(reason),
                    e.kind,
                    e.message
                )),
            }
        }
    }
}

fn expected_because(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|r| format!(" ({r})"))
        .unwrap_or_default()
}

// =============================================================================
// Submissions
// =============================================================================

/// What a scenario sends to the API server
#[derive(Clone, Debug)]
pub enum Submission {
    /// Create a fully built manifest
    Create(Value),
    /// Render a `${...}` template (with `namespace` bound) and create it
    Template {
        /// Template source
        template: String,
        /// Values besides `namespace`
        values: TemplateValues,
    },
    /// Strategic-merge patch into a subresource of an existing object
    PatchSubresource {
        /// Object to patch
        target: ObjectTarget,
        /// Subresource name, e.g. `ephemeralcontainers`
        subresource: String,
        /// Patch body
        patch: Value,
    },
}

impl Submission {
    /// Create `manifest`
    pub fn create(manifest: Value) -> Self {
        Submission::Create(manifest)
    }

    /// Create the rendering of `template`
    pub fn template(template: impl Into<String>, values: TemplateValues) -> Self {
        Submission::Template {
            template: template.into(),
            values,
        }
    }

    /// Patch `subresource` of `target`
    pub fn patch_subresource(
        target: ObjectTarget,
        subresource: impl Into<String>,
        patch: Value,
    ) -> Self {
        Submission::PatchSubresource {
            target,
            subresource: subresource.into(),
            patch,
        }
    }
}

impl From<Value> for Submission {
    fn from(manifest: Value) -> Self {
        Submission::Create(manifest)
    }
}

/// One submission with its expected outcome
#[derive(Clone, Debug)]
pub struct Scenario {
    /// Name shown in reports
    pub name: String,
    /// Expected outcome
    pub expectation: Expectation,
    /// What to submit
    pub submission: Submission,
}

impl Scenario {
    /// Expect `submission` to be admitted
    pub fn should_admit(name: impl Into<String>, submission: impl Into<Submission>) -> Self {
        Self {
            name: name.into(),
            expectation: Expectation::Admitted,
            submission: submission.into(),
        }
    }

    /// Expect `submission` to be denied
    pub fn should_deny(name: impl Into<String>, submission: impl Into<Submission>) -> Self {
        Self {
            name: name.into(),
            expectation: Expectation::Denied { reason: None },
            submission: submission.into(),
        }
    }

    /// Note why the denial is expected, for failure output
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        if let Expectation::Denied { reason: r } = &mut self.expectation {
            *r = Some(reason.into());
        }
        self
    }
}

/// A submission with templates rendered
enum Materialized {
    Create(Value),
    Patch {
        target: ObjectTarget,
        subresource: String,
        patch: Value,
    },
}

// =============================================================================
// Step context
// =============================================================================

/// Handle given to every step: the feature's namespace and ways to act in it
#[derive(Clone)]
pub struct StepContext {
    namespace: String,
    submitter: Arc<dyn ResourceSubmitter>,
    templates: Arc<TemplateEngine>,
    timeout: Duration,
    poll_interval: Duration,
}

impl StepContext {
    /// Context for `namespace` with default wait bounds
    pub fn new(
        namespace: impl Into<String>,
        submitter: Arc<dyn ResourceSubmitter>,
        templates: Arc<TemplateEngine>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            submitter,
            templates,
            timeout: DEFAULT_READY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the bound and interval of [`StepContext::wait_for_object`]
    pub fn with_wait(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// Namespace of the running feature
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Submitter used for probes
    pub fn submitter(&self) -> &Arc<dyn ResourceSubmitter> {
        &self.submitter
    }

    /// Render `template` with `values` plus `namespace`
    pub fn render(&self, template: &str, values: &TemplateValues) -> Result<Value, Error> {
        let mut values = values.clone();
        values.insert("namespace".to_string(), Value::String(self.namespace.clone()));
        self.templates.render_manifest(template, &values)
    }

    /// Server-side apply a prerequisite
    pub async fn apply(&self, manifest: &Value) -> Result<(), Error> {
        self.submitter.apply(&self.namespace, manifest).await
    }

    /// Create a prerequisite that must be admitted
    pub async fn create(&self, manifest: &Value) -> Result<(), Error> {
        let target = ObjectTarget::of(manifest)?;
        match self.submitter.create(&self.namespace, manifest).await {
            AdmissionOutcome::Admitted => Ok(()),
            outcome => Err(Error::install(target.to_string(), outcome.to_string())),
        }
    }

    /// Wait until `target` can be read in the feature's namespace
    pub async fn wait_for_object(&self, target: &ObjectTarget) -> Result<(), Error> {
        poll_until(self.timeout, self.poll_interval, target.to_string(), || {
            self.submitter.exists(&self.namespace, target)
        })
        .await
    }

    /// Create `manifest` repeatedly until admission accepts it.
    ///
    /// Readable is not the same as visible to admission: parameter objects
    /// reach the policy plugin through its own informer. A Conflict means an
    /// earlier attempt was admitted.
    pub async fn wait_until_admitted(&self, manifest: &Value) -> Result<(), Error> {
        let target = ObjectTarget::of(manifest)?;
        poll_until(
            self.timeout,
            self.poll_interval,
            format!("admission of {}", target),
            || async {
                match self.submitter.create(&self.namespace, manifest).await {
                    AdmissionOutcome::Admitted => Ok(true),
                    AdmissionOutcome::InfrastructureError(InfraError {
                        kind: InfraErrorKind::Conflict,
                        ..
                    }) => Ok(true),
                    outcome => {
                        debug!(target = %target, outcome = %outcome, "not admitted yet");
                        Ok(false)
                    }
                }
            },
        )
        .await
    }

    fn materialize(&self, submission: &Submission) -> Result<Materialized, Error> {
        Ok(match submission {
            Submission::Create(manifest) => Materialized::Create(manifest.clone()),
            Submission::Template { template, values } => {
                Materialized::Create(self.render(template, values)?)
            }
            Submission::PatchSubresource {
                target,
                subresource,
                patch,
            } => Materialized::Patch {
                target: target.clone(),
                subresource: subresource.clone(),
                patch: patch.clone(),
            },
        })
    }

    async fn submit(&self, submission: &Materialized) -> AdmissionOutcome {
        match submission {
            Materialized::Create(manifest) => self.submitter.create(&self.namespace, manifest).await,
            Materialized::Patch {
                target,
                subresource,
                patch,
            } => {
                self.submitter
                    .patch_subresource(&self.namespace, target, subresource, patch)
                    .await
            }
        }
    }
}

// =============================================================================
// Features
// =============================================================================

/// Boxed step body
pub type StepFuture = BoxFuture<'static, Result<(), Error>>;

type StepFn = Arc<dyn Fn(StepContext) -> StepFuture + Send + Sync>;

enum Assessment {
    Scenario(Scenario),
    Step { name: String, step: StepFn },
}

impl Assessment {
    fn name(&self) -> &str {
        match self {
            Assessment::Scenario(s) => &s.name,
            Assessment::Step { name, .. } => name,
        }
    }
}

/// A named group of setup steps and assessments sharing one namespace
pub struct Feature {
    name: String,
    setup: Vec<(String, StepFn)>,
    assessments: Vec<Assessment>,
    matching: Option<DenialMatching>,
}

fn boxed_step<F, Fut>(step: F) -> StepFn
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(move |ctx| step(ctx).boxed())
}

impl Feature {
    /// Empty feature called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            setup: Vec::new(),
            assessments: Vec::new(),
            matching: None,
        }
    }

    /// Feature name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a setup step
    pub fn setup<F, Fut>(mut self, name: impl Into<String>, step: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.setup.push((name.into(), boxed_step(step)));
        self
    }

    /// Append a scenario
    pub fn assess(mut self, scenario: Scenario) -> Self {
        self.assessments.push(Assessment::Scenario(scenario));
        self
    }

    /// Append several scenarios
    pub fn assess_all(mut self, scenarios: impl IntoIterator<Item = Scenario>) -> Self {
        self.assessments
            .extend(scenarios.into_iter().map(Assessment::Scenario));
        self
    }

    /// Append a free-form assessment step
    pub fn assess_step<F, Fut>(mut self, name: impl Into<String>, step: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.assessments.push(Assessment::Step {
            name: name.into(),
            step: boxed_step(step),
        });
        self
    }

    /// Override the environment's denial matching for this feature
    pub fn denial_matching(mut self, matching: DenialMatching) -> Self {
        self.matching = Some(matching);
        self
    }

    /// Run in a fresh namespace of `env`, deleting it afterwards
    pub async fn test(&self, env: &TestEnvironment) -> FeatureReport {
        let start = Instant::now();
        let ns = match env.isolator().create_namespace(&self.name).await {
            Ok(ns) => ns,
            Err(e) => {
                let mut report = FeatureReport::aborted(&self.name, e.to_string());
                report.duration = start.elapsed();
                return report;
            }
        };

        let ctx = env.step_context(&ns.name);
        let matching = self.matching.unwrap_or(env.config().denial_matching);
        let mut report = self.run_in(&ctx, matching).await;

        if let Err(e) = env.isolator().delete_namespace(&ns).await {
            warn!(feature = %self.name, namespace = %ns.name, error = %e, "namespace cleanup failed");
        }
        report.duration = start.elapsed();
        report
    }

    /// Run every step against `ctx` without managing the namespace
    pub async fn run_in(&self, ctx: &StepContext, matching: DenialMatching) -> FeatureReport {
        let start = Instant::now();
        let mut report = FeatureReport::new(&self.name);
        report.namespace = Some(ctx.namespace().to_string());

        let materialized = match self.materialize_all(ctx) {
            Ok(m) => m,
            Err(e) => {
                report.error = Some(e.to_string());
                report.duration = start.elapsed();
                return report;
            }
        };

        info!(feature = %self.name, namespace = %ctx.namespace(), "running feature");
        let mut setup_failed = false;
        for (name, step) in &self.setup {
            if setup_failed {
                report.push(name, StepPhase::Setup, StepStatus::Skipped, Duration::ZERO);
                continue;
            }
            let step_start = Instant::now();
            let status = run_step(step, ctx).await;
            setup_failed = status.is_failed();
            report.push(name, StepPhase::Setup, status, step_start.elapsed());
        }

        for (assessment, submission) in self.assessments.iter().zip(&materialized) {
            if setup_failed {
                report.push(assessment.name(), StepPhase::Assess, StepStatus::Skipped, Duration::ZERO);
                continue;
            }
            let step_start = Instant::now();
            let status = match (assessment, submission) {
                (Assessment::Scenario(scenario), Some(submission)) => {
                    let outcome = ctx.submit(submission).await;
                    debug!(scenario = %scenario.name, outcome = %outcome, "probe finished");
                    match evaluate(&scenario.expectation, &outcome, matching) {
                        Ok(()) => StepStatus::Passed,
                        Err(reason) => StepStatus::Failed(reason),
                    }
                }
                (Assessment::Step { step, .. }, _) => run_step(step, ctx).await,
                (Assessment::Scenario(_), None) => StepStatus::Failed("nothing to submit".to_string()),
            };
            if let StepStatus::Failed(reason) = &status {
                warn!(feature = %self.name, step = %assessment.name(), reason = %reason, "step failed");
            }
            report.push(assessment.name(), StepPhase::Assess, status, step_start.elapsed());
        }

        report.duration = start.elapsed();
        report
    }

    /// Render every scenario up front and reject duplicate objects
    fn materialize_all(&self, ctx: &StepContext) -> Result<Vec<Option<Materialized>>, Error> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(self.assessments.len());
        for assessment in &self.assessments {
            let Assessment::Scenario(scenario) = assessment else {
                out.push(None);
                continue;
            };
            let materialized = ctx.materialize(&scenario.submission).map_err(|e| {
                Error::manifest(format!("scenario {}: {}", scenario.name, e))
            })?;
            if let Materialized::Create(manifest) = &materialized {
                let meta = manifest_metadata(manifest.clone()).map_err(|e| {
                    Error::manifest(format!("scenario {}: {}", scenario.name, e))
                })?;
                if !seen.insert((meta.gvk.kind.clone(), meta.name.clone())) {
                    return Err(Error::manifest(format!(
                        "scenario {} submits {} which another scenario of this feature already submits",
                        scenario.name,
                        meta.display_name()
                    )));
                }
            }
            out.push(Some(materialized));
        }
        Ok(out)
    }
}

async fn run_step(step: &StepFn, ctx: &StepContext) -> StepStatus {
    match AssertUnwindSafe(step(ctx.clone())).catch_unwind().await {
        Ok(Ok(())) => StepStatus::Passed,
        Ok(Err(e)) => StepStatus::Failed(e.to_string()),
        Err(panic) => StepStatus::Failed(panic_message(panic)),
    }
}
