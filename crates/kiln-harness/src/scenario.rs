//! Scenario definitions and the execution engine.
//!
//! A scenario is a named, timeout-bounded check run against one instance.
//! The engine runs each scenario exactly once per invocation, measures
//! wall-clock duration, converts failures into the result record instead of
//! propagating them, and best-effort attaches a metrics snapshot. Retrying
//! is the caller's business.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::instance::Instance;
use crate::metrics::collect_system_metrics;
use crate::results::TestResult;
use crate::shell::RemoteShell;

/// Everything a scenario may touch while it runs.
///
/// The instance is only borrowed for the duration of one scenario call;
/// scenarios must not retain it.
pub struct ScenarioContext<'a> {
    pub instance: &'a Instance,
    pub shell: RemoteShell,
    pub cancel: CancellationToken,
}

/// A scenario-level failure: what went wrong plus whatever output was
/// captured before it did.
#[derive(Debug)]
pub struct ScenarioFailure {
    pub message: String,
    pub output: String,
}

impl ScenarioFailure {
    #[must_use]
    pub fn new(message: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            output: output.into(),
        }
    }
}

/// Outcome of one scenario body: captured output on success, failure with
/// partial output otherwise.
pub type ScenarioOutcome = std::result::Result<String, ScenarioFailure>;

/// A named, pure description of one check.
#[async_trait]
pub trait Scenario: Send + Sync {
    /// Unique name within a registry.
    fn name(&self) -> &'static str;

    /// Human-readable description.
    fn description(&self) -> &'static str;

    /// Per-scenario execution bound, enforced by the engine.
    fn timeout(&self) -> Duration;

    /// Run the check against a booted instance.
    async fn run(&self, ctx: &ScenarioContext<'_>) -> ScenarioOutcome;
}

/// Ordered registry of scenarios.
///
/// The built-in set is fixed; additional scenarios can be registered and
/// run after it. Results are always produced in registry order.
pub struct ScenarioRegistry {
    scenarios: Vec<Arc<dyn Scenario>>,
}

impl ScenarioRegistry {
    /// The built-in scenario set in execution order.
    #[must_use]
    pub fn builtin() -> Self {
        use crate::scenarios::{
            BootScenario, NetworkScenario, PerformanceScenario, ServicesScenario, StressScenario,
        };
        Self {
            scenarios: vec![
                Arc::new(BootScenario),
                Arc::new(NetworkScenario),
                Arc::new(ServicesScenario),
                Arc::new(PerformanceScenario),
                Arc::new(StressScenario),
            ],
        }
    }

    /// An empty registry, for callers composing their own set.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            scenarios: Vec::new(),
        }
    }

    /// Append a scenario. Names must stay unique; a duplicate replaces
    /// nothing and is refused.
    pub fn register(&mut self, scenario: Arc<dyn Scenario>) -> bool {
        if self.scenarios.iter().any(|s| s.name() == scenario.name()) {
            warn!(name = scenario.name(), "scenario already registered");
            return false;
        }
        self.scenarios.push(scenario);
        true
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Scenario>> {
        self.scenarios.iter().find(|s| s.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Scenario>> {
        self.scenarios.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}

/// Run one scenario against one instance and capture the outcome.
///
/// The scenario races against its own timeout and the caller's
/// cancellation token, so an outer abort still cuts a long check short.
/// Whatever happens, a metrics snapshot is attempted afterwards; metrics
/// failure never flips a passing result.
pub async fn run_scenario(ctx: &ScenarioContext<'_>, scenario: &dyn Scenario) -> TestResult {
    info!(
        instance_id = %ctx.instance.id,
        scenario = scenario.name(),
        "running scenario"
    );

    let start_time = Utc::now();
    let started = std::time::Instant::now();

    let outcome = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => Err(ScenarioFailure::new(
            format!("scenario '{}' cancelled by caller", scenario.name()),
            String::new(),
        )),
        outcome = scenario.run(ctx) => outcome,
        () = tokio::time::sleep(scenario.timeout()) => Err(ScenarioFailure::new(
            format!(
                "scenario '{}' timed out after {:?}",
                scenario.name(),
                scenario.timeout()
            ),
            String::new(),
        )),
    };

    let end_time = Utc::now();
    let duration = started.elapsed();

    let metrics = if ctx.cancel.is_cancelled() {
        None
    } else {
        collect_system_metrics(&ctx.shell, &ctx.cancel).await
    };

    let result = match outcome {
        Ok(output) => TestResult {
            test_name: scenario.name().to_string(),
            success: true,
            start_time,
            end_time,
            duration_ms: duration.as_millis().try_into().unwrap_or(u64::MAX),
            output,
            error: String::new(),
            instance_id: ctx.instance.id.clone(),
            metrics,
        },
        Err(failure) => TestResult {
            test_name: scenario.name().to_string(),
            success: false,
            start_time,
            end_time,
            duration_ms: duration.as_millis().try_into().unwrap_or(u64::MAX),
            output: failure.output,
            error: failure.message,
            instance_id: ctx.instance.id.clone(),
            metrics,
        },
    };

    if result.success {
        info!(
            instance_id = %ctx.instance.id,
            scenario = scenario.name(),
            duration_ms = result.duration_ms,
            "scenario passed"
        );
    } else {
        warn!(
            instance_id = %ctx.instance.id,
            scenario = scenario.name(),
            duration_ms = result.duration_ms,
            error = %result.error,
            "scenario failed"
        );
    }

    result
}

/// Run every registered scenario sequentially against one instance.
///
/// Scenarios share the guest's state, so they never overlap on one
/// instance. A failing scenario does not abort the rest; cancellation
/// stops the sequence after the scenario that observed it.
pub async fn run_all(registry: &ScenarioRegistry, ctx: &ScenarioContext<'_>) -> Vec<TestResult> {
    let mut results = Vec::with_capacity(registry.len());
    for scenario in registry.iter() {
        results.push(run_scenario(ctx, scenario.as_ref()).await);
        if ctx.cancel.is_cancelled() {
            debug!(
                instance_id = %ctx.instance.id,
                completed = results.len(),
                "scenario run aborted by cancellation"
            );
            break;
        }
    }
    results
}
