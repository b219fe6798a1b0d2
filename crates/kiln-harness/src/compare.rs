//! Run-over-run result comparison.
//!
//! A comparison is a derived, read-only report computed fresh on every
//! call; only the underlying result sets are ever persisted.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::results::TestResult;

/// Classification of one test across two runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    /// Failed previously, passes now.
    Improved,
    /// Passed previously, fails now.
    Regressed,
    /// Passed in both runs.
    StablePass,
    /// Failed in both runs.
    StableFail,
    /// Present only in the current run.
    New,
    /// Present only in the previous run.
    Removed,
}

impl TestStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Improved => "improved",
            Self::Regressed => "regressed",
            Self::StablePass => "stable_pass",
            Self::StableFail => "stable_fail",
            Self::New => "new",
            Self::Removed => "removed",
        }
    }
}

/// Qualitative duration movement between two runs of the same test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationStatus {
    Faster,
    Slower,
    Same,
}

/// Per-test comparison detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestComparisonDetail {
    pub test_name: String,
    pub status: TestStatus,
    pub current: Option<TestResult>,
    pub previous: Option<TestResult>,
    /// Signed current − previous duration, present only when both sides
    /// exist.
    pub duration_delta_ms: Option<i64>,
    pub duration_status: Option<DurationStatus>,
}

/// Aggregate comparison of a current run against a previous one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestComparison {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub improved: usize,
    pub regressed: usize,
    pub new: usize,
    pub removed: usize,
    pub details: Vec<TestComparisonDetail>,
}

/// Classify every test in `current` against `previous`.
///
/// Details are emitted in `current` order (registry order for a scenario
/// run) followed by removed tests in `previous` order.
#[must_use]
pub fn compare_results(current: &[TestResult], previous: &[TestResult]) -> TestComparison {
    let previous_by_name: HashMap<&str, &TestResult> = previous
        .iter()
        .map(|r| (r.test_name.as_str(), r))
        .collect();
    let current_names: HashSet<&str> = current.iter().map(|r| r.test_name.as_str()).collect();

    let mut comparison = TestComparison {
        total: current.len(),
        passed: current.iter().filter(|r| r.success).count(),
        failed: current.iter().filter(|r| !r.success).count(),
        improved: 0,
        regressed: 0,
        new: 0,
        removed: 0,
        details: Vec::with_capacity(current.len()),
    };

    for result in current {
        let prior = previous_by_name.get(result.test_name.as_str()).copied();
        let status = match prior {
            None => TestStatus::New,
            Some(p) if !p.success && result.success => TestStatus::Improved,
            Some(p) if p.success && !result.success => TestStatus::Regressed,
            Some(_) if result.success => TestStatus::StablePass,
            Some(_) => TestStatus::StableFail,
        };
        match status {
            TestStatus::New => comparison.new += 1,
            TestStatus::Improved => comparison.improved += 1,
            TestStatus::Regressed => comparison.regressed += 1,
            _ => {}
        }

        let duration_delta_ms = prior.map(|p| {
            i64::try_from(result.duration_ms).unwrap_or(i64::MAX)
                - i64::try_from(p.duration_ms).unwrap_or(i64::MAX)
        });
        let duration_status = duration_delta_ms.map(|delta| match delta.cmp(&0) {
            std::cmp::Ordering::Less => DurationStatus::Faster,
            std::cmp::Ordering::Greater => DurationStatus::Slower,
            std::cmp::Ordering::Equal => DurationStatus::Same,
        });

        comparison.details.push(TestComparisonDetail {
            test_name: result.test_name.clone(),
            status,
            current: Some(result.clone()),
            previous: prior.cloned(),
            duration_delta_ms,
            duration_status,
        });
    }

    for prior in previous {
        if current_names.contains(prior.test_name.as_str()) {
            continue;
        }
        comparison.removed += 1;
        comparison.details.push(TestComparisonDetail {
            test_name: prior.test_name.clone(),
            status: TestStatus::Removed,
            current: None,
            previous: Some(prior.clone()),
            duration_delta_ms: None,
            duration_status: None,
        });
    }

    comparison
}
