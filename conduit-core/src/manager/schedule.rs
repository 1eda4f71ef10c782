//! Due-ness rules: schedule conditions and dependency gating.

use crate::config::Schedule;
use crate::types::{ExecutionResult, PipelineRunState};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Whether the schedule alone makes the pipeline due at `now`.
///
/// Manual pipelines are only ever due through a trigger.
pub fn schedule_due(schedule: &Schedule, state: &PipelineRunState, now: DateTime<Utc>) -> bool {
    match schedule {
        Schedule::Manual => false,
        Schedule::Interval { every_secs } => match state.last_run_finished_at {
            None => true,
            Some(finished) => {
                let every = i64::try_from(*every_secs)
                    .ok()
                    .and_then(TimeDelta::try_seconds)
                    .unwrap_or(TimeDelta::MAX);
                now.signed_duration_since(finished) >= every
            }
        },
        Schedule::DailyAt { .. } => {
            let Some(Ok(time)) = schedule.daily_time() else {
                return false;
            };
            let today = now.date_naive().and_time(time).and_utc();
            now >= today && state.last_run_started_at.is_none_or(|started| started < today)
        }
    }
}

/// Whether the most recent finished run of `state` completed.
///
/// A run in flight does not count; the previous result stands until it ends.
fn last_run_succeeded(state: &PipelineRunState) -> bool {
    state
        .last_result
        .as_ref()
        .is_some_and(ExecutionResult::is_success)
}

/// Dependencies that still block a scheduled run.
///
/// A dependency is satisfied once its latest finished run succeeded more recently
/// than this pipeline last finished (any success counts if this pipeline never ran).
pub fn blocking_dependencies(
    dependencies: &BTreeSet<String>,
    own: &PipelineRunState,
    states: &BTreeMap<String, PipelineRunState>,
) -> Vec<String> {
    dependencies
        .iter()
        .filter(|dep| {
            let Some(state) = states.get(*dep) else {
                return true;
            };
            if !last_run_succeeded(state) {
                return true;
            }
            match (own.last_run_finished_at, state.last_run_finished_at) {
                (None, _) => false,
                (Some(mine), Some(theirs)) => theirs <= mine,
                (Some(_), None) => true,
            }
        })
        .cloned()
        .collect()
}

/// Dependencies whose latest finished run did not succeed. Used by `run_now`.
pub fn unsucceeded_dependencies(
    dependencies: &BTreeSet<String>,
    states: &BTreeMap<String, PipelineRunState>,
) -> Vec<String> {
    dependencies
        .iter()
        .filter(|dep| states.get(*dep).is_none_or(|s| !last_run_succeeded(s)))
        .cloned()
        .collect()
}
