//! Trigger gating for scheduled image pipeline ticks.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use ueps_state::DependencySnapshot;

use super::schedule::Schedule;

/// When a scheduled tick may start a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCondition {
    /// Build on every tick.
    Always,
    /// Build when the schedule matches.
    ScheduleMatchOnly,
    /// Build when the schedule matches and the base image or a component
    /// is newer than at the last successful build.
    ScheduleMatchAndDependencyUpdated,
}

impl TriggerCondition {
    pub fn needs_schedule(&self) -> bool {
        !matches!(self, TriggerCondition::Always)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerCondition::Always => "always",
            TriggerCondition::ScheduleMatchOnly => "schedule_match_only",
            TriggerCondition::ScheduleMatchAndDependencyUpdated => {
                "schedule_match_and_dependency_updated"
            }
        }
    }
}

impl fmt::Display for TriggerCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a tick did not build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ScheduleNotMatched,
    DependenciesUnchanged,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ScheduleNotMatched => f.write_str("schedule did not match"),
            SkipReason::DependenciesUnchanged => f.write_str("no dependency is newer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Run,
    Skip(SkipReason),
}

/// True when `candidate` is strictly newer than `recorded`.
///
/// Semver values compare by precedence; anything else counts as newer only
/// when the text differs.
fn is_newer(candidate: &str, recorded: &str) -> bool {
    match (Version::parse(candidate), Version::parse(recorded)) {
        (Ok(c), Ok(r)) => c > r,
        _ => candidate != recorded,
    }
}

/// Dependencies that are newer in `current` than in `previous`.
///
/// With no previous snapshot every dependency counts as updated. A
/// dependency missing from the previous snapshot is updated; one that went
/// backwards is not.
pub fn updated_dependencies(
    previous: Option<&DependencySnapshot>,
    current: &BTreeMap<String, String>,
) -> Vec<String> {
    let Some(previous) = previous else {
        return current.keys().cloned().collect();
    };
    current
        .iter()
        .filter(|(name, version)| match previous.versions.get(*name) {
            Some(recorded) => is_newer(version, recorded),
            None => true,
        })
        .map(|(name, _)| name.clone())
        .collect()
}

/// Decide whether a scheduled tick at `now` builds.
pub fn evaluate_gate(
    condition: TriggerCondition,
    schedule: Option<&Schedule>,
    now: DateTime<Utc>,
    previous: Option<&DependencySnapshot>,
    current: &BTreeMap<String, String>,
) -> GateDecision {
    if condition == TriggerCondition::Always {
        return GateDecision::Run;
    }

    let matched = schedule.map(|s| s.matches(now)).unwrap_or(false);
    if !matched {
        return GateDecision::Skip(SkipReason::ScheduleNotMatched);
    }

    match condition {
        TriggerCondition::ScheduleMatchAndDependencyUpdated
            if previous.is_some() && updated_dependencies(previous, current).is_empty() =>
        {
            GateDecision::Skip(SkipReason::DependenciesUnchanged)
        }
        _ => GateDecision::Run,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn versions(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn monday_nine() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
    }

    fn schedule() -> Schedule {
        Schedule::parse("0 9 * * MON").unwrap()
    }

    #[test]
    fn test_always_ignores_schedule() {
        let decision = evaluate_gate(
            TriggerCondition::Always,
            None,
            monday_nine(),
            None,
            &BTreeMap::new(),
        );
        assert_eq!(decision, GateDecision::Run);
    }

    #[test]
    fn test_schedule_match_only() {
        let s = schedule();
        let current = versions(&[("nvidia", "0.0.5")]);
        let snap = DependencySnapshot::new(current.clone());
        assert_eq!(
            evaluate_gate(TriggerCondition::ScheduleMatchOnly, Some(&s), monday_nine(), Some(&snap), &current),
            GateDecision::Run
        );
        let off = monday_nine() + chrono::Duration::minutes(1);
        assert_eq!(
            evaluate_gate(TriggerCondition::ScheduleMatchOnly, Some(&s), off, Some(&snap), &current),
            GateDecision::Skip(SkipReason::ScheduleNotMatched)
        );
    }

    #[test]
    fn test_dependency_gate_unchanged_skips() {
        let s = schedule();
        let current = versions(&[("base", "2024.1.0"), ("nvidia", "0.0.5")]);
        let snap = DependencySnapshot::new(current.clone());
        assert_eq!(
            evaluate_gate(
                TriggerCondition::ScheduleMatchAndDependencyUpdated,
                Some(&s),
                monday_nine(),
                Some(&snap),
                &current
            ),
            GateDecision::Skip(SkipReason::DependenciesUnchanged)
        );
    }

    #[test]
    fn test_dependency_gate_newer_runs() {
        let s = schedule();
        let snap = DependencySnapshot::new(versions(&[("base", "2024.1.0"), ("nvidia", "0.0.5")]));
        let current = versions(&[("base", "2024.2.0"), ("nvidia", "0.0.5")]);
        assert_eq!(
            evaluate_gate(
                TriggerCondition::ScheduleMatchAndDependencyUpdated,
                Some(&s),
                monday_nine(),
                Some(&snap),
                &current
            ),
            GateDecision::Run
        );
    }

    #[test]
    fn test_dependency_gate_without_history_runs() {
        let s = schedule();
        let current = versions(&[("nvidia", "0.0.5")]);
        assert_eq!(
            evaluate_gate(
                TriggerCondition::ScheduleMatchAndDependencyUpdated,
                Some(&s),
                monday_nine(),
                None,
                &current
            ),
            GateDecision::Run
        );
    }

    #[test]
    fn test_updated_dependencies_rules() {
        let snap = DependencySnapshot::new(versions(&[("a", "1.0.0"), ("b", "0.0.10")]));
        // downgrade is not newer; semver, not lexical, ordering
        let current = versions(&[("a", "0.9.0"), ("b", "0.0.9")]);
        assert!(updated_dependencies(Some(&snap), &current).is_empty());

        // new dependency counts as updated
        let current = versions(&[("a", "1.0.0"), ("b", "0.0.10"), ("c", "0.0.1")]);
        assert_eq!(updated_dependencies(Some(&snap), &current), vec!["c".to_string()]);

        // non-semver values compare by inequality
        let snap = DependencySnapshot::new(versions(&[("base", "latest-a")]));
        let current = versions(&[("base", "latest-b")]);
        assert_eq!(updated_dependencies(Some(&snap), &current).len(), 1);
    }

    #[test]
    fn test_condition_serde() {
        let c: TriggerCondition =
            serde_json::from_str("\"schedule_match_and_dependency_updated\"").unwrap();
        assert_eq!(c, TriggerCondition::ScheduleMatchAndDependencyUpdated);
        assert!(c.needs_schedule());
        assert!(!TriggerCondition::Always.needs_schedule());
    }
}
