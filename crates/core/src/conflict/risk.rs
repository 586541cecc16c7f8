//! Aggregate risk over a set of conflicts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::types::{Conflict, ConflictType, Severity};

/// Above this many conflicts a batch is at least medium risk.
const MEDIUM_RISK_CONFLICT_COUNT: usize = 10;

/// Overall verdict with per-severity and per-type counts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskAnalysis {
    pub total_conflicts: usize,
    pub overall_risk: Severity,
    /// Only severities that occur.
    pub severity_distribution: BTreeMap<Severity, usize>,
    /// Only types that occur.
    pub type_distribution: BTreeMap<ConflictType, usize>,
    pub recommendation: String,
}

pub fn analyze_risk(conflicts: &[Conflict]) -> RiskAnalysis {
    let mut severity_distribution = BTreeMap::new();
    let mut type_distribution = BTreeMap::new();
    for c in conflicts {
        *severity_distribution.entry(c.severity).or_insert(0) += 1;
        *type_distribution.entry(c.conflict_type).or_insert(0) += 1;
    }

    let total = conflicts.len();
    let high = severity_distribution.get(&Severity::High).copied().unwrap_or(0);

    let overall_risk = if severity_distribution.contains_key(&Severity::Critical) {
        Severity::Critical
    } else if high * 2 > total {
        Severity::High
    } else if total > MEDIUM_RISK_CONFLICT_COUNT {
        Severity::Medium
    } else {
        Severity::Low
    };

    let recommendation = match overall_risk {
        Severity::Critical => "Critical conflicts present: review manually before applying",
        Severity::High => "Most conflicts are high severity: apply with the conservative strategy",
        Severity::Medium => "Many conflicts detected: review the automatic resolutions",
        Severity::Low => "Low risk: automatic resolution is appropriate",
    }
    .to_string();

    RiskAnalysis {
        total_conflicts: total,
        overall_risk,
        severity_distribution,
        type_distribution,
        recommendation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflict(severity: Severity) -> Conflict {
        let mut c = Conflict::new("a.rs", ConflictType::Content, 1, "x", "y");
        c.severity = severity;
        c
    }

    #[test]
    fn test_empty_is_low() {
        let analysis = analyze_risk(&[]);
        assert_eq!(analysis.overall_risk, Severity::Low);
        assert_eq!(analysis.total_conflicts, 0);
        assert!(analysis.severity_distribution.is_empty());
        assert!(analysis.type_distribution.is_empty());
    }

    #[test]
    fn test_any_critical_wins() {
        let analysis = analyze_risk(&[conflict(Severity::Low), conflict(Severity::Critical)]);
        assert_eq!(analysis.overall_risk, Severity::Critical);
    }

    #[test]
    fn test_high_needs_strict_majority() {
        let half = [conflict(Severity::High), conflict(Severity::Low)];
        assert_eq!(analyze_risk(&half).overall_risk, Severity::Low);

        let majority = [
            conflict(Severity::High),
            conflict(Severity::High),
            conflict(Severity::Low),
        ];
        assert_eq!(analyze_risk(&majority).overall_risk, Severity::High);
    }

    #[test]
    fn test_many_conflicts_is_medium() {
        let many: Vec<_> = (0..11).map(|_| conflict(Severity::Low)).collect();
        let analysis = analyze_risk(&many);
        assert_eq!(analysis.overall_risk, Severity::Medium);
        assert_eq!(analysis.severity_distribution.get(&Severity::Low), Some(&11));
        assert_eq!(analysis.type_distribution.get(&ConflictType::Content), Some(&11));
    }
}
