//! Impact scoring for change summaries.

use crate::analysis::ResourceStatus;

use super::types::{PatternView, TransitionView};

/// Weighted sum of the change-summary factors, capped at 1.0.
pub fn impact_score(
    container_issues: &[String],
    event_patterns: &[PatternView],
    error_events: usize,
    warning_events: usize,
    transitions: &[TransitionView],
    event_count: usize,
) -> f64 {
    let mut score = 0.0;

    if !container_issues.is_empty() {
        // 0.25 base, growing with issue variety up to 0.40.
        score += (0.25 + 0.05 * (container_issues.len() as f64 - 1.0)).min(0.40);
    }

    if !event_patterns.is_empty() {
        score += (0.25 + 0.05 * (event_patterns.len() as f64 - 1.0)).min(0.35);
    }

    if error_events > 0 {
        score += 0.30;
    }
    if warning_events > 0 {
        score += 0.15;
    }

    if transitions.iter().any(|t| t.to == ResourceStatus::Error) {
        score += 0.30;
    }
    if transitions.iter().any(|t| t.to == ResourceStatus::Warning) {
        score += 0.15;
    }

    if event_count > 50 {
        score += 0.20;
    } else if event_count > 10 {
        score += 0.10;
    }

    score.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_resource_scores_zero() {
        assert_eq!(impact_score(&[], &[], 0, 0, &[], 3), 0.0);
    }

    #[test]
    fn score_is_capped_at_one() {
        let issues = vec!["CrashLoopBackOff".to_string(), "OOMKilled".to_string()];
        let patterns = vec![
            PatternView {
                pattern: "CrashLoopBackOff".into(),
                count: 7,
            },
            PatternView {
                pattern: "BackOff".into(),
                count: 3,
            },
        ];
        let transitions = vec![
            TransitionView {
                at: 1.into(),
                from: ResourceStatus::Running,
                to: ResourceStatus::Error,
                message: String::new(),
            },
            TransitionView {
                at: 2.into(),
                from: ResourceStatus::Error,
                to: ResourceStatus::Warning,
                message: String::new(),
            },
        ];
        let score = impact_score(&issues, &patterns, 5, 3, &transitions, 80);
        assert_eq!(score, 1.0);
    }

    #[test]
    fn volume_bonus_has_two_tiers() {
        let low = impact_score(&[], &[], 0, 0, &[], 11);
        let high = impact_score(&[], &[], 0, 0, &[], 51);
        assert_eq!(low, 0.10);
        assert_eq!(high, 0.20);
    }
}
