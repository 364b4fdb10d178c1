//! Composite health scoring from collected signals.
//!
//! Pure logic; no database or network access. Signals are collected by
//! earlier steps and signal providers and handed in as a read-only
//! [`SignalSet`].

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, ScoringError};

// ---------------------------------------------------------------------------
// Well-known signal names
// ---------------------------------------------------------------------------

/// Sessions connected to the maintained database.
pub const SIGNAL_ACTIVE_CONNECTIONS: &str = "active_connections";
/// Versions older than the stale-version age threshold.
pub const SIGNAL_STALE_VERSIONS: &str = "stale_versions";
/// Rows across all versioning delta tables.
pub const SIGNAL_DELTA_TABLE_ROWS: &str = "delta_table_rows";
/// Days since the last successful compress.
pub const SIGNAL_DAYS_SINCE_LAST_COMPRESS: &str = "days_since_last_compress";
/// Invalid geometries found by the geometry check.
pub const SIGNAL_GEOMETRY_ERRORS: &str = "geometry_errors";
/// Rows in the versioning state table.
pub const SIGNAL_STATE_COUNT: &str = "state_count";

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// A measured signal value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Number(f64),
    Category(String),
}

impl From<f64> for SignalValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<i64> for SignalValue {
    fn from(v: i64) -> Self {
        Self::Number(v as f64)
    }
}

impl From<&str> for SignalValue {
    fn from(v: &str) -> Self {
        Self::Category(v.to_string())
    }
}

/// A signal entry: either measured, or unavailable with a reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SignalReading {
    Available { value: SignalValue },
    Unavailable { reason: String },
}

/// Snapshot of all collected signals, keyed by signal name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalSet(BTreeMap<String, SignalReading>);

impl SignalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a measured value.
    ///
    /// The first available value for a signal wins; it replaces an earlier
    /// unavailable entry but is never overwritten.
    pub fn record(&mut self, name: impl Into<String>, value: impl Into<SignalValue>) {
        let name = name.into();
        match self.0.get(&name) {
            Some(SignalReading::Available { .. }) => {}
            _ => {
                self.0.insert(
                    name,
                    SignalReading::Available {
                        value: value.into(),
                    },
                );
            }
        }
    }

    /// Record that a signal could not be measured, unless a value exists.
    pub fn mark_unavailable(&mut self, name: impl Into<String>, reason: impl Into<String>) {
        self.0
            .entry(name.into())
            .or_insert_with(|| SignalReading::Unavailable {
                reason: reason.into(),
            });
    }

    pub fn get(&self, name: &str) -> Option<&SignalReading> {
        self.0.get(name)
    }

    /// Whether an available value is already recorded for `name`.
    pub fn has_value(&self, name: &str) -> bool {
        matches!(self.0.get(name), Some(SignalReading::Available { .. }))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SignalReading)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// How a signal's healthy range is declared and penalised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ThresholdRule {
    /// Numeric range. Each unit outside `[min, max]` costs
    /// `penalty_per_unit`, capped at `max_penalty`.
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        penalty_per_unit: f64,
        max_penalty: f64,
    },
    /// Categorical value. Anything outside `healthy` costs `penalty`.
    OneOf { healthy: Vec<String>, penalty: f64 },
}

/// A scored signal and its rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalThreshold {
    pub signal: String,
    #[serde(flatten)]
    pub rule: ThresholdRule,
}

impl SignalThreshold {
    /// Numeric rule penalising values above `max`.
    pub fn at_most(signal: &str, max: f64, penalty_per_unit: f64, max_penalty: f64) -> Self {
        Self {
            signal: signal.to_string(),
            rule: ThresholdRule::Range {
                min: None,
                max: Some(max),
                penalty_per_unit,
                max_penalty,
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::InvalidThreshold {
            signal: self.signal.clone(),
            reason,
        };
        if self.signal.trim().is_empty() {
            return Err(invalid("signal name must not be empty".to_string()));
        }
        match &self.rule {
            ThresholdRule::Range {
                min,
                max,
                penalty_per_unit,
                max_penalty,
            } => {
                if min.is_none() && max.is_none() {
                    return Err(invalid("range needs at least one of min/max".to_string()));
                }
                if min.is_some_and(|v| !v.is_finite()) || max.is_some_and(|v| !v.is_finite()) {
                    return Err(invalid("range bounds must be finite".to_string()));
                }
                if let (Some(lo), Some(hi)) = (min, max) {
                    if lo > hi {
                        return Err(invalid(format!("min ({lo}) exceeds max ({hi})")));
                    }
                }
                if !penalty_per_unit.is_finite() || *penalty_per_unit < 0.0 {
                    return Err(invalid(format!(
                        "penalty_per_unit must be a non-negative number, got {penalty_per_unit}"
                    )));
                }
                validate_penalty(*max_penalty).map_err(invalid)?;
            }
            ThresholdRule::OneOf { healthy, penalty } => {
                if healthy.is_empty() {
                    return Err(invalid("healthy value list must not be empty".to_string()));
                }
                validate_penalty(*penalty).map_err(invalid)?;
            }
        }
        Ok(())
    }

    /// Penalty for `value`, or the reason it cannot be scored.
    fn penalty_for(&self, value: &SignalValue) -> Result<f64, String> {
        match (&self.rule, value) {
            (
                ThresholdRule::Range {
                    min,
                    max,
                    penalty_per_unit,
                    max_penalty,
                },
                SignalValue::Number(v),
            ) => {
                if !v.is_finite() {
                    return Err(format!("non-finite value {v}"));
                }
                let distance = match (min, max) {
                    (Some(lo), _) if v < lo => lo - v,
                    (_, Some(hi)) if v > hi => v - hi,
                    _ => 0.0,
                };
                Ok((distance * penalty_per_unit).min(*max_penalty))
            }
            (ThresholdRule::OneOf { healthy, penalty }, SignalValue::Category(c)) => {
                if healthy.iter().any(|h| h.eq_ignore_ascii_case(c)) {
                    Ok(0.0)
                } else {
                    Ok(*penalty)
                }
            }
            (ThresholdRule::Range { .. }, SignalValue::Category(c)) => {
                Err(format!("expected a numeric value, got '{c}'"))
            }
            (ThresholdRule::OneOf { .. }, SignalValue::Number(v)) => {
                Err(format!("expected a categorical value, got {v}"))
            }
        }
    }
}

fn validate_penalty(penalty: f64) -> Result<(), String> {
    if !penalty.is_finite() || !(0.0..=100.0).contains(&penalty) {
        return Err(format!("penalty cap must be within 0..=100, got {penalty}"));
    }
    Ok(())
}

/// Default threshold table.
///
/// These are starting points; every value is expected to be tuned per site
/// through configuration.
pub fn default_thresholds() -> Vec<SignalThreshold> {
    vec![
        SignalThreshold::at_most(SIGNAL_ACTIVE_CONNECTIONS, 100.0, 0.5, 10.0),
        SignalThreshold::at_most(SIGNAL_STALE_VERSIONS, 0.0, 2.0, 20.0),
        SignalThreshold::at_most(SIGNAL_DELTA_TABLE_ROWS, 100_000.0, 0.0001, 25.0),
        SignalThreshold::at_most(SIGNAL_DAYS_SINCE_LAST_COMPRESS, 7.0, 3.0, 25.0),
        SignalThreshold::at_most(SIGNAL_GEOMETRY_ERRORS, 0.0, 1.0, 60.0),
        SignalThreshold::at_most(SIGNAL_STATE_COUNT, 10_000.0, 0.00075, 30.0),
    ]
}

// ---------------------------------------------------------------------------
// Grades
// ---------------------------------------------------------------------------

/// Severity grade derived from the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    Healthy,
    Warning,
    Critical,
}

impl Grade {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimum scores for each grade. Below `warning_min` is Critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeCutoffs {
    pub healthy_min: u8,
    pub warning_min: u8,
}

impl Default for GradeCutoffs {
    fn default() -> Self {
        Self {
            healthy_min: 80,
            warning_min: 50,
        }
    }
}

impl GradeCutoffs {
    pub fn grade(&self, score: u8) -> Grade {
        if score >= self.healthy_min {
            Grade::Healthy
        } else if score >= self.warning_min {
            Grade::Warning
        } else {
            Grade::Critical
        }
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.healthy_min > 100 {
            return Err(ConfigurationError::InvalidGradeCutoffs(format!(
                "healthy_min ({}) exceeds 100",
                self.healthy_min
            )));
        }
        if self.warning_min >= self.healthy_min {
            return Err(ConfigurationError::InvalidGradeCutoffs(format!(
                "warning_min ({}) must be below healthy_min ({})",
                self.warning_min, self.healthy_min
            )));
        }
        Ok(())
    }
}

/// Threshold table plus grade cutoffs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_thresholds")]
    pub thresholds: Vec<SignalThreshold>,
    #[serde(default)]
    pub cutoffs: GradeCutoffs,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            thresholds: default_thresholds(),
            cutoffs: GradeCutoffs::default(),
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.cutoffs.validate()?;
        let mut seen = HashSet::new();
        for threshold in &self.thresholds {
            threshold.validate()?;
            if !seen.insert(threshold.signal.as_str()) {
                return Err(ConfigurationError::InvalidThreshold {
                    signal: threshold.signal.clone(),
                    reason: "declared more than once".to_string(),
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Score
// ---------------------------------------------------------------------------

/// Penalty applied for one signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPenalty {
    pub signal: String,
    pub value: SignalValue,
    pub penalty: f64,
}

/// A threshold-covered signal left out of the score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedSignal {
    pub signal: String,
    pub reason: String,
}

/// Result of scoring a signal set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthScore {
    /// 0..=100, higher is healthier.
    pub score: u8,
    pub grade: Grade,
    /// Every scored signal, including those with a zero penalty.
    pub penalties: Vec<SignalPenalty>,
    /// Declared signals that were missing or unusable.
    pub excluded: Vec<ExcludedSignal>,
    /// Collected signals with no declared threshold.
    pub unscored: Vec<String>,
}

/// Maps a [`SignalSet`] to a bounded score and grade.
#[derive(Debug, Clone)]
pub struct HealthScorer {
    config: ScoringConfig,
}

impl HealthScorer {
    /// Build a scorer after validating the threshold table and cutoffs.
    pub fn new(config: ScoringConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score `signals`.
    ///
    /// Starts at 100 and subtracts each signal's capped penalty; the penalty
    /// sum is clamped to 100. Missing or unusable signals are excluded rather
    /// than penalised. Fails only when no declared signal could be scored.
    pub fn score(&self, signals: &SignalSet) -> Result<HealthScore, ScoringError> {
        let mut penalties = Vec::new();
        let mut excluded = Vec::new();

        for threshold in &self.config.thresholds {
            match signals.get(&threshold.signal) {
                None => excluded.push(ExcludedSignal {
                    signal: threshold.signal.clone(),
                    reason: "not collected".to_string(),
                }),
                Some(SignalReading::Unavailable { reason }) => excluded.push(ExcludedSignal {
                    signal: threshold.signal.clone(),
                    reason: reason.clone(),
                }),
                Some(SignalReading::Available { value }) => match threshold.penalty_for(value) {
                    Ok(penalty) => penalties.push(SignalPenalty {
                        signal: threshold.signal.clone(),
                        value: value.clone(),
                        penalty,
                    }),
                    Err(reason) => excluded.push(ExcludedSignal {
                        signal: threshold.signal.clone(),
                        reason,
                    }),
                },
            }
        }

        if penalties.is_empty() {
            return Err(ScoringError::NoSignals {
                excluded: excluded.len(),
            });
        }

        let total: f64 = penalties.iter().map(|p| p.penalty).sum::<f64>().clamp(0.0, 100.0);
        let score = (100.0 - total).round().clamp(0.0, 100.0) as u8;

        let declared: HashSet<&str> = self
            .config
            .thresholds
            .iter()
            .map(|t| t.signal.as_str())
            .collect();
        let unscored = signals
            .iter()
            .filter(|(name, _)| !declared.contains(name.as_str()))
            .map(|(name, _)| name.clone())
            .collect();

        Ok(HealthScore {
            score,
            grade: self.config.cutoffs.grade(score),
            penalties,
            excluded,
            unscored,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn scorer() -> HealthScorer {
        HealthScorer::new(ScoringConfig::default()).unwrap()
    }

    fn healthy_signals() -> SignalSet {
        let mut s = SignalSet::new();
        s.record(SIGNAL_ACTIVE_CONNECTIONS, 3.0);
        s.record(SIGNAL_STALE_VERSIONS, 0.0);
        s.record(SIGNAL_DELTA_TABLE_ROWS, 1_200.0);
        s.record(SIGNAL_DAYS_SINCE_LAST_COMPRESS, 1.0);
        s.record(SIGNAL_GEOMETRY_ERRORS, 0.0);
        s
    }

    #[test]
    fn all_healthy_signals_score_100() {
        let result = scorer().score(&healthy_signals()).unwrap();
        assert_eq!(result.score, 100);
        assert_eq!(result.grade, Grade::Healthy);
        assert_eq!(result.penalties.len(), 5);
        assert_eq!(result.excluded.len(), 1, "state_count was not collected");
    }

    /// Healthy baseline with `name` overridden (first recorded value wins).
    fn healthy_signals_with(name: &str, value: f64) -> SignalSet {
        let mut s = SignalSet::new();
        s.record(name, value);
        for (k, v) in healthy_signals().iter() {
            if let SignalReading::Available { value } = v {
                s.record(k.clone(), value.clone());
            }
        }
        s
    }

    #[test]
    fn penalty_is_linear_above_threshold() {
        let result = scorer()
            .score(&healthy_signals_with(SIGNAL_STALE_VERSIONS, 4.0))
            .unwrap();
        assert_eq!(result.score, 92);
    }

    #[test]
    fn single_signal_penalty_is_capped() {
        let result = scorer()
            .score(&healthy_signals_with(SIGNAL_GEOMETRY_ERRORS, 1_000_000.0))
            .unwrap();
        assert_eq!(result.score, 40);
        assert_eq!(result.grade, Grade::Critical);
    }

    #[test]
    fn penalty_sum_is_clamped_to_100() {
        let mut s = SignalSet::new();
        s.record(SIGNAL_ACTIVE_CONNECTIONS, 10_000.0);
        s.record(SIGNAL_STALE_VERSIONS, 10_000.0);
        s.record(SIGNAL_DELTA_TABLE_ROWS, 1e12);
        s.record(SIGNAL_DAYS_SINCE_LAST_COMPRESS, 365.0);
        s.record(SIGNAL_GEOMETRY_ERRORS, 1e9);
        s.record(SIGNAL_STATE_COUNT, 1e9);

        let result = scorer().score(&s).unwrap();
        assert_eq!(result.score, 0);
        assert_eq!(result.grade, Grade::Critical);
    }

    #[test]
    fn scoring_is_deterministic() {
        let mut s = healthy_signals();
        s.record(SIGNAL_STATE_COUNT, 23_456.0);
        let a = scorer().score(&s).unwrap();
        let b = scorer().score(&s).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_signals_never_lower_the_score() {
        let mut with_gap = SignalSet::new();
        with_gap.record(SIGNAL_STALE_VERSIONS, 6.0);
        with_gap.mark_unavailable(SIGNAL_GEOMETRY_ERRORS, "geometry check skipped");

        let mut omitted = SignalSet::new();
        omitted.record(SIGNAL_STALE_VERSIONS, 6.0);

        let a = scorer().score(&with_gap).unwrap();
        let b = scorer().score(&omitted).unwrap();
        assert_eq!(a.score, b.score);
        assert!(a
            .excluded
            .iter()
            .any(|e| e.signal == SIGNAL_GEOMETRY_ERRORS && e.reason == "geometry check skipped"));
    }

    #[test]
    fn wrong_value_type_is_excluded_not_penalised() {
        let mut s = SignalSet::new();
        s.record(SIGNAL_STALE_VERSIONS, 0.0);
        s.record(SIGNAL_GEOMETRY_ERRORS, "lots");

        let result = scorer().score(&s).unwrap();
        assert_eq!(result.score, 100);
        assert!(result.excluded.iter().any(|e| e.signal == SIGNAL_GEOMETRY_ERRORS));
    }

    #[test]
    fn categorical_rule_penalises_unhealthy_values() {
        let config = ScoringConfig {
            thresholds: vec![SignalThreshold {
                signal: "server_status".into(),
                rule: ThresholdRule::OneOf {
                    healthy: vec!["STARTED".into()],
                    penalty: 35.0,
                },
            }],
            cutoffs: GradeCutoffs::default(),
        };
        let scorer = HealthScorer::new(config).unwrap();

        let mut s = SignalSet::new();
        s.record("server_status", "started");
        assert_eq!(scorer.score(&s).unwrap().score, 100);

        let mut s = SignalSet::new();
        s.record("server_status", "STOPPED");
        let result = scorer.score(&s).unwrap();
        assert_eq!(result.score, 65);
        assert_eq!(result.grade, Grade::Warning);
    }

    #[test]
    fn minimum_bound_penalises_values_below() {
        let config = ScoringConfig {
            thresholds: vec![SignalThreshold {
                signal: "free_space_pct".into(),
                rule: ThresholdRule::Range {
                    min: Some(20.0),
                    max: None,
                    penalty_per_unit: 2.0,
                    max_penalty: 50.0,
                },
            }],
            cutoffs: GradeCutoffs::default(),
        };
        let scorer = HealthScorer::new(config).unwrap();
        let mut s = SignalSet::new();
        s.record("free_space_pct", 15.0);
        assert_eq!(scorer.score(&s).unwrap().score, 90);
    }

    #[test]
    fn no_available_signal_is_a_scoring_error() {
        let mut s = SignalSet::new();
        s.mark_unavailable(SIGNAL_ACTIVE_CONNECTIONS, "database unreachable");
        assert_matches!(
            scorer().score(&s),
            Err(ScoringError::NoSignals { excluded: 6 })
        );
    }

    #[test]
    fn unscored_signals_are_listed() {
        let mut s = healthy_signals();
        s.record("portal_items_backed_up", 12.0);
        let result = scorer().score(&s).unwrap();
        assert_eq!(result.unscored, vec!["portal_items_backed_up".to_string()]);
    }

    #[test]
    fn first_available_value_wins() {
        let mut s = SignalSet::new();
        s.mark_unavailable(SIGNAL_STATE_COUNT, "provider failed");
        s.record(SIGNAL_STATE_COUNT, 10.0);
        s.record(SIGNAL_STATE_COUNT, 99.0);
        s.mark_unavailable(SIGNAL_STATE_COUNT, "late failure");
        assert_eq!(
            s.get(SIGNAL_STATE_COUNT),
            Some(&SignalReading::Available {
                value: SignalValue::Number(10.0)
            })
        );
    }

    #[test]
    fn cutoffs_map_scores_to_grades() {
        let cutoffs = GradeCutoffs::default();
        assert_eq!(cutoffs.grade(100), Grade::Healthy);
        assert_eq!(cutoffs.grade(80), Grade::Healthy);
        assert_eq!(cutoffs.grade(79), Grade::Warning);
        assert_eq!(cutoffs.grade(50), Grade::Warning);
        assert_eq!(cutoffs.grade(49), Grade::Critical);
        assert_eq!(cutoffs.grade(0), Grade::Critical);
    }

    #[test]
    fn inverted_cutoffs_are_rejected() {
        let config = ScoringConfig {
            thresholds: default_thresholds(),
            cutoffs: GradeCutoffs {
                healthy_min: 50,
                warning_min: 80,
            },
        };
        assert_matches!(
            HealthScorer::new(config),
            Err(ConfigurationError::InvalidGradeCutoffs(_))
        );
    }

    #[test]
    fn malformed_thresholds_are_rejected() {
        let negative = ScoringConfig {
            thresholds: vec![SignalThreshold::at_most("x", 1.0, -1.0, 10.0)],
            cutoffs: GradeCutoffs::default(),
        };
        assert_matches!(
            HealthScorer::new(negative),
            Err(ConfigurationError::InvalidThreshold { .. })
        );

        let duplicated = ScoringConfig {
            thresholds: vec![
                SignalThreshold::at_most("x", 1.0, 1.0, 10.0),
                SignalThreshold::at_most("x", 2.0, 1.0, 10.0),
            ],
            cutoffs: GradeCutoffs::default(),
        };
        assert_matches!(
            HealthScorer::new(duplicated),
            Err(ConfigurationError::InvalidThreshold { .. })
        );

        let unbounded = ScoringConfig {
            thresholds: vec![SignalThreshold {
                signal: "x".into(),
                rule: ThresholdRule::Range {
                    min: None,
                    max: None,
                    penalty_per_unit: 1.0,
                    max_penalty: 10.0,
                },
            }],
            cutoffs: GradeCutoffs::default(),
        };
        assert!(HealthScorer::new(unbounded).is_err());
    }

    #[test]
    fn threshold_table_deserializes_from_json() {
        let config: ScoringConfig = serde_json::from_str(
            r#"{
                "thresholds": [
                    {"signal": "geometry_errors", "rule": "range", "max": 0, "penalty_per_unit": 1, "max_penalty": 60},
                    {"signal": "server_status", "rule": "one_of", "healthy": ["STARTED"], "penalty": 20}
                ],
                "cutoffs": {"healthy_min": 85, "warning_min": 60}
            }"#,
        )
        .unwrap();
        assert_eq!(config.thresholds.len(), 2);
        assert_eq!(config.cutoffs.healthy_min, 85);
        assert!(config.validate().is_ok());
    }
}
