//! Disparate-rejection audit of the safety gate.
//!
//! Protected attributes are audit-only columns: they never enter the feature
//! matrix. The ratio reported per attribute compares group *rejection* rates
//! (min over max), so a low ratio means one group is rejected far more often
//! than another.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::domain::{is_low, pick};

pub const FOUR_FIFTHS_RULE: f64 = 0.8;
pub const MIN_AUDIT_SAMPLES: usize = 10;

/// Closed-open numeric range `[lower, upper)` mapped to a group label.
/// The final bin of a column is closed on both ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinRange {
    pub label: String,
    pub lower: f64,
    pub upper: f64,
}

impl BinRange {
    pub fn new(label: impl Into<String>, lower: f64, upper: f64) -> Self {
        Self {
            label: label.into(),
            lower,
            upper,
        }
    }

    /// `18-24`, `25-30` and `31+`.
    pub fn age_bins() -> Vec<BinRange> {
        vec![
            BinRange::new("18-24", 0.0, 25.0),
            BinRange::new("25-30", 25.0, 31.0),
            BinRange::new("31+", 31.0, 200.0),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeColumn {
    Categorical(Vec<Option<String>>),
    Continuous {
        values: Vec<Option<f64>>,
        bins: Vec<BinRange>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectedAttribute {
    pub name: String,
    pub column: AttributeColumn,
}

impl ProtectedAttribute {
    pub fn categorical(name: impl Into<String>, values: Vec<Option<String>>) -> Self {
        Self {
            name: name.into(),
            column: AttributeColumn::Categorical(values),
        }
    }

    pub fn continuous(name: impl Into<String>, values: Vec<Option<f64>>, bins: Vec<BinRange>) -> Self {
        Self {
            name: name.into(),
            column: AttributeColumn::Continuous { values, bins },
        }
    }

    pub fn len(&self) -> usize {
        match &self.column {
            AttributeColumn::Categorical(values) => values.len(),
            AttributeColumn::Continuous { values, .. } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Same attribute restricted to `rows`, in the given order.
    pub fn subset(&self, rows: &[usize]) -> Self {
        let column = match &self.column {
            AttributeColumn::Categorical(values) => AttributeColumn::Categorical(pick(values, rows)),
            AttributeColumn::Continuous { values, bins } => AttributeColumn::Continuous {
                values: pick(values, rows),
                bins: bins.clone(),
            },
        };
        Self {
            name: self.name.clone(),
            column,
        }
    }

    /// Group label per row; `None` for missing or out-of-range values.
    pub fn groups(&self) -> Vec<Option<String>> {
        match &self.column {
            AttributeColumn::Categorical(values) => values
                .iter()
                .map(|value| {
                    value
                        .as_deref()
                        .map(str::trim)
                        .filter(|value| !value.is_empty())
                        .map(str::to_owned)
                })
                .collect(),
            AttributeColumn::Continuous { values, bins } => values
                .iter()
                .map(|value| value.and_then(|value| bin_label(value, bins)))
                .collect(),
        }
    }
}

fn bin_label(value: f64, bins: &[BinRange]) -> Option<String> {
    let last = bins.len().checked_sub(1)?;
    bins.iter()
        .enumerate()
        .find(|(index, bin)| {
            value >= bin.lower
                && (value < bin.upper || (*index == last && value <= bin.upper))
        })
        .map(|(_, bin)| bin.label.clone())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FairnessAuditRow {
    pub attribute: String,
    pub group: String,
    pub n: usize,
    pub rejection_rate: f64,
    pub actual_low_rate: f64,
    pub rejection_rate_minus_actual: f64,
    pub rejection_di_ratio: f64,
    pub passes_80pct_rule: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSummary {
    pub attribute: String,
    pub n_groups: usize,
    pub rejection_di_ratio: f64,
    pub passes_80pct_rule: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    FewerThanTwoGroups,
    TooFewSamples,
    LengthMismatch,
}

impl SkipReason {
    pub const fn describe(self) -> &'static str {
        match self {
            SkipReason::FewerThanTwoGroups => "fewer than two groups present",
            SkipReason::TooFewSamples => "fewer than ten rows with a valid group",
            SkipReason::LengthMismatch => "column length differs from the audit pool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSkip {
    pub attribute: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateFairnessAudit {
    pub rows: Vec<FairnessAuditRow>,
    pub summaries: Vec<AttributeSummary>,
    pub skipped: Vec<AuditSkip>,
}

impl GateFairnessAudit {
    pub fn all_pass(&self) -> bool {
        self.summaries.iter().all(|summary| summary.passes_80pct_rule)
    }
}

/// Rejection-rate ratio across groups; 1.0 when no group is rejected.
pub fn rejection_di_ratio(rates: &[f64]) -> f64 {
    let max = rates.iter().copied().fold(0.0, f64::max);
    if max <= 0.0 {
        return 1.0;
    }
    let min = rates.iter().copied().fold(f64::INFINITY, f64::min);
    min / max
}

pub struct GateFairnessAuditor {
    threshold: f64,
    low_cutoff: f64,
}

impl GateFairnessAuditor {
    pub fn new(threshold: f64, low_cutoff: f64) -> Self {
        Self {
            threshold,
            low_cutoff,
        }
    }

    pub fn audit(
        &self,
        p_low: &[f64],
        scores: &[f64],
        attributes: &[ProtectedAttribute],
    ) -> GateFairnessAudit {
        let mut audit = GateFairnessAudit::default();

        for attribute in attributes {
            match self.audit_attribute(p_low, scores, attribute) {
                Ok((rows, summary)) => {
                    info!(
                        attribute = %summary.attribute,
                        ratio = summary.rejection_di_ratio,
                        passes = summary.passes_80pct_rule,
                        "gate fairness"
                    );
                    audit.rows.extend(rows);
                    audit.summaries.push(summary);
                }
                Err(reason) => {
                    warn!(
                        attribute = %attribute.name,
                        reason = reason.describe(),
                        "gate fairness audit skipped attribute"
                    );
                    audit.skipped.push(AuditSkip {
                        attribute: attribute.name.clone(),
                        reason,
                    });
                }
            }
        }

        audit
    }

    fn audit_attribute(
        &self,
        p_low: &[f64],
        scores: &[f64],
        attribute: &ProtectedAttribute,
    ) -> Result<(Vec<FairnessAuditRow>, AttributeSummary), SkipReason> {
        if attribute.len() != p_low.len() || scores.len() != p_low.len() {
            return Err(SkipReason::LengthMismatch);
        }

        let groups = attribute.groups();
        let mut order: Vec<String> = Vec::new();
        for group in groups.iter().flatten() {
            if !order.contains(group) {
                order.push(group.clone());
            }
        }

        if order.len() < 2 {
            return Err(SkipReason::FewerThanTwoGroups);
        }
        if groups.iter().flatten().count() < MIN_AUDIT_SAMPLES {
            return Err(SkipReason::TooFewSamples);
        }

        let mut rows: Vec<FairnessAuditRow> = order
            .iter()
            .map(|group| {
                let members: Vec<usize> = groups
                    .iter()
                    .enumerate()
                    .filter(|(_, label)| label.as_deref() == Some(group.as_str()))
                    .map(|(index, _)| index)
                    .collect();
                let n = members.len() as f64;
                let rejected = members
                    .iter()
                    .filter(|&&index| p_low[index] >= self.threshold)
                    .count();
                let low = members
                    .iter()
                    .filter(|&&index| is_low(scores[index], self.low_cutoff))
                    .count();
                let rejection_rate = rejected as f64 / n;
                let actual_low_rate = low as f64 / n;

                FairnessAuditRow {
                    attribute: attribute.name.clone(),
                    group: group.clone(),
                    n: members.len(),
                    rejection_rate,
                    actual_low_rate,
                    rejection_rate_minus_actual: rejection_rate - actual_low_rate,
                    rejection_di_ratio: 1.0,
                    passes_80pct_rule: true,
                }
            })
            .collect();

        let rates: Vec<f64> = rows.iter().map(|row| row.rejection_rate).collect();
        let ratio = rejection_di_ratio(&rates);
        let passes = ratio >= FOUR_FIFTHS_RULE;
        for row in &mut rows {
            row.rejection_di_ratio = ratio;
            row.passes_80pct_rule = passes;
        }

        Ok((
            rows,
            AttributeSummary {
                attribute: attribute.name.clone(),
                n_groups: order.len(),
                rejection_di_ratio: ratio,
                passes_80pct_rule: passes,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pattern: &[&str], repeat: usize) -> Vec<Option<String>> {
        pattern
            .iter()
            .cycle()
            .take(pattern.len() * repeat)
            .map(|value| Some((*value).to_owned()))
            .collect()
    }

    #[test]
    fn equal_rejection_rates_give_unit_ratio() {
        // Two groups of 10; the first three of each are rejected.
        let mut p_low = Vec::new();
        let mut groups = Vec::new();
        for group in ["a", "b"] {
            for index in 0..10 {
                p_low.push(if index < 3 { 0.9 } else { 0.1 });
                groups.push(Some(group.to_owned()));
            }
        }
        let scores = vec![20.0; 20];

        let audit = GateFairnessAuditor::new(0.5, 15.0).audit(
            &p_low,
            &scores,
            &[ProtectedAttribute::categorical("Gender", groups)],
        );

        assert_eq!(audit.rows.len(), 2);
        for row in &audit.rows {
            assert!((row.rejection_rate - 0.3).abs() < 1e-12);
            assert_eq!(row.rejection_di_ratio, 1.0);
            assert!(row.passes_80pct_rule);
            assert!((row.rejection_rate_minus_actual - 0.3).abs() < 1e-12);
        }
        assert!(audit.all_pass());
    }

    #[test]
    fn skewed_rejection_fails_four_fifths_rule() {
        let groups = labels(&["x", "y"], 10);
        // Rejects every "x" and half of "y".
        let p_low: Vec<f64> = (0..20)
            .map(|index| if index % 2 == 0 || index % 4 == 1 { 0.9 } else { 0.1 })
            .collect();

        let audit = GateFairnessAuditor::new(0.5, 15.0).audit(
            &p_low,
            &vec![10.0; 20],
            &[ProtectedAttribute::categorical("Race", groups)],
        );

        let summary = &audit.summaries[0];
        assert!((summary.rejection_di_ratio - 0.5).abs() < 1e-12);
        assert!(!summary.passes_80pct_rule);
        assert!(audit.rows.iter().all(|row| row.actual_low_rate == 1.0));
        assert!(!audit.all_pass());
    }

    #[test]
    fn no_rejections_count_as_parity() {
        assert_eq!(rejection_di_ratio(&[0.0, 0.0]), 1.0);
        let ratio = rejection_di_ratio(&[0.2, 0.4, 0.1]);
        assert!((0.0..=1.0).contains(&ratio));
        assert!((ratio - 0.25).abs() < 1e-12);
    }

    #[test]
    fn age_bins_are_left_closed_and_label_consistent() {
        let bins = BinRange::age_bins();
        assert_eq!(bin_label(24.9, &bins).as_deref(), Some("18-24"));
        assert_eq!(bin_label(25.0, &bins).as_deref(), Some("25-30"));
        assert_eq!(bin_label(30.0, &bins).as_deref(), Some("25-30"));
        assert_eq!(bin_label(31.0, &bins).as_deref(), Some("31+"));
        assert_eq!(bin_label(200.0, &bins).as_deref(), Some("31+"));
        assert_eq!(bin_label(250.0, &bins), None);
    }

    #[test]
    fn sparse_or_single_group_attributes_are_skipped() {
        let p_low = vec![0.2; 12];
        let scores = vec![20.0; 12];
        let single = ProtectedAttribute::categorical("Citizenship", labels(&["us"], 12));
        let mut sparse_values = vec![None; 12];
        sparse_values[0] = Some(40.0);
        sparse_values[1] = Some(20.0);
        let sparse = ProtectedAttribute::continuous("Age", sparse_values, BinRange::age_bins());

        let audit = GateFairnessAuditor::new(0.5, 15.0).audit(&p_low, &scores, &[single, sparse]);

        assert!(audit.rows.is_empty());
        assert_eq!(
            audit.skipped,
            vec![
                AuditSkip {
                    attribute: "Citizenship".into(),
                    reason: SkipReason::FewerThanTwoGroups,
                },
                AuditSkip {
                    attribute: "Age".into(),
                    reason: SkipReason::TooFewSamples,
                },
            ]
        );
    }
}
