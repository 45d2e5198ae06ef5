//! Affinity scoring for relationship networks
//!
//! Two formulas live here and must not be mixed:
//! - share-of-total: a neighbor's fraction of the member's interaction volume,
//!   apportioned with the largest-remainder method so a non-empty network sums
//!   to exactly 100. This is the only score that gets persisted.
//! - log-scaled: `min(100, ln(count + 1) * 25)`, absolute and unnormalized.
//!   Diagnostics only.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::models::MemberRelationshipEntry;

/// Scale factor for the diagnostic log score
const LOG_SCALE: f64 = 25.0;

/// Apportion 100 points across `shares`. All zeros when the shares sum to 0.
pub fn share_of_total(shares: &[i64]) -> Vec<u8> {
    let sum: i64 = shares.iter().map(|s| (*s).max(0)).sum();
    if sum == 0 {
        return vec![0; shares.len()];
    }

    let exact: Vec<f64> = shares
        .iter()
        .map(|s| 100.0 * (*s).max(0) as f64 / sum as f64)
        .collect();
    let mut points: Vec<u32> = exact.iter().map(|e| e.floor() as u32).collect();
    let mut remaining = 100u32.saturating_sub(points.iter().sum());

    let mut by_remainder: Vec<usize> = (0..shares.len()).collect();
    by_remainder.sort_by(|&i, &j| {
        let ri = exact[i] - exact[i].floor();
        let rj = exact[j] - exact[j].floor();
        rj.partial_cmp(&ri).unwrap_or(Ordering::Equal).then(i.cmp(&j))
    });

    for i in by_remainder {
        if remaining == 0 {
            break;
        }
        if exact[i] - exact[i].floor() > 0.0 {
            points[i] += 1;
            remaining -= 1;
        }
    }

    points.into_iter().map(|p| p.min(100) as u8).collect()
}

/// Diagnostic absolute score. Never persisted as the network affinity.
pub fn log_scaled(count: i64) -> f64 {
    (((count.max(0) + 1) as f64).ln() * LOG_SCALE).min(100.0)
}

/// Order entries by affinity, then recency, then id so reruns are byte-identical.
pub fn rank(entries: &mut [MemberRelationshipEntry]) {
    entries.sort_by(|a, b| {
        b.affinity_percentage
            .cmp(&a.affinity_percentage)
            .then(b.last_interaction.cmp(&a.last_interaction))
            .then(a.user_id.cmp(&b.user_id))
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrengthLabel {
    Weak,
    Moderate,
    Strong,
    VeryStrong,
}

impl StrengthLabel {
    pub fn from_affinity(affinity_percentage: f64) -> Self {
        if affinity_percentage >= 70.0 {
            StrengthLabel::VeryStrong
        } else if affinity_percentage >= 50.0 {
            StrengthLabel::Strong
        } else if affinity_percentage >= 30.0 {
            StrengthLabel::Moderate
        } else {
            StrengthLabel::Weak
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrengthLabel::Weak => "weak",
            StrengthLabel::Moderate => "moderate",
            StrengthLabel::Strong => "strong",
            StrengthLabel::VeryStrong => "very strong",
        }
    }
}
