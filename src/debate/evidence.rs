//! Claim strength tiering.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::gate::FactValue;

/// Programs faster than this are suspected of printing hardcoded values.
const SUSPICIOUS_EXECUTION_MS: u64 = 5;

/// Strength of the evidence behind a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceTier {
    Weak,
    Moderate,
    Strong,
}

impl EvidenceTier {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceTier::Weak => "weak",
            EvidenceTier::Moderate => "moderate",
            EvidenceTier::Strong => "strong",
        }
    }
}

/// A key point with the metrics it cites and its tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub text: String,
    pub cited_metrics: Vec<String>,
    pub tier: EvidenceTier,
}

/// Statistical support available in a fact.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct EvidenceProfile {
    pub p_value: Option<f64>,
    pub sample_size: Option<f64>,
    pub correlation: Option<f64>,
    pub execution_time_ms: u64,
}

impl EvidenceProfile {
    /// Find p-value, sample size and correlation among extracted values.
    pub fn from_values(values: &BTreeMap<String, FactValue>, execution_time_ms: u64) -> Self {
        let find = |pred: &dyn Fn(&str) -> bool| {
            values
                .iter()
                .filter(|(key, _)| pred(&leaf(key).to_lowercase()))
                .find_map(|(_, value)| value.as_f64())
        };

        Self {
            p_value: find(&|k| k == "p_value" || k == "pvalue" || k == "p"),
            sample_size: find(&|k| {
                matches!(k, "n" | "sample_size" | "n_obs" | "observations" | "num_observations")
            }),
            correlation: find(&|k| k == "correlation" || k == "corr" || k.starts_with("correlation_")),
            execution_time_ms,
        }
    }

    /// Tier for a claim that cites at least one verified metric.
    pub fn tier(&self) -> EvidenceTier {
        if self.execution_time_ms < SUSPICIOUS_EXECUTION_MS {
            return EvidenceTier::Weak;
        }

        let n = self.sample_size.unwrap_or(0.0);
        let p = self.p_value;
        let r = self.correlation.map(f64::abs);

        let strong = p.is_some_and(|p| p < 0.01 && n >= 100.0)
            || r.is_some_and(|r| r >= 0.7 && n >= 30.0);
        if strong {
            return EvidenceTier::Strong;
        }

        let moderate = p.is_some_and(|p| p < 0.05 && n >= 30.0) || r.is_some_and(|r| r >= 0.4);
        if moderate {
            return EvidenceTier::Moderate;
        }

        // A verified metric with no statistics attached
        if p.is_none() && r.is_none() {
            EvidenceTier::Moderate
        } else {
            EvidenceTier::Weak
        }
    }
}

fn leaf(key: &str) -> &str {
    key.rsplit('.').next().unwrap_or(key)
}

/// Metric names a point cites, matched on the name or its spaced form.
fn cited_metrics(point: &str, values: &BTreeMap<String, FactValue>) -> Vec<String> {
    let lower = point.to_lowercase();
    values
        .keys()
        .filter(|key| {
            let key = key.to_lowercase();
            let spaced = key.replace(['_', '.'], " ");
            key.len() > 1 && (lower.contains(&key) || lower.contains(&spaced))
        })
        .cloned()
        .collect()
}

/// Tier every key point against the fact's evidence.
pub fn classify_claims(
    key_points: &[String],
    values: &BTreeMap<String, FactValue>,
    profile: &EvidenceProfile,
) -> Vec<Claim> {
    let cited_tier = profile.tier();
    key_points
        .iter()
        .map(|point| {
            let cited = cited_metrics(point, values);
            let tier = if cited.is_empty() {
                EvidenceTier::Weak
            } else {
                cited_tier
            };
            Claim {
                text: point.clone(),
                cited_metrics: cited,
                tier,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, f64)]) -> BTreeMap<String, FactValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), FactValue::Number(*v)))
            .collect()
    }

    #[test]
    fn test_profile_reads_statistics() {
        let profile = EvidenceProfile::from_values(
            &values(&[("p_value", 0.001), ("sample_size", 250.0), ("stats.correlation", 0.82)]),
            120,
        );
        assert_eq!(profile.p_value, Some(0.001));
        assert_eq!(profile.sample_size, Some(250.0));
        assert_eq!(profile.correlation, Some(0.82));
        assert_eq!(profile.tier(), EvidenceTier::Strong);
    }

    #[test]
    fn test_tiers() {
        let profile = |p: Option<f64>, n: Option<f64>, r: Option<f64>| EvidenceProfile {
            p_value: p,
            sample_size: n,
            correlation: r,
            execution_time_ms: 100,
        };

        assert_eq!(profile(Some(0.005), Some(150.0), None).tier(), EvidenceTier::Strong);
        assert_eq!(profile(None, Some(40.0), Some(-0.75)).tier(), EvidenceTier::Strong);
        assert_eq!(profile(Some(0.03), Some(50.0), None).tier(), EvidenceTier::Moderate);
        assert_eq!(profile(None, Some(10.0), Some(0.5)).tier(), EvidenceTier::Moderate);
        assert_eq!(profile(Some(0.2), Some(500.0), None).tier(), EvidenceTier::Weak);
        assert_eq!(profile(None, Some(252.0), None).tier(), EvidenceTier::Moderate);
    }

    #[test]
    fn test_fast_execution_is_suspicious() {
        let profile = EvidenceProfile {
            p_value: Some(0.0001),
            sample_size: Some(1000.0),
            correlation: None,
            execution_time_ms: 2,
        };
        assert_eq!(profile.tier(), EvidenceTier::Weak);
    }

    #[test]
    fn test_uncited_claims_are_weak() {
        let vals = values(&[("sharpe_ratio", 1.9), ("sample_size", 250.0)]);
        let profile = EvidenceProfile::from_values(&vals, 80);
        let claims = classify_claims(
            &[
                "A sharpe ratio of 1.9 is excellent".to_string(),
                "Markets are unpredictable".to_string(),
            ],
            &vals,
            &profile,
        );
        assert_eq!(claims[0].cited_metrics, vec!["sharpe_ratio"]);
        assert_eq!(claims[0].tier, EvidenceTier::Moderate);
        assert!(claims[1].cited_metrics.is_empty());
        assert_eq!(claims[1].tier, EvidenceTier::Weak);
    }
}
