use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::evidence::{classify_claims, Claim, EvidenceProfile, EvidenceTier};
use super::{Perspective, PerspectiveAnalysis};
use crate::gate::FactValue;

const CONSENSUS_SPREAD: f64 = 0.15;
const DIVERGENCE_SPREAD: f64 = 0.35;
const HIGH_STRONG_RATIO: f64 = 0.5;
const LOW_STRONG_RATIO: f64 = 0.2;
const MIN_PERSPECTIVES: usize = 3;
const SKEPTIC_STRONG_ARGUMENTS: usize = 2;

const TOP_ITEMS: usize = 3;

// ============================================================================
// Reports
// ============================================================================

/// One perspective's tiered position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateReport {
    pub perspective: Perspective,
    pub analysis_text: String,
    pub claims: Vec<Claim>,
    pub confidence: f64,
    /// One-line summary of the position
    pub overall_stance: String,
    /// Provider that produced the analysis
    pub provider: String,
    /// Produced by the local fallback instead of the configured provider
    pub degraded: bool,
}

impl DebateReport {
    /// Tier an analysis against the fact's values.
    pub fn from_analysis(
        analysis: PerspectiveAnalysis,
        values: &BTreeMap<String, FactValue>,
        profile: &EvidenceProfile,
        provider: &str,
        degraded: bool,
    ) -> Self {
        let claims = classify_claims(&analysis.key_points, values, profile);
        let confidence = analysis.confidence.clamp(0.0, 1.0);
        let count = |tier| claims.iter().filter(|c| c.tier == tier).count();
        let overall_stance = format!(
            "{} at {:.2} confidence: {} strong, {} moderate, {} weak",
            analysis.perspective,
            confidence,
            count(EvidenceTier::Strong),
            count(EvidenceTier::Moderate),
            count(EvidenceTier::Weak),
        );

        Self {
            perspective: analysis.perspective,
            analysis_text: analysis.analysis_text,
            claims,
            confidence,
            overall_stance,
            provider: provider.to_string(),
            degraded,
        }
    }

    /// Number of strong claims.
    pub fn strong_count(&self) -> usize {
        self.claims
            .iter()
            .filter(|c| c.tier == EvidenceTier::Strong)
            .count()
    }

    fn cited(&self) -> BTreeSet<&str> {
        self.claims
            .iter()
            .flat_map(|c| c.cited_metrics.iter().map(String::as_str))
            .collect()
    }

    fn top_claims(&self) -> Vec<String> {
        let mut claims: Vec<&Claim> = self.claims.iter().collect();
        // Stable sort keeps the analyst's order within a tier
        claims.sort_by(|a, b| b.tier.cmp(&a.tier));
        claims
            .into_iter()
            .take(TOP_ITEMS)
            .map(|c| c.text.clone())
            .collect()
    }
}

// ============================================================================
// Synthesis
// ============================================================================

/// One fired adjustment rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceAdjustment {
    pub rule: String,
    pub delta: f64,
}

impl ConfidenceAdjustment {
    fn new(rule: impl Into<String>, delta: f64) -> Self {
        Self {
            rule: rule.into(),
            delta,
        }
    }
}

/// The debate folded into one adjusted position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    pub narrative: String,
    pub top_risks: Vec<String>,
    pub top_opportunities: Vec<String>,
    /// Metrics every perspective cited
    pub agreement: Vec<String>,
    /// Metrics only one of the optimistic and skeptical sides cited
    pub disagreement: Vec<String>,
    pub original_confidence: f64,
    pub adjusted_confidence: f64,
    pub adjustments: Vec<ConfidenceAdjustment>,
    pub rationale: String,
    /// Unweighted mean of the perspectives' confidences
    pub average_confidence: f64,
    pub quality_score: f64,
    pub strong_ratio: f64,
    pub degraded: bool,
}

/// Fold reports into a conservatively adjusted confidence.
///
/// The adjusted value is `clamp(original + Σ adjustments, 0, 1)`. The
/// bonuses sum to at most +13%; the penalties reach −35%.
pub fn synthesize(reports: &[DebateReport], original_confidence: f64) -> Synthesis {
    let original = original_confidence.clamp(0.0, 1.0);
    let n = reports.len();

    let total_args: usize = reports.iter().map(|r| r.claims.len()).sum();
    let strong_args: usize = reports.iter().map(DebateReport::strong_count).sum();
    let strong_ratio = if total_args == 0 {
        0.0
    } else {
        strong_args as f64 / total_args as f64
    };

    let average_confidence = if n == 0 {
        0.0
    } else {
        reports.iter().map(|r| r.confidence).sum::<f64>() / n as f64
    };

    let mut adjustments = Vec::new();

    if n > 0 {
        let max = reports.iter().map(|r| r.confidence).fold(f64::MIN, f64::max);
        let min = reports.iter().map(|r| r.confidence).fold(f64::MAX, f64::min);
        let spread = max - min;
        if spread < CONSENSUS_SPREAD {
            adjustments.push(ConfidenceAdjustment::new(
                format!("consensus (spread {spread:.2} < {CONSENSUS_SPREAD})"),
                0.05,
            ));
        } else if spread > DIVERGENCE_SPREAD {
            adjustments.push(ConfidenceAdjustment::new(
                format!("divergence (spread {spread:.2} > {DIVERGENCE_SPREAD})"),
                -0.15,
            ));
        }
    }

    if total_args > 0 {
        if strong_ratio > HIGH_STRONG_RATIO {
            adjustments.push(ConfidenceAdjustment::new(
                format!("strong evidence ({:.0}% strong arguments)", strong_ratio * 100.0),
                0.05,
            ));
        } else if strong_ratio < LOW_STRONG_RATIO {
            adjustments.push(ConfidenceAdjustment::new(
                format!("weak evidence ({:.0}% strong arguments)", strong_ratio * 100.0),
                -0.10,
            ));
        }
    }

    let distinct: BTreeSet<Perspective> = reports.iter().map(|r| r.perspective).collect();
    if distinct.len() >= MIN_PERSPECTIVES {
        adjustments.push(ConfidenceAdjustment::new(
            format!("{} perspectives reviewed", distinct.len()),
            0.03,
        ));
    }

    let skeptic_strong: usize = reports
        .iter()
        .filter(|r| r.perspective == Perspective::Skeptical)
        .map(DebateReport::strong_count)
        .sum();
    if skeptic_strong >= SKEPTIC_STRONG_ARGUMENTS {
        adjustments.push(ConfidenceAdjustment::new(
            format!("skeptical case has {skeptic_strong} strong arguments"),
            -0.10,
        ));
    }

    let total: f64 = adjustments.iter().map(|a| a.delta).sum();
    let adjusted_confidence = (original + total).clamp(0.0, 1.0);

    let rationale = if adjustments.is_empty() {
        format!("No adjustments applied; confidence stays at {original:.2}")
    } else {
        let fired: Vec<String> = adjustments
            .iter()
            .map(|a| format!("{} {:+.0}%", a.rule, a.delta * 100.0))
            .collect();
        format!(
            "{}; {:.2} -> {:.2}",
            fired.join("; "),
            original,
            adjusted_confidence
        )
    };

    let quality_score = (0.4 * n.min(MIN_PERSPECTIVES) as f64 / MIN_PERSPECTIVES as f64
        + 0.3 * total_args.min(20) as f64 / 20.0
        + 0.3 * strong_ratio)
        .clamp(0.0, 1.0);

    let side = |p: Perspective| reports.iter().find(|r| r.perspective == p);

    let agreement = if n >= 2 {
        let mut sets = reports.iter().map(DebateReport::cited);
        let first = sets.next().unwrap_or_default();
        sets.fold(first, |acc, s| acc.intersection(&s).copied().collect())
            .into_iter()
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };

    let disagreement = match (side(Perspective::Optimistic), side(Perspective::Skeptical)) {
        (Some(bull), Some(bear)) => bull
            .cited()
            .symmetric_difference(&bear.cited())
            .map(|s| s.to_string())
            .collect(),
        _ => Vec::new(),
    };

    let narrative = reports
        .iter()
        .map(|r| {
            format!(
                "{} view ({:.2}): {}",
                capitalize(r.perspective.as_str()),
                r.confidence,
                r.analysis_text
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    Synthesis {
        narrative,
        top_risks: side(Perspective::Skeptical)
            .map(DebateReport::top_claims)
            .unwrap_or_default(),
        top_opportunities: side(Perspective::Optimistic)
            .map(DebateReport::top_claims)
            .unwrap_or_default(),
        agreement,
        disagreement,
        original_confidence: original,
        adjusted_confidence,
        adjustments,
        rationale,
        average_confidence,
        quality_score,
        strong_ratio,
        degraded: reports.iter().any(|r| r.degraded),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn claim(text: &str, metric: Option<&str>, tier: EvidenceTier) -> Claim {
        Claim {
            text: text.to_string(),
            cited_metrics: metric.map(|m| vec![m.to_string()]).unwrap_or_default(),
            tier,
        }
    }

    fn report(perspective: Perspective, confidence: f64, claims: Vec<Claim>) -> DebateReport {
        DebateReport {
            perspective,
            analysis_text: format!("{perspective} analysis"),
            claims,
            confidence,
            overall_stance: String::new(),
            provider: "test".to_string(),
            degraded: false,
        }
    }

    fn strong(n: usize, metric: &str) -> Vec<Claim> {
        (0..n)
            .map(|i| claim(&format!("{metric} point {i}"), Some(metric), EvidenceTier::Strong))
            .collect()
    }

    fn weak(n: usize) -> Vec<Claim> {
        (0..n)
            .map(|i| claim(&format!("generic point {i}"), None, EvidenceTier::Weak))
            .collect()
    }

    /// Three close perspectives with 6 of 10 arguments strong.
    fn consensus_reports() -> Vec<DebateReport> {
        let mut bull = strong(4, "sharpe_ratio");
        bull.extend(weak(1));
        let mut bear = strong(1, "sharpe_ratio");
        bear.extend(weak(2));
        let mut neutral = strong(1, "sharpe_ratio");
        neutral.push(claim("moderate", Some("volatility"), EvidenceTier::Moderate));

        vec![
            report(Perspective::Optimistic, 0.9, bull),
            report(Perspective::Skeptical, 0.85, bear),
            report(Perspective::Neutral, 0.88, neutral),
        ]
    }

    #[test]
    fn test_consensus_clamps_at_one() {
        let synthesis = synthesize(&consensus_reports(), 0.95);

        let deltas: Vec<f64> = synthesis.adjustments.iter().map(|a| a.delta).collect();
        assert_eq!(deltas, vec![0.05, 0.05, 0.03]);
        assert!((synthesis.strong_ratio - 0.6).abs() < 1e-9);
        assert_eq!(synthesis.adjusted_confidence, 1.0);
        assert_eq!(synthesis.original_confidence, 0.95);
    }

    #[test]
    fn test_consensus_bonus_is_thirteen_percent() {
        let synthesis = synthesize(&consensus_reports(), 0.5);
        assert!((synthesis.adjusted_confidence - 0.63).abs() < 1e-9);
        assert!(synthesis.rationale.contains("consensus"));
        assert!(synthesis.rationale.contains("3 perspectives"));
    }

    #[test]
    fn test_divergence_and_skeptic_penalties() {
        let reports = vec![
            report(Perspective::Optimistic, 0.95, weak(3)),
            report(Perspective::Skeptical, 0.4, strong(2, "max_drawdown")),
            report(Perspective::Neutral, 0.6, weak(3)),
        ];
        let synthesis = synthesize(&reports, 0.8);

        // spread 0.55 -15%, ratio 2/8 none, 3 perspectives +3%, skeptic -10%
        let deltas: Vec<f64> = synthesis.adjustments.iter().map(|a| a.delta).collect();
        assert_eq!(deltas, vec![-0.15, 0.03, -0.10]);
        assert!((synthesis.adjusted_confidence - 0.58).abs() < 1e-9);
    }

    #[test]
    fn test_clamps_at_zero() {
        let reports = vec![
            report(Perspective::Optimistic, 0.9, weak(5)),
            report(Perspective::Skeptical, 0.1, weak(5)),
        ];
        let synthesis = synthesize(&reports, 0.1);
        assert_eq!(synthesis.adjusted_confidence, 0.0);
    }

    #[test]
    fn test_bonus_never_exceeds_thirteen_percent() {
        for original in [0.0, 0.2, 0.5, 0.8, 0.87] {
            let synthesis = synthesize(&consensus_reports(), original);
            assert!(synthesis.adjusted_confidence - original <= 0.13 + 1e-9);
            assert!((0.0..=1.0).contains(&synthesis.adjusted_confidence));
        }
    }

    #[test]
    fn test_quality_score() {
        let synthesis = synthesize(&consensus_reports(), 0.5);
        // 0.4 * 3/3 + 0.3 * 10/20 + 0.3 * 0.6
        assert!((synthesis.quality_score - 0.73).abs() < 1e-9);

        let empty = synthesize(&[], 0.7);
        assert_eq!(empty.quality_score, 0.0);
        assert!(empty.adjustments.is_empty());
        assert_eq!(empty.adjusted_confidence, 0.7);
    }

    #[test]
    fn test_agreement_and_disagreement() {
        let reports = vec![
            report(
                Perspective::Optimistic,
                0.8,
                vec![
                    claim("a", Some("sharpe_ratio"), EvidenceTier::Moderate),
                    claim("b", Some("total_return"), EvidenceTier::Moderate),
                ],
            ),
            report(
                Perspective::Skeptical,
                0.7,
                vec![
                    claim("c", Some("sharpe_ratio"), EvidenceTier::Moderate),
                    claim("d", Some("max_drawdown"), EvidenceTier::Strong),
                ],
            ),
        ];
        let synthesis = synthesize(&reports, 0.7);
        assert_eq!(synthesis.agreement, vec!["sharpe_ratio"]);
        assert_eq!(synthesis.disagreement, vec!["max_drawdown", "total_return"]);
        assert_eq!(synthesis.top_risks, vec!["d", "c"]);
        assert_eq!(synthesis.top_opportunities, vec!["a", "b"]);
    }

    #[test]
    fn test_report_from_analysis_tiers_claims() {
        let values: BTreeMap<String, FactValue> =
            [("sharpe_ratio".to_string(), FactValue::Number(1.9))].into();
        let profile = EvidenceProfile::from_values(&values, 50);
        let report = DebateReport::from_analysis(
            PerspectiveAnalysis {
                perspective: Perspective::Optimistic,
                analysis_text: "good".to_string(),
                confidence: 1.4,
                key_points: vec!["sharpe_ratio is high".to_string(), "vibes".to_string()],
            },
            &values,
            &profile,
            "local",
            true,
        );
        assert_eq!(report.confidence, 1.0);
        assert_eq!(report.claims[0].tier, EvidenceTier::Moderate);
        assert_eq!(report.claims[1].tier, EvidenceTier::Weak);
        assert!(report.overall_stance.starts_with("optimistic at 1.00"));
        assert!(report.degraded);
    }
}
