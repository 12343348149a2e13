//! Pre-pipeline query screening.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::error::RefusalReason;

/// Outcome of screening one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafetyVerdict {
    pub should_refuse: bool,
    pub reason: Option<RefusalReason>,
    pub message: String,
}

impl SafetyVerdict {
    fn allow() -> Self {
        Self {
            should_refuse: false,
            reason: None,
            message: "Query accepted".to_string(),
        }
    }

    fn refuse(reason: RefusalReason, message: &str) -> Self {
        Self {
            should_refuse: true,
            reason: Some(reason),
            message: message.to_string(),
        }
    }
}

struct PatternFamily {
    reason: RefusalReason,
    message: &'static str,
    patterns: Vec<Regex>,
}

fn family(reason: RefusalReason, message: &'static str, patterns: &[&str]) -> PatternFamily {
    PatternFamily {
        reason,
        message,
        patterns: patterns
            .iter()
            .filter_map(|p| Regex::new(&format!("(?i){p}")).ok())
            .collect(),
    }
}

// Checked in order; the first family that matches decides the reason.
static FAMILIES: Lazy<Vec<PatternFamily>> = Lazy::new(|| {
    vec![
        family(
            RefusalReason::Jailbreak,
            "This request tries to override the system's instructions and cannot be processed.",
            &[
                r"ignore\s+(all\s+)?(the\s+)?(previous|prior|above|earlier)\s+(instructions|prompts|rules)",
                r"disregard\s+(all\s+)?(your|the|previous|prior)\s+(instructions|rules|guidelines)",
                r"forget\s+(all\s+)?(your|previous|prior)\s+(instructions|rules)",
                r"\byou\s+are\s+now\s+(in\s+)?(dan|developer\s+mode|unrestricted)",
                r"\bdo\s+anything\s+now\b",
                r"pretend\s+(you\s+have|there\s+are)\s+no\s+(rules|restrictions|limits)",
                r"(reveal|print|show)\s+(me\s+)?(your|the)\s+system\s+prompt",
                r"bypass\s+(your\s+)?(safety|content)\s+(filters?|rules|checks)",
            ],
        ),
        family(
            RefusalReason::Illegal,
            "This request concerns illegal financial activity and cannot be answered.",
            &[
                r"\binsider\s+(trading|information|tips?)\b",
                r"\bmoney\s+launder",
                r"\blaunder(ing)?\s+(money|funds|cash|proceeds)",
                r"\b(evade|evading|evasion\s+of)\s+(taxes|tax)\b",
                r"\btax\s+evasion\b",
                r"\bhide\s+(money|assets|income)\s+from\s+(the\s+)?(irs|tax|authorities|regulators)",
                r"\bponzi\s+scheme\b",
                r"\bfront[\s-]?run(ning)?\b",
                r"\bstructur(e|ing)\s+deposits?\s+to\s+avoid",
            ],
        ),
        family(
            RefusalReason::Manipulation,
            "This request describes market manipulation and cannot be answered.",
            &[
                r"\bpump\s+(and|&|n)\s+dump\b",
                r"\bspoof(ing)?\s+(orders?|the\s+market|bids?)",
                r"\bwash\s+trad(e|es|ing)\b",
                r"\bcorner\s+the\s+market\b",
                r"\bmanipulat(e|ing)\s+(the\s+)?(stock|share|market|price)",
                r"\bpaint(ing)?\s+the\s+tape\b",
                r"\bspread\s+(false|fake)\s+(rumou?rs|news)\s+(about|to)",
            ],
        ),
        family(
            RefusalReason::ImpossiblePrediction,
            "Future prices cannot be known; the system only reports values computed from historical data.",
            &[
                r"\bguarantee[ds]?\s+(me\s+)?(a\s+)?(returns?|profits?|gains?)",
                r"\b(exact|precise)\s+(future\s+)?price\s+(of|for)\b.*\b(tomorrow|next\s+(week|month|year)|on\s+\d)",
                r"\bwhat\s+will\s+\S+\s+(close|trade|be)\s+at\s+(tomorrow|next)",
                r"\bwhich\s+stock\s+will\s+(definitely|certainly|surely)\b",
                r"\b(100|hundred)\s*%\s+(sure|certain|guaranteed)\b",
                r"\bpredict\s+(the\s+)?(exact|precise)\b",
                r"\bwinning\s+lottery\b",
            ],
        ),
    ]
});

/// Screens queries before any pipeline stage runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyGatekeeper;

impl SafetyGatekeeper {
    pub fn new() -> Self {
        Self
    }

    /// Screen a query. Empty or whitespace-only queries are refused.
    pub fn screen(&self, query: &str) -> SafetyVerdict {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return SafetyVerdict::refuse(RefusalReason::InvalidInput, "Query is empty.");
        }

        for family in FAMILIES.iter() {
            if family.patterns.iter().any(|re| re.is_match(trimmed)) {
                warn!(reason = %family.reason, "Query refused by safety screen");
                return SafetyVerdict::refuse(family.reason, family.message);
            }
        }

        SafetyVerdict::allow()
    }
}
