use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::debug;

use super::types::Generation;
use super::CodeGenerator;
use crate::data::{extract_tickers, DataRequirement, Interval};
use crate::error::{LlmError, LlmResult};

static YEAR: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\b(19[5-9]\d|20\d{2})\b").ok());

const HELPERS: &str = r#"import json
import math


def closes(symbol):
    bars = sorted(DATA[symbol], key=lambda bar: bar["date"])
    return [float(bar["close"]) for bar in bars]


def daily_returns(prices):
    return [prices[i] / prices[i - 1] - 1.0 for i in range(1, len(prices))]


def stdev(values):
    mean = sum(values) / len(values)
    return math.sqrt(sum((v - mean) ** 2 for v in values) / (len(values) - 1))

"#;

const SHARPE: &str = r#"prices = closes("__SYMBOL__")
rets = daily_returns(prices)
n = len(rets)
mean = sum(rets) / n
vol = stdev(rets)
sharpe = (mean - __RF__ / 252.0) / vol * math.sqrt(252)
print(json.dumps({
    "sharpe_ratio": round(sharpe, 4),
    "annualized_return": round(mean * 252, 4),
    "annualized_volatility": round(vol * math.sqrt(252), 4),
    "sample_size": n,
}))
"#;

const VOLATILITY: &str = r#"prices = closes("__SYMBOL__")
rets = daily_returns(prices)
vol = stdev(rets)
print(json.dumps({
    "daily_volatility": round(vol, 6),
    "annualized_volatility": round(vol * math.sqrt(252), 4),
    "sample_size": len(rets),
}))
"#;

const TOTAL_RETURN: &str = r#"prices = closes("__SYMBOL__")
n = len(prices) - 1
total = prices[-1] / prices[0] - 1.0
annualized = (1.0 + total) ** (252.0 / n) - 1.0
print(json.dumps({
    "total_return": round(total, 4),
    "annualized_return": round(annualized, 4),
    "start_price": round(prices[0], 4),
    "end_price": round(prices[-1], 4),
    "sample_size": n,
}))
"#;

const DRAWDOWN: &str = r#"prices = closes("__SYMBOL__")
peak = prices[0]
worst = 0.0
for price in prices:
    peak = max(peak, price)
    worst = min(worst, price / peak - 1.0)
print(json.dumps({
    "max_drawdown": round(worst, 4),
    "peak_price": round(max(prices), 4),
    "sample_size": len(prices),
}))
"#;

const CORRELATION: &str = r#"a = {bar["date"]: float(bar["close"]) for bar in DATA["__SYMBOL__"]}
b = {bar["date"]: float(bar["close"]) for bar in DATA["__OTHER__"]}
dates = sorted(set(a) & set(b))
ra = daily_returns([a[d] for d in dates])
rb = daily_returns([b[d] for d in dates])
n = len(ra)
ma = sum(ra) / n
mb = sum(rb) / n
cov = sum((x - ma) * (y - mb) for x, y in zip(ra, rb)) / (n - 1)
r = cov / (stdev(ra) * stdev(rb))
t = r * math.sqrt((n - 2) / max(1e-12, 1.0 - r * r))
p = math.erfc(abs(t) / math.sqrt(2.0))
print(json.dumps({
    "correlation": round(r, 4),
    "beta": round(cov / (stdev(rb) ** 2), 4),
    "p_value": float("%.6g" % p),
    "sample_size": n,
}))
"#;

const FUNDAMENTALS: &str = r#"metrics = DATA["__SYMBOL___fundamentals"]
print(json.dumps({key: metrics[key] for key in sorted(metrics)}))
"#;

/// Metric families the templates cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Metric {
    Sharpe,
    Volatility,
    Return,
    Drawdown,
    Correlation,
    Fundamentals,
}

impl Metric {
    fn as_str(&self) -> &'static str {
        match self {
            Metric::Sharpe => "sharpe_ratio",
            Metric::Volatility => "volatility",
            Metric::Return => "return",
            Metric::Drawdown => "max_drawdown",
            Metric::Correlation => "correlation",
            Metric::Fundamentals => "fundamentals",
        }
    }

    fn detect(query: &str, symbol_count: usize) -> Self {
        let q = query.to_lowercase();
        if symbol_count >= 2 && (q.contains("correl") || q.contains("beta")) {
            Metric::Correlation
        } else if q.contains("sharpe") || q.contains("risk-adjusted") {
            Metric::Sharpe
        } else if q.contains("drawdown") {
            Metric::Drawdown
        } else if q.contains("volatil") || q.contains("risk") || q.contains("std") {
            Metric::Volatility
        } else if q.contains("p/e")
            || q.contains("pe ratio")
            || q.contains("eps")
            || q.contains("market cap")
            || q.contains("fundamental")
            || q.contains("dividend")
        {
            Metric::Fundamentals
        } else {
            Metric::Return
        }
    }
}

/// Deterministic offline generator.
///
/// Recognizes the metric family and tickers in the query and emits a plan
/// whose program computes the metric from the fetched `DATA` binding with
/// the standard library only.
#[derive(Debug, Clone)]
pub struct TemplateCodeGenerator {
    risk_free_rate: f64,
}

impl Default for TemplateCodeGenerator {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.0,
        }
    }
}

impl TemplateCodeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Annual risk-free rate used by the Sharpe template.
    pub fn with_risk_free_rate(mut self, rate: f64) -> Self {
        self.risk_free_rate = rate;
        self
    }

    fn plan_for(&self, query: &str, today: NaiveDate) -> LlmResult<String> {
        let symbols = extract_tickers(query);
        let Some(symbol) = symbols.first().cloned() else {
            return Err(LlmError::InvalidResponse {
                message: format!("No ticker symbol found in query: {query}"),
            });
        };

        let metric = Metric::detect(query, symbols.len());
        let (start, end) = date_range(query, today);

        let body = match metric {
            Metric::Sharpe => SHARPE.replace("__RF__", &format!("{:?}", self.risk_free_rate)),
            Metric::Volatility => VOLATILITY.to_string(),
            Metric::Return => TOTAL_RETURN.to_string(),
            Metric::Drawdown => DRAWDOWN.to_string(),
            Metric::Correlation => CORRELATION.replace("__OTHER__", &symbols[1]),
            Metric::Fundamentals => FUNDAMENTALS.to_string(),
        };
        let code = format!("{HELPERS}{}", body.replace("__SYMBOL__", &symbol));

        let requirements: Vec<DataRequirement> = match metric {
            Metric::Fundamentals => vec![DataRequirement::Fundamentals { symbol: symbol.clone() }],
            Metric::Correlation => symbols[..2]
                .iter()
                .map(|s| DataRequirement::Ohlcv {
                    symbol: s.clone(),
                    start,
                    end,
                    interval: Interval::Daily,
                })
                .collect(),
            _ => vec![DataRequirement::Ohlcv {
                symbol: symbol.clone(),
                start,
                end,
                interval: Interval::Daily,
            }],
        };

        debug!(metric = metric.as_str(), symbol = %symbol, %start, %end, "Template plan selected");

        let plan = json!({
            "code": code,
            "data_requirements": requirements,
            "metadata": {
                "metric": metric.as_str(),
                "symbols": symbols,
                "start": start.to_string(),
                "end": end.to_string(),
                "generator": "template",
            },
        });
        Ok(plan.to_string())
    }
}

/// Query line from the planner context, or the whole context.
fn query_from_context(context: &str) -> &str {
    context
        .lines()
        .find_map(|line| line.strip_prefix("Query:"))
        .map(str::trim)
        .unwrap_or(context)
}

fn date_range(query: &str, today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let years: Vec<i32> = YEAR
        .as_ref()
        .map(|re| {
            re.find_iter(query)
                .filter_map(|m| m.as_str().parse().ok())
                .collect()
        })
        .unwrap_or_default();

    let q = query.to_lowercase();
    let first_day = |y: i32| NaiveDate::from_ymd_opt(y, 1, 1);
    let last_day = |y: i32| NaiveDate::from_ymd_opt(y, 12, 31);

    let range = match years.as_slice() {
        [y] if q.contains("since") || q.contains("from") => first_day(*y).map(|s| (s, today)),
        [y] => first_day(*y).zip(last_day(*y)),
        [a, .., b] => first_day(*a.min(b)).zip(last_day(*a.max(b))),
        [] => None,
    };

    match range {
        Some((start, end)) if start <= today => (start, end.min(today)),
        _ => (today - Duration::days(365), today),
    }
}

#[async_trait]
impl CodeGenerator for TemplateCodeGenerator {
    async fn generate(&self, _instruction: &str, context: &str) -> LlmResult<Generation> {
        let today = Utc::now().date_naive();
        let query = query_from_context(context);
        Ok(Generation::new(self.plan_for(query, today)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 15).unwrap()
    }

    fn plan(query: &str) -> serde_json::Value {
        let content = TemplateCodeGenerator::new().plan_for(query, today()).unwrap();
        serde_json::from_str(&content).unwrap()
    }

    #[test]
    fn test_sharpe_plan() {
        let plan = plan("What was the Sharpe ratio of AAPL in 2023?");
        assert_eq!(plan["metadata"]["metric"], "sharpe_ratio");
        assert_eq!(plan["data_requirements"][0]["kind"], "ohlcv");
        assert_eq!(plan["data_requirements"][0]["symbol"], "AAPL");
        assert_eq!(plan["data_requirements"][0]["start"], "2023-01-01");
        assert_eq!(plan["data_requirements"][0]["end"], "2023-12-31");
        let code = plan["code"].as_str().unwrap();
        assert!(code.contains("closes(\"AAPL\")"));
        assert!(code.contains("sharpe_ratio"));
        assert!(!code.contains("__SYMBOL__"));
        assert!(!code.contains("__RF__"));
    }

    #[test]
    fn test_correlation_needs_two_symbols() {
        let plan = plan("Correlation between NVDA and AMD since 2024");
        assert_eq!(plan["metadata"]["metric"], "correlation");
        assert_eq!(plan["data_requirements"].as_array().unwrap().len(), 2);
        assert_eq!(plan["data_requirements"][1]["symbol"], "AMD");
        assert_eq!(plan["data_requirements"][0]["end"], "2025-06-15");
        assert!(plan["code"].as_str().unwrap().contains("p_value"));
    }

    #[test]
    fn test_metric_detection() {
        assert_eq!(Metric::detect("max drawdown of SPY", 1), Metric::Drawdown);
        assert_eq!(Metric::detect("how volatile is TSLA", 1), Metric::Volatility);
        assert_eq!(Metric::detect("P/E of MSFT", 1), Metric::Fundamentals);
        assert_eq!(Metric::detect("performance of QQQ", 1), Metric::Return);
        assert_eq!(Metric::detect("correlation of SPY", 1), Metric::Return);
    }

    #[test]
    fn test_fundamentals_plan_uses_fundamentals_binding() {
        let plan = plan("What is the dividend yield of KO?");
        assert_eq!(plan["data_requirements"][0]["kind"], "fundamentals");
        assert!(plan["code"].as_str().unwrap().contains("DATA[\"KO_fundamentals\"]"));
    }

    #[test]
    fn test_default_range_is_trailing_year() {
        let (start, end) = date_range("volatility of AAPL", today());
        assert_eq!(end, today());
        assert_eq!(start, today() - Duration::days(365));
    }

    #[test]
    fn test_year_span() {
        let (start, end) = date_range("return of SPY between 2019 and 2021", today());
        assert_eq!(start, NaiveDate::from_ymd_opt(2019, 1, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2021, 12, 31).unwrap());
    }

    #[test]
    fn test_no_ticker_is_error() {
        let err = TemplateCodeGenerator::new()
            .plan_for("what is a good stock?", today())
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_generate_reads_query_line() {
        let generation = TemplateCodeGenerator::new()
            .generate("ignored", "Query: Sharpe of MSFT in 2022\nToday: 2025-01-01")
            .await
            .unwrap();
        let plan: serde_json::Value = serde_json::from_str(&generation.content).unwrap();
        assert_eq!(plan["data_requirements"][0]["symbol"], "MSFT");
    }
}
