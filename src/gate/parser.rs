//! Value extraction from sandbox stdout.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use super::FactValue;

/// How values were recovered from the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMethod {
    /// Whole stdout was a JSON object
    Json,
    /// Last JSON-object line of stdout
    JsonLine,
    /// `key: number` / `key = number` patterns
    Pattern,
}

impl ParseMethod {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseMethod::Json => "json",
            ParseMethod::JsonLine => "json_line",
            ParseMethod::Pattern => "pattern",
        }
    }
}

/// Index names whose cardinal is part of the name, never a value.
static INDEX_NAMES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?i)\bs\s*&\s*p\s*-?\s*500\b", "sp500"),
        (r"(?i)\brussell\s*-?\s*2000\b", "russell2000"),
        (r"(?i)\bnasdaq\s*-?\s*100\b", "nasdaq100"),
        (r"(?i)\bftse\s*-?\s*100\b", "ftse100"),
        (r"(?i)\bdow\s*(?:jones\s*)?-?\s*30\b", "dow30"),
        (r"(?i)\bnikkei\s*-?\s*225\b", "nikkei225"),
        (r"(?i)\bdax\s*-?\s*40\b", "dax40"),
        (r"(?i)\bcac\s*-?\s*40\b", "cac40"),
        (r"(?i)\bstoxx\s*(?:europe\s*)?-?\s*600\b", "stoxx600"),
    ]
    .into_iter()
    .filter_map(|(pattern, slug)| Regex::new(pattern).ok().map(|re| (re, slug)))
    .collect()
});

static KEY_VALUE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"([A-Za-z_][A-Za-z0-9_]*(?:[ \-][A-Za-z_][A-Za-z0-9_]*)*)\s*[:=]\s*([-+]?(?:\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d*)?|\.\d+)(?:[eE][-+]?\d+)?)",
    )
    .ok()
});

/// Extract named values from stdout. Returns `None` when nothing was found.
pub(crate) fn extract_values(stdout: &str) -> Option<(BTreeMap<String, FactValue>, ParseMethod)> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        let values = flatten_object(&map);
        if !values.is_empty() {
            return Some((values, ParseMethod::Json));
        }
    }

    if let Some(values) = last_json_line(trimmed) {
        return Some((values, ParseMethod::JsonLine));
    }

    let values = extract_patterns(trimmed);
    if values.is_empty() {
        None
    } else {
        Some((values, ParseMethod::Pattern))
    }
}

fn last_json_line(stdout: &str) -> Option<BTreeMap<String, FactValue>> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{') && line.ends_with('}'))
        .find_map(|line| match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => {
                let values = flatten_object(&map);
                (!values.is_empty()).then_some(values)
            }
            _ => None,
        })
}

fn flatten_object(map: &serde_json::Map<String, Value>) -> BTreeMap<String, FactValue> {
    let mut out = BTreeMap::new();
    for (key, value) in map {
        flatten_into(&mut out, key, value);
    }
    out
}

fn flatten_into(out: &mut BTreeMap<String, FactValue>, prefix: &str, value: &Value) {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64().filter(|f| f.is_finite()) {
                out.insert(prefix.to_string(), FactValue::Number(f));
            }
        }
        Value::String(s) => {
            out.insert(prefix.to_string(), FactValue::Text(s.clone()));
        }
        Value::Bool(b) => {
            out.insert(prefix.to_string(), FactValue::Text(b.to_string()));
        }
        Value::Object(map) => {
            for (key, nested) in map {
                flatten_into(out, &format!("{prefix}.{key}"), nested);
            }
        }
        Value::Array(items) => {
            for (i, nested) in items.iter().enumerate() {
                flatten_into(out, &format!("{prefix}.{i}"), nested);
            }
        }
        Value::Null => {}
    }
}

/// Replace index names with cardinal-free slugs.
pub(crate) fn mask_index_names(text: &str) -> String {
    INDEX_NAMES
        .iter()
        .fold(text.to_string(), |acc, (re, slug)| re.replace_all(&acc, *slug).into_owned())
}

fn extract_patterns(stdout: &str) -> BTreeMap<String, FactValue> {
    let mut out = BTreeMap::new();
    let Some(re) = KEY_VALUE.as_ref() else {
        return out;
    };

    let masked = mask_index_names(stdout);
    for caps in re.captures_iter(&masked) {
        let (Some(key), Some(number)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        if !ends_at_boundary(&masked[number.end()..]) {
            continue;
        }
        let Ok(value) = number.as_str().replace(',', "").parse::<f64>() else {
            continue;
        };
        if !value.is_finite() {
            continue;
        }
        out.insert(normalize_key(key.as_str()), FactValue::Number(value));
    }
    out
}

/// A number only counts when it is not the head of a date, time, or
/// longer token such as `2024-01-15`, `10:30` or `2.5B`.
fn ends_at_boundary(rest: &str) -> bool {
    let mut chars = rest.chars();
    match chars.next() {
        None => true,
        Some(c) if c.is_alphanumeric() || c == '_' => false,
        Some('-' | '/' | ':' | '.' | ',') => !chars.next().is_some_and(|c| c.is_ascii_digit()),
        Some(_) => true,
    }
}

fn normalize_key(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}
