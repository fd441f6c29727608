//! Named value formatters (`{price|currency}`) and output sanitization.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

/// Apply a formatter chain left to right. Unknown names leave the value
/// unchanged and are reported through `warnings`.
pub(crate) fn apply_formatters(value: String, formatters: &[String], warnings: &mut Vec<String>) -> String {
    formatters.iter().fold(value, |current, name| {
        match apply(&current, name) {
            Some(formatted) => formatted,
            None => {
                warnings.push(format!("Unknown formatter: {}", name));
                current
            }
        }
    })
}

fn apply(value: &str, name: &str) -> Option<String> {
    let formatted = match name.to_ascii_lowercase().as_str() {
        "currency" => currency(parse_number(value)),
        "comma" => thousands(parse_number(value), 3),
        "uppercase" => value.to_uppercase(),
        "lowercase" => value.to_lowercase(),
        "capitalize" => capitalize(value),
        "titlecase" => value
            .split_inclusive(char::is_whitespace)
            .map(title_word)
            .collect(),
        "trim" => value.trim().to_string(),
        "truncate" => truncate(value, 100),
        "date" => datetime(value, "%-m/%-d/%Y"),
        "time" => datetime(value, "%-I:%M:%S %p"),
        "datetime" => datetime(value, "%-m/%-d/%Y, %-I:%M:%S %p"),
        "encode" => encode_component(value),
        "length" => value.chars().count().to_string(),
        "reverse" => value.chars().rev().collect(),
        "json" => match serde_json::from_str::<serde_json::Value>(value) {
            Ok(parsed) => serde_json::to_string_pretty(&parsed).unwrap_or_else(|_| value.to_string()),
            Err(_) => value.to_string(),
        },
        _ => return None,
    };
    Some(formatted)
}

/// Escape characters that could open markup in rendered output.
pub(crate) fn sanitize(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            other => out.push(other),
        }
    }
    out
}

fn parse_number(value: &str) -> f64 {
    value.trim().parse::<f64>().ok().filter(|n| n.is_finite()).unwrap_or(0.0)
}

fn currency(amount: f64) -> String {
    let grouped = thousands(amount.abs(), 2);
    let grouped = match grouped.split_once('.') {
        Some((int, frac)) => format!("{}.{:0<2}", int, frac),
        None => format!("{}.00", grouped),
    };
    if amount < 0.0 && grouped.chars().any(|c| c.is_ascii_digit() && c != '0') {
        format!("-${}", grouped)
    } else {
        format!("${}", grouped)
    }
}

/// Group the integer part with commas, keeping at most `decimals` fraction
/// digits without trailing zeros.
fn thousands(amount: f64, decimals: usize) -> String {
    let fixed = format!("{:.*}", decimals, amount.abs());
    let (int, frac) = fixed.split_once('.').unwrap_or((fixed.as_str(), ""));
    let frac = frac.trim_end_matches('0');

    let mut grouped = String::with_capacity(int.len() + int.len() / 3);
    for (i, digit) in int.chars().enumerate() {
        if i > 0 && (int.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    let sign = if amount < 0.0 && (!int.trim_start_matches('0').is_empty() || !frac.is_empty()) {
        "-"
    } else {
        ""
    };

    if frac.is_empty() {
        format!("{}{}", sign, grouped)
    } else {
        format!("{}{}.{}", sign, grouped, frac)
    }
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.as_str().to_lowercase().chars()).collect(),
        None => String::new(),
    }
}

fn title_word(word: &str) -> String {
    match word.find(|c: char| c.is_alphanumeric() || c == '_') {
        Some(start) => {
            let (lead, rest) = word.split_at(start);
            format!("{}{}", lead, capitalize(rest))
        }
        None => word.to_string(),
    }
}

fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() > max {
        let kept: String = value.chars().take(max - 3).collect();
        format!("{}...", kept)
    } else {
        value.to_string()
    }
}

/// Dates render in UTC; unparseable input is left untouched.
fn datetime(value: &str, pattern: &str) -> String {
    let trimmed = value.trim();
    let parsed = DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.naive_utc())
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S").ok())
        .or_else(|| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S").ok())
        .or_else(|| {
            NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        });

    match parsed {
        Some(dt) => dt.format(pattern).to_string(),
        None => value.to_string(),
    }
}

/// Percent-encode like `encodeURIComponent`: `urlencoding` escapes the
/// sub-delimiters `!'()*` as well, so those are put back.
fn encode_component(value: &str) -> String {
    const KEPT: [(&str, &str); 5] = [("%21", "!"), ("%27", "'"), ("%28", "("), ("%29", ")"), ("%2A", "*")];
    KEPT.iter()
        .fold(urlencoding::encode(value).into_owned(), |encoded, (escaped, mark)| {
            encoded.replace(escaped, mark)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(value: &str, name: &str) -> String {
        let mut warnings = Vec::new();
        apply_formatters(value.to_string(), &[name.to_string()], &mut warnings)
    }

    #[test]
    fn test_number_formatters() {
        assert_eq!(fmt("1234.5", "currency"), "$1,234.50");
        assert_eq!(fmt("-99", "currency"), "-$99.00");
        assert_eq!(fmt("abc", "currency"), "$0.00");
        assert_eq!(fmt("1234567", "comma"), "1,234,567");
        assert_eq!(fmt("1234.56789", "comma"), "1,234.568");
        assert_eq!(fmt("999", "comma"), "999");
    }

    #[test]
    fn test_case_formatters() {
        assert_eq!(fmt("paris", "uppercase"), "PARIS");
        assert_eq!(fmt("PARIS", "lowercase"), "paris");
        assert_eq!(fmt("pARIS trip", "capitalize"), "Paris trip");
        assert_eq!(fmt("the grand  tour", "titlecase"), "The Grand  Tour");
        assert_eq!(fmt("  x ", "trim"), "x");
    }

    #[test]
    fn test_text_formatters() {
        let long = "a".repeat(120);
        let truncated = fmt(&long, "truncate");
        assert_eq!(truncated.chars().count(), 100);
        assert!(truncated.ends_with("..."));
        assert_eq!(fmt("short", "truncate"), "short");
        assert_eq!(fmt("a b&c", "encode"), "a%20b%26c");
        assert_eq!(fmt("it's (ok)!*~", "encode"), "it's%20(ok)!*~");
        assert_eq!(fmt("café/x", "encode"), "caf%C3%A9%2Fx");
        assert_eq!(fmt("héllo", "length"), "5");
        assert_eq!(fmt("abc", "reverse"), "cba");
        assert_eq!(fmt("{\"a\":1}", "json"), "{\n  \"a\": 1\n}");
        assert_eq!(fmt("not json", "json"), "not json");
    }

    #[test]
    fn test_date_formatters() {
        assert_eq!(fmt("2025-06-15", "date"), "6/15/2025");
        assert_eq!(fmt("2025-06-15T14:05:09Z", "time"), "2:05:09 PM");
        assert_eq!(
            fmt("2025-06-15T14:05:09+02:00", "datetime"),
            "6/15/2025, 12:05:09 PM"
        );
        assert_eq!(fmt("someday", "date"), "someday");
    }

    #[test]
    fn test_chain_and_unknown_formatter() {
        let mut warnings = Vec::new();
        let out = apply_formatters(
            "  paris ".to_string(),
            &["trim".to_string(), "sparkle".to_string(), "uppercase".to_string()],
            &mut warnings,
        );
        assert_eq!(out, "PARIS");
        assert_eq!(warnings, vec!["Unknown formatter: sparkle"]);
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(
            sanitize("<a href=\"/x\">'</a>"),
            "&lt;a href=&quot;&#x2F;x&quot;&gt;&#x27;&lt;&#x2F;a&gt;"
        );
    }
}
