//! Static template checks: balance, block pairing, script-like content.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Outcome of [`validate_syntax`](super::validate_syntax).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyntaxReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

static IF_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{#if\s+[^}]+\}\}").unwrap());
static IF_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{/if\}\}").unwrap());
static EACH_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{#each\s+\w+\s+as\s+\w+\}\}").unwrap());
static EACH_ANY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{#each\s+[^}]+\}\}").unwrap());
static EACH_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{/each\}\}").unwrap());
static EMPTY_VARIABLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\s*\}").unwrap());
static ANY_VARIABLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[^{][^}]*\}").unwrap());
static SENSITIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\{[\w.]*(?:password|secret|key|token|auth)[\w.]*\}").unwrap());

static SECURITY_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?is)<script.*?>.*?</script>", "Script tags detected"),
        (r"(?i)javascript:", "JavaScript protocol detected"),
        (r"(?i)\bon\w+\s*=", "Event handlers detected"),
        (r"(?i)data:text/html", "Data URL HTML detected"),
        (r"(?i)\beval\s*\(", "Eval function detected"),
        (r"\bFunction\s*\(", "Function constructor detected"),
        (r#"\{\{[^}]*[<>'"&][^}]*\}\}"#, "Potential XSS in template block"),
    ]
    .into_iter()
    .map(|(pattern, message)| (Regex::new(pattern).unwrap(), message))
    .collect()
});

pub(crate) fn validate(template: &str) -> SyntaxReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let mut depth: i64 = 0;
    for (i, c) in template.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    errors.push(format!("Unmatched closing brace at position {}", i));
                    break;
                }
            }
            _ => {}
        }
    }
    if depth > 0 {
        errors.push(format!("{} unclosed brace(s)", depth));
    }

    let empty = EMPTY_VARIABLE.find_iter(template).count();
    if empty > 0 {
        warnings.push(format!("Found {} empty variable placeholder(s)", empty));
    }

    let if_opens = IF_OPEN.find_iter(template).count();
    let if_closes = IF_CLOSE.find_iter(template).count();
    check_pairs(&mut errors, "conditional", "{{#if}}", "{{/if}}", if_opens, if_closes);

    let each_opens = EACH_OPEN.find_iter(template).count();
    let each_closes = EACH_CLOSE.find_iter(template).count();
    check_pairs(&mut errors, "loop", "{{#each}}", "{{/each}}", each_opens, each_closes);

    for m in EACH_ANY.find_iter(template) {
        if !EACH_OPEN.is_match(m.as_str()) {
            errors.push(format!(
                "Invalid loop syntax: {}. Use {{{{#each array as item}}}}",
                m.as_str()
            ));
        }
    }

    for (pattern, message) in SECURITY_PATTERNS.iter() {
        if pattern.is_match(template) {
            errors.push(format!("Security risk: {}", message));
        }
    }

    let blocks = if_opens + each_opens;
    let variables = ANY_VARIABLE.find_iter(template).count();
    let complexity = blocks * 2 + variables;
    if complexity > 50 {
        warnings.push(format!(
            "High template complexity ({}). Consider breaking into smaller templates.",
            complexity
        ));
    } else if complexity > 25 {
        warnings.push(format!(
            "Medium template complexity ({}). Monitor performance.",
            complexity
        ));
    }

    let sensitive: Vec<&str> = SENSITIVE.find_iter(template).map(|m| m.as_str()).collect();
    if !sensitive.is_empty() {
        warnings.push(format!(
            "Potentially sensitive variable names: {}",
            sensitive.join(", ")
        ));
    }

    SyntaxReport {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

fn check_pairs(
    errors: &mut Vec<String>,
    kind: &str,
    open_tag: &str,
    close_tag: &str,
    opens: usize,
    closes: usize,
) {
    match (opens, closes) {
        (0, 0) => {}
        (o, 0) => errors.push(format!(
            "Unclosed {} blocks: {} {} without {}",
            kind, o, open_tag, close_tag
        )),
        (0, c) => errors.push(format!(
            "Orphaned {} closes: {} {} without {}",
            kind, c, close_tag, open_tag
        )),
        (o, c) if o != c => errors.push(format!(
            "Unmatched {} blocks: {} opens, {} closes",
            kind, o, c
        )),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_template() {
        let report = validate("Dear {client_name|titlecase}, {{#if vip}}welcome back{{/if}}");
        assert!(report.valid, "{:?}", report.errors);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_unbalanced_braces() {
        let report = validate("Hello {name");
        assert!(!report.valid);
        assert_eq!(report.errors[0], "1 unclosed brace(s)");

        let report = validate("Hello name}");
        assert_eq!(report.errors[0], "Unmatched closing brace at position 10");
    }

    #[test]
    fn test_block_pairing() {
        let report = validate("{{#if a}}x");
        assert!(report
            .errors
            .iter()
            .any(|e| e.starts_with("Unclosed conditional blocks: 1")));

        let report = validate("x{{/each}}");
        assert!(report
            .errors
            .iter()
            .any(|e| e.starts_with("Orphaned loop closes: 1")));

        let report = validate("{{#each items}}x{{/each}}");
        assert!(report
            .errors
            .iter()
            .any(|e| e.starts_with("Invalid loop syntax: {{#each items}}")));
    }

    #[test]
    fn test_security_patterns() {
        let report = validate("<script>alert(1)</script>");
        assert!(report.errors.contains(&"Security risk: Script tags detected".to_string()));

        let report = validate("<a href=\"javascript:go()\">");
        assert!(report
            .errors
            .contains(&"Security risk: JavaScript protocol detected".to_string()));
    }

    #[test]
    fn test_warnings() {
        let report = validate("{api_token} { }");
        assert!(report.valid);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("sensitive variable names: {api_token}")));
        assert!(report
            .warnings
            .iter()
            .any(|w| w == "Found 1 empty variable placeholder(s)"));
    }
}
