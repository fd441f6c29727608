//! Template text → node tree.
//!
//! Unmatched or malformed block tags are kept as literal text so the renderer
//! can flag them as unprocessed delimiters.

use super::{ConditionalBlock, LoopBlock, TemplateVariable};
use crate::condition::Condition;
use once_cell::sync::Lazy;
use regex::Regex;

/// `{{#each items as item}}` header (inside the braces).
static EACH_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^#each\s+([A-Za-z_$][\w$]*(?:\.[\w$]+)*)\s+as\s+([A-Za-z_$][\w$]*)$").unwrap()
});

/// Variable path inside `{...}` before any `|`.
static VARIABLE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_$][\w$-]*(?:\.[\w$-]+)*$").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Text(String),
    Variable {
        variable: TemplateVariable,
        placeholder: String,
    },
    /// Index into the compiled template's conditionals.
    Conditional(usize),
    /// Index into the compiled template's loops.
    Loop(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Else,
    EndIf,
    EndEach,
    Eof,
}

/// Result of parsing a whole template.
pub(crate) struct ParsedTemplate {
    pub nodes: Vec<Node>,
    pub variables: Vec<TemplateVariable>,
    pub conditionals: Vec<ConditionalBlock>,
    pub loops: Vec<LoopBlock>,
}

pub(crate) fn parse(source: &str) -> ParsedTemplate {
    let mut parser = TemplateParser {
        src: source,
        pos: 0,
        stop_start: 0,
        variables: Vec::new(),
        conditionals: Vec::new(),
        loops: Vec::new(),
    };
    let (nodes, _) = parser.parse_until(&[]);

    ParsedTemplate {
        nodes,
        variables: parser.variables,
        conditionals: parser.conditionals,
        loops: parser.loops,
    }
}

/// Parse `name.path|"default"|formatter|...`.
pub(crate) fn parse_variable_expression(expression: &str) -> Option<TemplateVariable> {
    let mut parts = expression.split('|');
    let name = parts.next()?.trim();
    if !VARIABLE_NAME.is_match(name) {
        return None;
    }

    let mut default_value = None;
    let mut formatters = Vec::new();
    for (i, part) in parts.enumerate() {
        let part = part.trim();
        if i == 0 && (part.starts_with('"') || part.starts_with('\'')) {
            default_value = Some(strip_quotes(part).to_string());
        } else if !part.is_empty() {
            formatters.push(part.to_string());
        }
    }

    Some(TemplateVariable {
        name: name.to_string(),
        path: name.split('.').map(str::to_string).collect(),
        required: default_value.is_none(),
        default_value,
        formatters,
    })
}

fn strip_quotes(part: &str) -> &str {
    let quote = &part[..1];
    let inner = &part[1..];
    inner.strip_suffix(quote).unwrap_or(inner)
}

/// Inner text and total length of a `{{...}}` tag at the start of `rest`.
fn tag(rest: &str) -> Option<(&str, usize)> {
    let body = rest.strip_prefix("{{")?;
    let end = body.find("}}")?;
    Some((body[..end].trim(), end + 4))
}

struct TemplateParser<'a> {
    src: &'a str,
    pos: usize,
    /// Start offset of the most recently consumed stop tag.
    stop_start: usize,
    variables: Vec<TemplateVariable>,
    conditionals: Vec<ConditionalBlock>,
    loops: Vec<LoopBlock>,
}

struct Mark {
    pos: usize,
    variables: usize,
    conditionals: usize,
    loops: usize,
}

impl<'a> TemplateParser<'a> {
    fn mark(&self) -> Mark {
        Mark {
            pos: self.pos,
            variables: self.variables.len(),
            conditionals: self.conditionals.len(),
            loops: self.loops.len(),
        }
    }

    fn reset(&mut self, mark: Mark) {
        self.pos = mark.pos;
        self.variables.truncate(mark.variables);
        self.conditionals.truncate(mark.conditionals);
        self.loops.truncate(mark.loops);
    }

    fn parse_until(&mut self, stops: &[Stop]) -> (Vec<Node>, Stop) {
        let src = self.src;
        let mut nodes = Vec::new();
        let mut text = String::new();

        while self.pos < src.len() {
            let rest = &src[self.pos..];

            match rest.find('{') {
                Some(0) => {}
                Some(n) => {
                    text.push_str(&rest[..n]);
                    self.pos += n;
                    continue;
                }
                None => {
                    text.push_str(rest);
                    self.pos = src.len();
                    break;
                }
            }

            if rest.starts_with("{{") {
                if let Some((inner, len)) = tag(rest) {
                    let stop = match inner {
                        "else" => Some(Stop::Else),
                        "/if" => Some(Stop::EndIf),
                        "/each" => Some(Stop::EndEach),
                        _ => None,
                    };
                    if let Some(stop) = stop {
                        if stops.contains(&stop) {
                            flush(&mut text, &mut nodes);
                            self.stop_start = self.pos;
                            self.pos += len;
                            return (nodes, stop);
                        }
                        text.push_str(&rest[..len]);
                        self.pos += len;
                        continue;
                    }

                    let block = if inner.starts_with("#if") {
                        self.conditional(inner, len)
                    } else if inner.starts_with("#each") {
                        self.each(inner, len)
                    } else {
                        None
                    };
                    if let Some(node) = block {
                        flush(&mut text, &mut nodes);
                        nodes.push(node);
                        continue;
                    }
                }
                text.push_str("{{");
                self.pos += 2;
                continue;
            }

            if let Some((node, len)) = variable(rest) {
                flush(&mut text, &mut nodes);
                if let Node::Variable { variable, .. } = &node {
                    self.variables.push(variable.clone());
                }
                nodes.push(node);
                self.pos += len;
                continue;
            }

            text.push('{');
            self.pos += 1;
        }

        flush(&mut text, &mut nodes);
        (nodes, Stop::Eof)
    }

    fn conditional(&mut self, inner: &str, tag_len: usize) -> Option<Node> {
        let condition = inner.strip_prefix("#if")?;
        if !condition.starts_with(char::is_whitespace) || condition.trim().is_empty() {
            return None;
        }
        let condition = condition.trim().to_string();

        let mark = self.mark();
        self.pos += tag_len;
        let body_start = self.pos;

        let (then_nodes, stop) = self.parse_until(&[Stop::Else, Stop::EndIf]);
        if stop == Stop::Eof {
            self.reset(mark);
            return None;
        }
        let content = self.src[body_start..self.stop_start].to_string();

        let (else_nodes, else_content) = match stop {
            Stop::Else => {
                let else_start = self.pos;
                let (nodes, stop) = self.parse_until(&[Stop::EndIf]);
                if stop != Stop::EndIf {
                    self.reset(mark);
                    return None;
                }
                (nodes, Some(self.src[else_start..self.stop_start].to_string()))
            }
            _ => (Vec::new(), None),
        };

        self.conditionals.push(ConditionalBlock {
            guard: Condition::parse(&condition),
            condition,
            content,
            else_content,
            then_nodes,
            else_nodes,
        });
        Some(Node::Conditional(self.conditionals.len() - 1))
    }

    fn each(&mut self, inner: &str, tag_len: usize) -> Option<Node> {
        let caps = EACH_HEADER.captures(inner)?;
        let array_variable = caps.get(1)?.as_str().to_string();
        let item_variable = caps.get(2)?.as_str().to_string();

        let mark = self.mark();
        self.pos += tag_len;
        let body_start = self.pos;

        let (body, stop) = self.parse_until(&[Stop::EndEach]);
        if stop != Stop::EndEach {
            self.reset(mark);
            return None;
        }

        self.loops.push(LoopBlock {
            content: self.src[body_start..self.stop_start].to_string(),
            array_variable,
            item_variable,
            body,
        });
        Some(Node::Loop(self.loops.len() - 1))
    }
}

fn variable(rest: &str) -> Option<(Node, usize)> {
    let end = rest.find('}')?;
    let inner = &rest[1..end];
    if inner.contains('{') {
        return None;
    }
    let variable = parse_variable_expression(inner)?;
    Some((
        Node::Variable {
            variable,
            placeholder: rest[..=end].to_string(),
        },
        end + 1,
    ))
}

fn flush(text: &mut String, nodes: &mut Vec<Node>) {
    if !text.is_empty() {
        nodes.push(Node::Text(std::mem::take(text)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_expression() {
        let var = parse_variable_expression("client.name|\"Guest\"|uppercase").unwrap();
        assert_eq!(var.name, "client.name");
        assert_eq!(var.path, vec!["client", "name"]);
        assert_eq!(var.default_value.as_deref(), Some("Guest"));
        assert!(!var.required);
        assert_eq!(var.formatters, vec!["uppercase"]);

        let var = parse_variable_expression("price|currency").unwrap();
        assert!(var.required);
        assert_eq!(var.formatters, vec!["currency"]);

        assert!(parse_variable_expression(" ").is_none());
        assert!(parse_variable_expression("\"a\": 1").is_none());
    }

    #[test]
    fn test_parse_blocks() {
        let parsed = parse("Hi {name}! {{#if vip}}VIP {tier}{{else}}Std{{/if}}{{#each items as it}}[{it.name}]{{/each}}");
        assert_eq!(parsed.conditionals.len(), 1);
        assert_eq!(parsed.loops.len(), 1);
        assert_eq!(parsed.conditionals[0].condition, "vip");
        assert_eq!(parsed.conditionals[0].content, "VIP {tier}");
        assert_eq!(parsed.conditionals[0].else_content.as_deref(), Some("Std"));
        assert_eq!(parsed.loops[0].array_variable, "items");
        assert_eq!(parsed.loops[0].item_variable, "it");
        assert_eq!(parsed.loops[0].content, "[{it.name}]");

        let names: Vec<_> = parsed.variables.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["name", "tier", "it.name"]);
    }

    #[test]
    fn test_nested_blocks() {
        let parsed = parse("{{#each items as it}}{{#if it.vip}}*{{/if}}{it.name}{{/each}}");
        assert_eq!(parsed.loops.len(), 1);
        assert_eq!(parsed.conditionals.len(), 1);
        assert_eq!(parsed.loops[0].body[0], Node::Conditional(0));
    }

    #[test]
    fn test_unmatched_block_stays_text() {
        let parsed = parse("{{#if open}}never closed");
        assert!(parsed.conditionals.is_empty());
        assert_eq!(
            parsed.nodes,
            vec![Node::Text("{{#if open}}never closed".to_string())]
        );

        let parsed = parse("{{#each items}}x{{/each}}");
        assert!(parsed.loops.is_empty());
    }

    #[test]
    fn test_literal_braces() {
        let parsed = parse("a { b c } d {}");
        assert_eq!(parsed.nodes, vec![Node::Text("a { b c } d {}".to_string())]);
    }
}
