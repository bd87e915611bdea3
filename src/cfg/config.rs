// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Hierarchical, braced configuration dialect (§4.1).
//!
//! A document is a tree of [`ConfigDomain`]s: braced sections
//! (`<name> ... </name>`) nest arbitrarily deep and each holds an
//! insertion-ordered set of `key=value` parameters plus an insertion-ordered
//! set of sub-domains. Two path grammars address content: `/a/b/c` names a
//! domain, `/a/b<k>` names a parameter inside domain `/a/b`.

use std::collections::HashMap;

use thiserror::Error;

/// Errors raised while parsing or navigating a [`ConfigDomain`] tree.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "line {line}: mismatched closing tag, expected </{expected}> but found </{found}>"
    )]
    MismatchedClose {
        line: usize,
        expected: String,
        found: String,
    },
    #[error("line {line}: closing tag </{name}> has no matching open section")]
    UnmatchedClose { line: usize, name: String },
    #[error("unterminated section <{name}>: end of input reached before </{name}>")]
    UnterminatedSection { name: String },
    #[error("line {line}: not a valid key=value pair: {text:?}")]
    InvalidKeyValue { line: usize, text: String },
    #[error("invalid parameter path {path:?}: must start with '/' and contain '<' and '>'")]
    InvalidParamPath { path: String },
    #[error("invalid domain path {path:?}")]
    InvalidDomainPath { path: String },
    #[error("no such domain: {path}")]
    NoSuchDomain { path: String },
    #[error("no such parameter: {path}")]
    NoSuchParameter { path: String },
}

/// One item of a domain's body, in the order it was encountered, used to
/// reproduce a faithful round-trip serialization (including comments).
#[derive(Debug, Clone)]
enum BodyItem {
    Param(String),
    SubDomain(String),
    Comment(String),
}

/// A single braced section of the configuration tree.
#[derive(Debug, Clone, Default)]
pub struct ConfigDomain {
    pub name: String,
    pub params: HashMap<String, String>,
    pub param_insertion_order: Vec<String>,
    /// Comment lines (`#`-prefixed), verbatim, in encounter order.
    pub raw_lines: Vec<String>,
    pub subdomains: HashMap<String, ConfigDomain>,
    pub subdomain_insertion_order: Vec<String>,
    body: Vec<BodyItem>,
}

impl ConfigDomain {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Sets (or re-assigns) a parameter. Re-assignment moves the key to the
    /// end of the insertion order, per §4.1.
    pub fn set_param(&mut self, key: &str, value: &str) {
        if self.params.insert(key.to_string(), value.to_string()).is_some() {
            self.param_insertion_order.retain(|k| k != key);
            self.body.retain(|i| !matches!(i, BodyItem::Param(k) if k == key));
        }
        self.param_insertion_order.push(key.to_string());
        self.body.push(BodyItem::Param(key.to_string()));
    }

    fn push_comment(&mut self, line: String) {
        self.raw_lines.push(line.clone());
        self.body.push(BodyItem::Comment(line));
    }

    /// Adopts a fully-parsed child domain. If a sub-domain with the same
    /// name already exists, the two are joined with `update_mode = true`
    /// (the newly-closed section's parameters win), matching §4.1's join
    /// semantics for a section reopened later in the same parent.
    fn adopt_subdomain(&mut self, child: ConfigDomain) -> Result<(), ConfigError> {
        if let Some(existing) = self.subdomains.remove(&child.name) {
            let merged = join(&existing, &child, true)?;
            self.subdomains.insert(merged.name.clone(), merged);
        } else {
            self.subdomain_insertion_order.push(child.name.clone());
            self.body.push(BodyItem::SubDomain(child.name.clone()));
            self.subdomains.insert(child.name.clone(), child);
        }
        Ok(())
    }

    /// Looks up a direct sub-domain by name.
    pub fn child(&self, name: &str) -> Option<&ConfigDomain> {
        self.subdomains.get(name)
    }

    /// Returns the direct sub-domains in insertion order.
    pub fn children(&self) -> impl Iterator<Item = &ConfigDomain> {
        self.subdomain_insertion_order
            .iter()
            .filter_map(move |n| self.subdomains.get(n))
    }

    /// Navigates a domain path (`/a/b/c`, or `""` for the root) relative to
    /// this domain.
    pub fn get_domain(&self, path: &str) -> Result<&ConfigDomain, ConfigError> {
        if path.is_empty() {
            return Ok(self);
        }
        let segs = split_domain_path(path)?;
        let mut cur = self;
        for seg in segs {
            cur = cur
                .child(seg)
                .ok_or_else(|| ConfigError::NoSuchDomain { path: path.to_string() })?;
        }
        Ok(cur)
    }

    /// `get(path, default)`: strict on a missing domain, defaulted on a
    /// missing parameter (Testable Property #2).
    pub fn get(&self, path: &str, default: &str) -> Result<String, ConfigError> {
        let (domain_path, key) = split_param_path(path)?;
        let domain = self.get_domain(domain_path)?;
        Ok(domain.params.get(key).cloned().unwrap_or_else(|| default.to_string()))
    }

    /// `get(path)`: strict on both a missing domain and a missing parameter.
    pub fn get_strict(&self, path: &str) -> Result<String, ConfigError> {
        let (domain_path, key) = split_param_path(path)?;
        let domain = self.get_domain(domain_path)?;
        domain
            .params
            .get(key)
            .cloned()
            .ok_or_else(|| ConfigError::NoSuchParameter { path: path.to_string() })
    }

    /// Serializes this domain (and everything beneath it) back into the
    /// braced dialect, one tab of indentation per nesting level. The domain
    /// itself is not wrapped in `<name>...</name>` if it has no name (the
    /// root).
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        if self.name.is_empty() {
            self.serialize_body(&mut out, 0);
        } else {
            self.serialize_tagged(&mut out, 0);
        }
        out
    }

    fn serialize_tagged(&self, out: &mut String, depth: usize) {
        let indent = "\t".repeat(depth);
        out.push_str(&indent);
        out.push('<');
        out.push_str(&self.name);
        out.push_str(">\n");
        self.serialize_body(out, depth + 1);
        out.push_str(&indent);
        out.push_str("</");
        out.push_str(&self.name);
        out.push_str(">\n");
    }

    fn serialize_body(&self, out: &mut String, depth: usize) {
        let indent = "\t".repeat(depth);
        for item in &self.body {
            match item {
                BodyItem::Comment(line) => {
                    out.push_str(&indent);
                    out.push_str(line);
                    out.push('\n');
                },
                BodyItem::Param(key) => {
                    if let Some(value) = self.params.get(key) {
                        out.push_str(&indent);
                        out.push_str(key);
                        out.push('=');
                        out.push_str(&escape(value));
                        out.push('\n');
                    }
                },
                BodyItem::SubDomain(name) => {
                    if let Some(sub) = self.subdomains.get(name) {
                        sub.serialize_tagged(out, depth);
                    }
                },
            }
        }
    }
}

/// One item extracted while scanning a physical line; a line may carry
/// several of these (`<root><server>...`), which is why `parse` tokenizes
/// before it touches the domain stack instead of treating a whole trimmed
/// line as a single token.
enum LineToken {
    Open(String),
    Close(String),
    KeyValue(String, String),
    /// Plain text found between tags, e.g. the `Demo` in `<app>Demo</app>`.
    Text(String),
}

/// Splits one trimmed, non-comment line into its `<tag>`/`key=value`/text
/// tokens, left to right.
fn tokenize_line(line: &str, line_no: usize) -> Result<Vec<LineToken>, ConfigError> {
    let mut tokens = Vec::new();
    let mut pos = 0usize;

    while pos < line.len() {
        match line[pos..].find('<') {
            Some(rel) => {
                let lt = pos + rel;
                push_text_token(&mut tokens, line[pos..lt].trim(), line_no)?;
                let Some(gt_rel) = line[lt..].find('>') else {
                    return Err(ConfigError::InvalidKeyValue { line: line_no, text: line.to_string() });
                };
                let gt = lt + gt_rel;
                let inner = line[lt + 1..gt].trim();
                match inner.strip_prefix('/') {
                    Some(name) => tokens.push(LineToken::Close(name.trim().to_string())),
                    None => tokens.push(LineToken::Open(inner.to_string())),
                }
                pos = gt + 1;
            },
            None => {
                push_text_token(&mut tokens, line[pos..].trim(), line_no)?;
                pos = line.len();
            },
        }
    }

    Ok(tokens)
}

fn push_text_token(tokens: &mut Vec<LineToken>, text: &str, line_no: usize) -> Result<(), ConfigError> {
    if text.is_empty() {
        return Ok(());
    }
    if text.contains('=') {
        let (key, value) = parse_kv(text, line_no)?;
        tokens.push(LineToken::KeyValue(key, value));
    } else {
        tokens.push(LineToken::Text(text.to_string()));
    }
    Ok(())
}

/// Parses a complete configuration document into its root domain.
///
/// Most lines carry exactly one token, but a domain may also be written
/// inline as `<name>value</name>` (no nested tags, no `=`) — several of
/// these, or full `<tag>` pairs, can be packed onto a single physical line.
/// A domain closed with no params and no subdomains of its own, but with
/// inline text collected while it was open, is folded into a parameter on
/// its parent rather than kept as an empty subdomain; a domain with nothing
/// between its tags (`<client></client>`) stays a domain.
pub fn parse(text: &str) -> Result<ConfigDomain, ConfigError> {
    let mut stack = vec![ConfigDomain::new("")];
    let mut leaf_text: Vec<Option<String>> = vec![None];

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('#') {
            stack.last_mut().expect("root always present").push_comment(line.to_string());
            continue;
        }

        for token in tokenize_line(line, line_no)? {
            match token {
                LineToken::Open(name) => {
                    stack.push(ConfigDomain::new(name));
                    leaf_text.push(Some(String::new()));
                },
                LineToken::Close(name) => {
                    if stack.len() <= 1 {
                        return Err(ConfigError::UnmatchedClose { line: line_no, name });
                    }
                    let finished = stack.pop().expect("checked len > 1");
                    let finished_leaf = leaf_text.pop().expect("stack and leaf_text stay in lockstep");
                    if finished.name != name {
                        return Err(ConfigError::MismatchedClose {
                            line: line_no,
                            expected: finished.name,
                            found: name,
                        });
                    }
                    let parent = stack.last_mut().expect("root always present");
                    match finished_leaf {
                        Some(value)
                            if !value.trim().is_empty()
                                && finished.params.is_empty()
                                && finished.subdomains.is_empty() =>
                        {
                            parent.set_param(&finished.name, value.trim());
                        },
                        _ => parent.adopt_subdomain(finished)?,
                    }
                },
                LineToken::KeyValue(key, value) => {
                    stack.last_mut().expect("root always present").set_param(&key, &value);
                    if let Some(slot) = leaf_text.last_mut() {
                        *slot = None;
                    }
                },
                LineToken::Text(text) => {
                    if let Some(Some(existing)) = leaf_text.last_mut() {
                        existing.push_str(&text);
                    }
                },
            }
        }
    }

    if stack.len() != 1 {
        let unterminated = stack.pop().expect("checked len != 1 so len >= 2");
        return Err(ConfigError::UnterminatedSection { name: unterminated.name });
    }

    Ok(stack.pop().expect("exactly one root remains"))
}

/// Joins two domains of the same logical section: in update-mode the
/// parameters of `b` override `a` on conflict, otherwise `a` wins. Per
/// §4.1, the join is performed by re-serializing each domain's body and
/// re-parsing their concatenation, letting "re-assignment moves a key to
/// the end and the last assignment wins" do the actual merge work.
pub fn join(
    a: &ConfigDomain,
    b: &ConfigDomain,
    update_mode: bool,
) -> Result<ConfigDomain, ConfigError> {
    let mut a_body = String::new();
    a.serialize_body(&mut a_body, 0);
    let mut b_body = String::new();
    b.serialize_body(&mut b_body, 0);

    let concatenated =
        if update_mode { format!("{a_body}{b_body}") } else { format!("{b_body}{a_body}") };

    let wrapped = format!("<{name}>\n{concatenated}</{name}>\n", name = a.name);
    let root = parse(&wrapped)?;
    root.subdomains
        .into_iter()
        .next()
        .map(|(_, d)| d)
        .ok_or_else(|| ConfigError::NoSuchDomain { path: a.name.clone() })
}

fn parse_kv(line: &str, line_no: usize) -> Result<(String, String), ConfigError> {
    let bytes = line.as_bytes();
    let mut i = 0;
    let mut split_at = None;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'=' => {
                split_at = Some(i);
                break;
            },
            _ => i += 1,
        }
    }
    let Some(eq) = split_at else {
        return Err(ConfigError::InvalidKeyValue {
            line: line_no,
            text: line.to_string(),
        });
    };
    let key = line[..eq].trim().to_string();
    if key.is_empty() {
        return Err(ConfigError::InvalidKeyValue {
            line: line_no,
            text: line.to_string(),
        });
    }
    let value = unescape(line[eq + 1..].trim());
    Ok((key, value))
}

/// Splits a parameter path (`/a/b<k>`) into its domain path and key.
fn split_param_path(path: &str) -> Result<(&str, &str), ConfigError> {
    let invalid = || ConfigError::InvalidParamPath { path: path.to_string() };
    if !path.starts_with('/') {
        return Err(invalid());
    }
    let lt = path.find('<').ok_or_else(invalid)?;
    let gt = path.rfind('>').ok_or_else(invalid)?;
    if gt <= lt + 1 || gt != path.len() - 1 {
        return Err(invalid());
    }
    Ok((&path[..lt], &path[lt + 1..gt]))
}

/// Splits a domain path (`/a/b/c`) into its segments; `""` addresses the
/// root, but a bare `"/"` is invalid (an empty segment).
fn split_domain_path(path: &str) -> Result<Vec<&str>, ConfigError> {
    let invalid = || ConfigError::InvalidDomainPath { path: path.to_string() };
    if path.is_empty() {
        return Ok(Vec::new());
    }
    if !path.starts_with('/') {
        return Err(invalid());
    }
    let rest = &path[1..];
    if rest.is_empty() {
        // bare "/" with nothing after it
        return Err(invalid());
    }
    let segs: Vec<&str> = rest.split('/').collect();
    if segs.iter().any(|s| s.is_empty()) {
        return Err(invalid());
    }
    Ok(segs)
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('\\') => out.push('\\'),
                Some('r') => out.push('\r'),
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('=') => out.push('='),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                },
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '=' => out.push_str("\\="),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_order() {
        let src = "<root>\n<server>\napp=Demo\nserver=S\n</server>\n</root>\n";
        let parsed = parse(src).expect("parse");
        let serialized = parsed.serialize();
        let reparsed = parse(&serialized).expect("reparse");

        let server = reparsed.get_domain("/root/server").expect("domain exists");
        assert_eq!(server.param_insertion_order, vec!["app", "server"]);
        assert_eq!(server.params.get("app").map(String::as_str), Some("Demo"));
    }

    #[test]
    fn get_with_default_only_catches_missing_parameter() {
        let parsed = parse("<a>\nx=1\n</a>\n").expect("parse");
        assert_eq!(parsed.get("/a<missing>", "fallback").unwrap(), "fallback");
        assert!(parsed.get("/missing<x>", "fallback").is_err());
        assert!(parsed.get_strict("/a<missing>").is_err());
    }

    #[test]
    fn scenario_s3_demo_server() {
        let src = "<root><server><app>Demo</app><server>S</server></server></root>";
        let parsed = parse(src).expect("parse");
        assert_eq!(parsed.get_strict("/root/server<app>").unwrap(), "Demo");
    }

    #[test]
    fn reassignment_moves_key_to_end() {
        let mut d = ConfigDomain::new("x");
        d.set_param("a", "1");
        d.set_param("b", "2");
        d.set_param("a", "3");
        assert_eq!(d.param_insertion_order, vec!["b", "a"]);
        assert_eq!(d.params.get("a").map(String::as_str), Some("3"));
    }

    #[test]
    fn escaped_equals_in_value() {
        let parsed = parse("<a>\nkey=left\\=right\n</a>\n").expect("parse");
        assert_eq!(parsed.get_strict("/a<key>").unwrap(), "left=right");
    }

    #[test]
    fn mismatched_close_is_an_error() {
        let err = parse("<a>\n</b>\n").unwrap_err();
        assert!(matches!(err, ConfigError::MismatchedClose { .. }));
    }

    #[test]
    fn unterminated_section_is_an_error() {
        let err = parse("<a>\nx=1\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnterminatedSection { .. }));
    }

    #[test]
    fn bare_slash_domain_path_is_invalid() {
        let parsed = parse("<a>\nx=1\n</a>\n").expect("parse");
        assert!(parsed.get_domain("/").is_err());
        assert!(parsed.get_domain("").is_ok());
    }

    #[test]
    fn reopened_section_joins_with_new_values_winning() {
        let src = "<a>\nx=1\ny=2\n</a>\n<a>\nx=9\n</a>\n";
        let parsed = parse(src).expect("parse");
        let a = parsed.child("a").expect("a exists");
        assert_eq!(a.params.get("x").map(String::as_str), Some("9"));
        assert_eq!(a.params.get("y").map(String::as_str), Some("2"));
    }
}
