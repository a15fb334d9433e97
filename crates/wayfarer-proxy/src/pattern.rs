//! Placeholder pattern compiler.
//!
//! Path templates carry a small vocabulary of named placeholders that expand
//! into capturing regex fragments. Compilation is deterministic: the same
//! template always yields byte-identical regex source, so compiled patterns
//! can be cached and tests are reproducible.
//!
//! Captures extracted from a concrete request URL via a request-side
//! template can be fed back into a response-side template through
//! [`replace_matches`], e.g. echoing an id from the URL into a header value.

use regex::Regex;

use crate::error::{PatternError, Result};

/// A named placeholder recognized inside a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// Numeric player id in function-call form, `pid(123456)`.
    PlayerId,
    /// A UUID.
    Guid,
    /// Sandbox environment enum.
    Sandbox,
    /// Dotted resource name, e.g. `progression.json`.
    Asset,
    /// Service base-url marker.
    Service,
    /// Content-type marker, e.g. `application/json`.
    ContentType,
    /// Non-greedy wildcard.
    Wildcard,
    /// End-of-input anchor (captures nothing).
    End,
}

impl Placeholder {
    /// All placeholders, in token-scan order.
    const ALL: &'static [Placeholder] = &[
        Placeholder::PlayerId,
        Placeholder::Guid,
        Placeholder::Sandbox,
        Placeholder::Asset,
        Placeholder::Service,
        Placeholder::ContentType,
        Placeholder::Wildcard,
        Placeholder::End,
    ];

    /// The literal token spelled in templates.
    pub fn token(&self) -> &'static str {
        match self {
            Placeholder::PlayerId => "{id}",
            Placeholder::Guid => "{guid}",
            Placeholder::Sandbox => "{sandbox}",
            Placeholder::Asset => "{asset}",
            Placeholder::Service => "{service}",
            Placeholder::ContentType => "{ct}",
            Placeholder::Wildcard => "{*}",
            Placeholder::End => "{$}",
        }
    }

    /// The regex fragment the token expands to.
    fn fragment(&self) -> &'static str {
        match self {
            Placeholder::PlayerId => r"pid\((\d+)\)",
            Placeholder::Guid => {
                r"([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})"
            }
            Placeholder::Sandbox => r"(retail|insider|test)",
            Placeholder::Asset => r"([a-z0-9_\-]+(?:\.[a-z0-9_\-]+)+)",
            Placeholder::Service => r"(https?://[a-z0-9.\-]+)",
            Placeholder::ContentType => r"([a-z0-9!#$&^_.+\-]+/[a-z0-9!#$&^_.+\-]+)",
            Placeholder::Wildcard => r"(.*?)",
            Placeholder::End => r"$",
        }
    }
}

/// A compiled, start-anchored, case-insensitive template matcher.
#[derive(Debug, Clone)]
pub struct Pattern {
    regex: Regex,
    source: String,
    placeholders: Vec<Placeholder>,
}

impl Pattern {
    /// Compiles a template into a pattern.
    ///
    /// Recognized placeholders expand into capturing fragments in the order
    /// they appear, left to right. Everything else, including unknown
    /// `{...}` tokens, is escaped and matched literally.
    pub fn compile(template: &str) -> Result<Self, PatternError> {
        let mut source = String::from("(?i)^");
        let mut placeholders = Vec::new();
        let mut rest = template;

        while !rest.is_empty() {
            // Earliest placeholder occurrence wins; tokens cannot overlap.
            let next = Placeholder::ALL
                .iter()
                .filter_map(|p| rest.find(p.token()).map(|at| (at, *p)))
                .min_by_key(|(at, _)| *at);

            match next {
                Some((at, placeholder)) => {
                    source.push_str(&regex::escape(&rest[..at]));
                    source.push_str(placeholder.fragment());
                    placeholders.push(placeholder);
                    rest = &rest[at + placeholder.token().len()..];
                }
                None => {
                    source.push_str(&regex::escape(rest));
                    rest = "";
                }
            }
        }

        let regex = Regex::new(&source)
            .map_err(|e| PatternError::Compile(template.to_string(), e.to_string()))?;

        Ok(Self {
            regex,
            source,
            placeholders,
        })
    }

    /// The generated regex source (stable for a given template).
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The placeholders found in the template, in order of first occurrence.
    pub fn placeholders(&self) -> &[Placeholder] {
        &self.placeholders
    }

    /// Returns true if the pattern matches anywhere at the start of `value`.
    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }

    /// Returns the first match's capture groups in left-to-right order,
    /// skipping empty captures. Empty vec when the value does not match.
    pub fn captures(&self, value: &str) -> Vec<String> {
        match self.regex.captures(value) {
            Some(caps) => caps
                .iter()
                .skip(1)
                .flatten()
                .map(|m| m.as_str().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Replaces every `$N` backreference (1-indexed) in `template` with the
/// corresponding capture.
///
/// An out-of-range index, and `$0`, resolve to the empty string rather than
/// passing through literally. A `$` not followed by a digit stays literal.
pub fn replace_matches(template: &str, captures: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let mut index: Option<usize> = None;
        while let Some(&(_, d)) = chars.peek() {
            if let Some(digit) = d.to_digit(10) {
                index = Some(index.unwrap_or(0) * 10 + digit as usize);
                chars.next();
            } else {
                break;
            }
        }

        match index {
            // 1-indexed; $0 and out-of-range yield the empty string.
            Some(n) if n >= 1 && n <= captures.len() => out.push_str(&captures[n - 1]),
            Some(_) => {}
            None => out.push('$'),
        }
    }

    out
}
