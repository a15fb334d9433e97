//! Route table: configured rewrite rules compiled into ordered handlers.
//!
//! Built once at startup from the loaded config and immutable afterwards,
//! so it is shared across concurrent requests without locking. Each rule
//! with a populated request or response rewrite becomes one handler; rules
//! with neither are valid documentation-only no-ops. Matching is
//! first-match-wins per phase.

use std::collections::HashMap;
use std::process::Command;

use wayfarer_core::{Config, RewriteConfig};

use crate::domains::Domain;
use crate::error::{PatternError, Result};
use crate::pattern::{replace_matches, Pattern};

/// A rewrite applied when its handler matches.
#[derive(Debug, Clone)]
pub struct RewriteSpec {
    /// Replacement body template (`$N` backrefs allowed).
    pub body: Option<String>,
    /// Header templates (`$N` backrefs allowed in values).
    pub headers: HashMap<String, String>,
    /// Status override (response phase only).
    pub status: Option<u16>,
    /// Shell commands run before substitution; failures are swallowed.
    pub pre_hooks: Vec<String>,
}

impl From<&RewriteConfig> for RewriteSpec {
    fn from(config: &RewriteConfig) -> Self {
        Self {
            body: config.body.clone(),
            headers: config.headers.clone(),
            status: config.status,
            pre_hooks: config.pre_hooks.clone(),
        }
    }
}

impl RewriteSpec {
    /// Runs the configured pre-hook commands, if any. A failing hook is
    /// logged and skipped; it never aborts rule application.
    pub fn run_pre_hooks(&self) {
        for hook in &self.pre_hooks {
            match Command::new("sh").arg("-c").arg(hook).status() {
                Ok(status) if status.success() => {
                    tracing::debug!("pre-hook ok: {}", hook);
                }
                Ok(status) => {
                    tracing::warn!("pre-hook exited with {}: {}", status, hook);
                }
                Err(e) => {
                    tracing::warn!("pre-hook failed to spawn: {}: {}", hook, e);
                }
            }
        }
    }

    /// The substituted replacement body, if one is configured.
    pub fn substituted_body(&self, captures: &[String]) -> Option<Vec<u8>> {
        self.body
            .as_ref()
            .map(|template| replace_matches(template, captures).into_bytes())
    }

    /// The substituted header set.
    pub fn substituted_headers(&self, captures: &[String]) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|(name, template)| (name.clone(), replace_matches(template, captures)))
            .collect()
    }
}

/// One registered handler: a compiled matcher plus its rewrite.
#[derive(Debug, Clone)]
struct RouteHandler {
    domain: Domain,
    pattern: Pattern,
    /// Uppercased method allow-list; empty means any method.
    methods: Vec<String>,
    rewrite: RewriteSpec,
}

impl RouteHandler {
    fn matches(&self, url: &str, method: &str) -> Option<Vec<String>> {
        if !self.methods.is_empty()
            && !self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
        {
            return None;
        }
        if !self.pattern.is_match(url) {
            return None;
        }
        Some(self.pattern.captures(url))
    }
}

/// A matched handler, ready to apply.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    /// The rewrite to apply.
    pub rewrite: &'a RewriteSpec,
    /// Captures extracted from the request URL, in template order.
    pub captures: Vec<String>,
}

/// Ordered request/response handler lists.
#[derive(Debug, Default)]
pub struct RouteTable {
    request: Vec<RouteHandler>,
    response: Vec<RouteHandler>,
}

impl RouteTable {
    /// A table with zero handlers (bare pass-through proxy).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds the table from a loaded config.
    ///
    /// Rejects a schema-version mismatch before registering anything; the
    /// caller downgrades to [`RouteTable::empty`] in that case. Unknown
    /// domain sections are skipped with a warning, never an error.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.check_schema()?;

        let mut table = Self::empty();

        for (section, rules) in &config.domains {
            let Some(domain) = Domain::from_config_key(section) else {
                tracing::warn!("ignoring unknown domain section '{}'", section);
                continue;
            };

            for rule in rules {
                let methods: Vec<String> =
                    rule.methods.iter().map(|m| m.to_ascii_uppercase()).collect();

                if let Some(request) = rule.request.as_ref().filter(|r| !r.is_empty()) {
                    table.request.push(Self::handler(
                        domain,
                        &rule.path,
                        methods.clone(),
                        request,
                    )?);
                }
                if let Some(response) = rule.response.as_ref().filter(|r| !r.is_empty()) {
                    table.response.push(Self::handler(
                        domain,
                        &rule.path,
                        methods.clone(),
                        response,
                    )?);
                }
            }
        }

        tracing::info!(
            "route table: {} request handler(s), {} response handler(s)",
            table.request.len(),
            table.response.len()
        );

        Ok(table)
    }

    fn handler(
        domain: Domain,
        path: &str,
        methods: Vec<String>,
        rewrite: &RewriteConfig,
    ) -> Result<RouteHandler, PatternError> {
        let pattern = Pattern::compile(&format!("{}{}", domain.host(), path))?;
        Ok(RouteHandler {
            domain,
            pattern,
            methods,
            rewrite: rewrite.into(),
        })
    }

    /// First matching request handler for the given URL and method.
    pub fn match_request(&self, url: &str, method: &str) -> Option<RouteMatch<'_>> {
        Self::first_match(&self.request, url, method)
    }

    /// First matching response handler for the given URL and method.
    pub fn match_response(&self, url: &str, method: &str) -> Option<RouteMatch<'_>> {
        Self::first_match(&self.response, url, method)
    }

    fn first_match<'a>(
        handlers: &'a [RouteHandler],
        url: &str,
        method: &str,
    ) -> Option<RouteMatch<'a>> {
        handlers.iter().find_map(|handler| {
            handler.matches(url, method).map(|captures| {
                tracing::debug!(
                    "rule matched on {:?} for {} {}",
                    handler.domain,
                    method,
                    url
                );
                RouteMatch {
                    rewrite: &handler.rewrite,
                    captures,
                }
            })
        })
    }

    /// Registered handler counts (request, response).
    pub fn handler_counts(&self) -> (usize, usize) {
        (self.request.len(), self.response.len())
    }
}
