//! Location rewriting.
//!
//! A rule pairs a pattern with a replacement template:
//!
//! ```text
//! pattern:      https://mirror.local/{path:.*}\.jar
//! replacement:  file:///srv/cache/{path}.zip
//! ```
//!
//! `{name:subpattern}` in a pattern captures whatever `subpattern` matches,
//! and `{name}` in the replacement inserts that capture. Everything else is
//! literal text (a `\` makes the next character literal). A pattern without
//! placeholders is a prefix rule: the rest of the location is carried over
//! after the replacement.
//!
//! Patterns must match the whole location. The [`RewriteEngine`] applies its
//! rules repeatedly until none matches, giving up after
//! [`MAX_REWRITE_PASSES`].

use std::collections::HashMap;

use regex::Regex;

use crate::error::{ConfigError, ConfigResult};

/// Upper bound on rewrite passes for a single location.
pub const MAX_REWRITE_PASSES: usize = 100;

const PATTERN_VARIABLE: &str = r"\{([A-Za-z0-9_-]+):([^}]+)\}";
const TEMPLATE_VARIABLE: &str = r"\{([A-Za-z0-9_-]+)\}";

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplatePart {
    Literal(String),
    Group(usize),
}

/// A compiled pattern/replacement pair.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    source: String,
    regex: Regex,
    template: Vec<TemplatePart>,
}

fn invalid(pattern: &str, err: regex::Error) -> ConfigError {
    ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: err.to_string(),
    }
}

/// Literal pattern text as a regex, honoring `\` escapes.
fn literal(text: &str) -> String {
    let mut unescaped = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                unescaped.push(next);
                continue;
            }
        }
        unescaped.push(c);
    }
    regex::escape(&unescaped)
}

impl RewriteRule {
    pub fn new(pattern: &str, replacement: &str) -> ConfigResult<Self> {
        let variable = Regex::new(PATTERN_VARIABLE).map_err(|e| invalid(pattern, e))?;

        let mut raw = String::from("^");
        let mut groups: HashMap<&str, usize> = HashMap::new();
        let mut group_count = 0;
        let mut last = 0;
        for caps in variable.captures_iter(pattern) {
            let (Some(whole), Some(name), Some(sub)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            raw.push_str(&literal(&pattern[last..whole.start()]));
            last = whole.end();

            // groups inside the sub-pattern shift the numbering of later ones
            let nested = Regex::new(sub.as_str())
                .map_err(|e| invalid(pattern, e))?
                .captures_len()
                - 1;
            raw.push('(');
            raw.push_str(sub.as_str());
            raw.push(')');

            groups.insert(name.as_str(), group_count + 1);
            group_count += 1 + nested;
        }
        raw.push_str(&literal(&pattern[last..]));
        let catch_all = groups.is_empty();
        if catch_all {
            raw.push_str("(.*)");
        }
        raw.push('$');
        let regex = Regex::new(&raw).map_err(|e| invalid(pattern, e))?;

        let variable = Regex::new(TEMPLATE_VARIABLE).map_err(|e| invalid(replacement, e))?;
        let mut template = Vec::new();
        let mut last = 0;
        for caps in variable.captures_iter(replacement) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            push_literal(&mut template, &replacement[last..whole.start()]);
            last = whole.end();
            match groups.get(name.as_str()) {
                Some(&index) => template.push(TemplatePart::Group(index)),
                None => push_literal(&mut template, whole.as_str()),
            }
        }
        push_literal(&mut template, &replacement[last..]);
        if catch_all {
            template.push(TemplatePart::Group(1));
        }

        Ok(Self {
            source: pattern.to_string(),
            regex,
            template,
        })
    }

    /// The pattern as written in the configuration.
    pub fn pattern(&self) -> &str {
        &self.source
    }

    /// Rewrite `value` if the pattern matches all of it.
    pub fn rewrite(&self, value: &str) -> Option<String> {
        let caps = self.regex.captures(value)?;
        let mut out = String::with_capacity(value.len());
        for part in &self.template {
            match part {
                TemplatePart::Literal(text) => out.push_str(text),
                TemplatePart::Group(index) => {
                    out.push_str(caps.get(*index).map(|m| m.as_str()).unwrap_or(""))
                }
            }
        }
        Some(out)
    }
}

fn push_literal(template: &mut Vec<TemplatePart>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(TemplatePart::Literal(prev)) = template.last_mut() {
        prev.push_str(text);
    } else {
        template.push(TemplatePart::Literal(text.to_string()));
    }
}

/// Ordered rule set applied until a location stops changing.
#[derive(Debug, Clone, Default)]
pub struct RewriteEngine {
    rules: Vec<RewriteRule>,
}

impl RewriteEngine {
    pub fn new(rules: Vec<RewriteRule>) -> Self {
        Self { rules }
    }

    /// Compile `(pattern, replacement)` pairs in order.
    pub fn compile<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> ConfigResult<Self> {
        let rules = pairs
            .into_iter()
            .map(|(pattern, replacement)| RewriteRule::new(pattern, replacement))
            .collect::<ConfigResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[RewriteRule] {
        &self.rules
    }

    /// One pass: the first matching rule's output.
    fn rewrite_once(&self, value: &str) -> Option<String> {
        self.rules.iter().find_map(|rule| rule.rewrite(value))
    }

    /// Rewrite a location until no rule matches or the output stops changing.
    pub fn rewrite(&self, location: &str) -> ConfigResult<String> {
        let mut value = location.to_string();
        for pass in 0..MAX_REWRITE_PASSES {
            match self.rewrite_once(&value) {
                Some(next) if next != value => {
                    tracing::trace!(pass, from = %value, to = %next, "rewrote location");
                    value = next;
                }
                _ => return Ok(value),
            }
        }
        Err(ConfigError::RewriteLoop {
            location: location.to_string(),
            passes: MAX_REWRITE_PASSES,
        })
    }
}
