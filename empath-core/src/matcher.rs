//! The matcher interface and a small set of built-in implementations.
//!
//! A matcher answers one expression item. Most matchers run entirely in
//! the unprivileged child and return [`MatchOutcome::True`]/[`False`]
//! directly; a matcher that must run in the privileged process instead
//! sends its own IPC request and returns [`MatchOutcome::Parent`], leaving
//! the evaluator to suspend and resume from the reply (§4.1, §6).

use std::{collections::HashMap, sync::Arc};

use crate::context::MatchContext;

/// Result of evaluating one expression item against the current context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    True,
    False,
    /// The matcher has already issued its IPC request; the caller must
    /// suspend the context and resume only once the reply arrives.
    Parent,
}

/// Implemented by every matcher. `config` is the opaque, matcher-specific
/// configuration captured on the expression item at load time.
pub trait Matcher: Send + Sync {
    fn name(&self) -> &str;

    /// # Errors
    ///
    /// Returns [`crate::CoreError::MatcherFailed`] if evaluation itself
    /// fails (not to be confused with a `False` result).
    fn evaluate(&self, ctx: &mut MatchContext, config: &str) -> crate::Result<MatchOutcome>;

    /// Short human-readable form used by logs.
    fn describe(&self, config: &str) -> String {
        format!("{}({config})", self.name())
    }
}

/// Looks a tag up in the message's tag store and compares it for equality.
/// `config` has the shape `key=value`.
pub struct TagMatcher;

impl Matcher for TagMatcher {
    fn name(&self) -> &str {
        "tag"
    }

    fn evaluate(&self, ctx: &mut MatchContext, config: &str) -> crate::Result<MatchOutcome> {
        let (key, expected) = config.split_once('=').ok_or_else(|| {
            crate::CoreError::MatcherFailed {
                matcher: self.name().into(),
                reason: format!("malformed tag matcher config: {config}"),
            }
        })?;
        Ok(match ctx.mail().tags().get(key) {
            Some(actual) if actual == expected => MatchOutcome::True,
            _ => MatchOutcome::False,
        })
    }
}

/// True if a header of the given name is present, case-insensitively.
/// `config` is the header name.
pub struct HeaderMatcher;

impl Matcher for HeaderMatcher {
    fn name(&self) -> &str {
        "header"
    }

    fn evaluate(&self, ctx: &mut MatchContext, config: &str) -> crate::Result<MatchOutcome> {
        let needle = format!("{config}:");
        let found = ctx
            .mail()
            .body()
            .lines()
            .take_while(|line| !line.is_empty())
            .any(|line| line.len() >= needle.len() && line[..needle.len()].eq_ignore_ascii_case(&needle));
        Ok(if found { MatchOutcome::True } else { MatchOutcome::False })
    }
}

/// A matcher that always defers to the privileged process. Used to
/// exercise the `PARENT` suspension path; a real deployment would use this
/// for matchers that need privileged filesystem or cache access.
pub struct ParentMatcher;

impl Matcher for ParentMatcher {
    fn name(&self) -> &str {
        "parent"
    }

    fn evaluate(&self, ctx: &mut MatchContext, config: &str) -> crate::Result<MatchOutcome> {
        ctx.send_match_request(self.name(), config)?;
        Ok(MatchOutcome::Parent)
    }
}

/// Looks matchers up by the name recorded on an expression item at config
/// load time.
#[derive(Clone, Default)]
pub struct MatcherRegistry {
    matchers: HashMap<String, Arc<dyn Matcher>>,
}

impl MatcherRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the built-ins this crate ships.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TagMatcher));
        registry.register(Arc::new(HeaderMatcher));
        registry.register(Arc::new(ParentMatcher));
        registry
    }

    pub fn register(&mut self, matcher: Arc<dyn Matcher>) {
        self.matchers.insert(matcher.name().to_string(), matcher);
    }

    /// # Errors
    ///
    /// Returns [`crate::CoreError::UnknownMatcher`] if no matcher is
    /// registered under `name`.
    pub fn get(&self, name: &str) -> crate::Result<Arc<dyn Matcher>> {
        self.matchers
            .get(name)
            .cloned()
            .ok_or_else(|| crate::CoreError::UnknownMatcher(name.to_string()))
    }
}
