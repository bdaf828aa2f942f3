//! The rule tree, actions and accounts: the declarative ruleset the state
//! machine walks. All of it is immutable once loaded (§3).

use serde::{Deserialize, Serialize};

/// A named mail source. `users`/`find_uid` participate in the rule → action
/// → account → default precedence chain (§4.3); `keep` forces `KEEP` for
/// every message fetched from this account regardless of ruleset outcome —
/// applied by the caller of the state machine, not the machine itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    #[serde(default)]
    pub users: Option<Vec<u32>>,
    #[serde(default)]
    pub find_uid: bool,
    #[serde(default)]
    pub keep: bool,
}

impl Account {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            users: None,
            find_uid: false,
            keep: false,
        }
    }
}

/// One deliverer invocation within an [`Action`]. `deliverer` names a
/// registered implementation (§6); `config` is opaque, deliverer-specific
/// configuration captured verbatim from the ruleset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionItem {
    pub deliverer: String,
    #[serde(default)]
    pub config: String,
}

/// A named, ordered list of action items; the unit a rule's `actions`
/// templates refer to (after glob expansion, §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub users: Option<Vec<u32>>,
    #[serde(default)]
    pub find_uid: bool,
    #[serde(default)]
    pub items: Vec<ActionItem>,
}

/// The boolean combinator joining one expression item to the accumulated
/// result of the items before it. The first item in an expression always
/// carries `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    None,
    And,
    Or,
}

/// One item of a rule's match expression: a matcher reference plus the
/// combinator joining it to the running result, and whether its raw
/// outcome is inverted before combining (§3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpressionItem {
    pub operator: Operator,
    #[serde(default)]
    pub inverted: bool,
    pub matcher: String,
    #[serde(default)]
    pub config: String,
}

/// A node in the rule tree. `idx` is assigned at load time and is never
/// read by the evaluator — it exists for logs and tests only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Assigned at parse time by `config::load_*`; a bare `Rule::new`
    /// leaves it at the caller's choice. Never read by the evaluator.
    #[serde(default)]
    pub idx: u32,
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub users: Option<Vec<u32>>,
    #[serde(default)]
    pub find_uid: bool,
    #[serde(default)]
    pub expr: Vec<ExpressionItem>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    /// An inline, anonymous action: mutually exclusive with `actions` at the
    /// config level (§3 Rule "actions"). `config::init` compiles a non-empty
    /// `lambda` into a synthetic named [`Action`] and appends its generated
    /// name onto `actions`, so nothing downstream of load time ever reads
    /// this field — both forms reach the same delivery expansion.
    #[serde(default)]
    pub lambda: Option<Vec<ActionItem>>,
    /// Child rules, nested via `rules = [...]` in the on-disk shape
    /// (§3 "On-disk configuration shape").
    #[serde(default, rename = "rules")]
    pub nested: Vec<Rule>,
    #[serde(default)]
    pub stop: bool,
}

impl Rule {
    #[must_use]
    pub fn new(idx: u32) -> Self {
        Self {
            idx,
            accounts: Vec::new(),
            users: None,
            find_uid: false,
            expr: Vec::new(),
            key: None,
            value: None,
            actions: Vec::new(),
            lambda: None,
            nested: Vec::new(),
            stop: false,
        }
    }

    /// A rule with no expression matches unconditionally ("rule-all",
    /// §4.1 start-of-rule).
    #[must_use]
    pub fn is_rule_all(&self) -> bool {
        self.expr.is_empty()
    }
}

/// Process-wide policy applied when a message reaches the end of the
/// ruleset without matching a `stop` rule (§4.1 "end of ruleset").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImplicitAction {
    /// Keep, with a warning logged — nothing in the ruleset took a stance.
    #[default]
    None,
    Keep,
    Drop,
}

/// The fully loaded, immutable ruleset a ruleset of [`MatchContext`]s is
/// evaluated against: the rule tree plus the named account and action
/// tables rules refer to by name.
///
/// [`MatchContext`]: crate::context::MatchContext
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ruleset {
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub actions: std::collections::HashMap<String, Action>,
    #[serde(default)]
    pub accounts: std::collections::HashMap<String, Account>,
    pub default_user: u32,
    #[serde(default)]
    pub implicit_action: ImplicitAction,
}

impl Ruleset {
    pub fn rule_at(&self, path: &[usize]) -> Option<&Rule> {
        let (&first, rest) = path.split_first()?;
        let mut rule = self.rules.get(first)?;
        for &idx in rest {
            rule = rule.nested.get(idx)?;
        }
        Some(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_with_no_expr_is_rule_all() {
        assert!(Rule::new(0).is_rule_all());
    }

    #[test]
    fn rule_with_expr_is_not_rule_all() {
        let mut rule = Rule::new(1);
        rule.expr.push(ExpressionItem {
            operator: Operator::None,
            inverted: false,
            matcher: "tag".into(),
            config: "x=y".into(),
        });
        assert!(!rule.is_rule_all());
    }

    #[test]
    fn rule_at_navigates_nested_paths() {
        let mut child = Rule::new(1);
        child.stop = true;
        let mut root = Rule::new(0);
        root.nested.push(child);

        let ruleset = Ruleset {
            rules: vec![root],
            actions: std::collections::HashMap::new(),
            accounts: std::collections::HashMap::new(),
            default_user: 1000,
            implicit_action: ImplicitAction::None,
        };

        assert_eq!(ruleset.rule_at(&[0]).unwrap().idx, 0);
        assert_eq!(ruleset.rule_at(&[0, 0]).unwrap().idx, 1);
        assert!(ruleset.rule_at(&[0, 0]).unwrap().stop);
        assert!(ruleset.rule_at(&[1]).is_none());
    }
}
