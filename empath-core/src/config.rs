//! Loads the in-memory [`Ruleset`] (§3) from the on-disk TOML shape
//! described in §3 "On-disk configuration shape", plus the post-deserialize
//! validation/compile pass (§11) that mirrors the host program's
//! config-struct conventions: deserialize into a file-shaped DTO first,
//! then fold the array-of-tables `[[account]]`/`[[action]]` lists into the
//! name-keyed maps the evaluator actually walks.

use std::{collections::HashMap, path::Path};

use serde::Deserialize;

use crate::{
    error::CoreError,
    rule::{Account, Action, ImplicitAction, Rule, Ruleset},
    Result,
};

/// The on-disk shape: array-of-tables for accounts/actions/rules, folded
/// into [`Ruleset`]'s name-keyed maps by [`load_str`].
#[derive(Debug, Deserialize)]
struct RulesetFile {
    default_user: u32,
    #[serde(default)]
    implicit_action: ImplicitAction,
    #[serde(default, rename = "account")]
    accounts: Vec<Account>,
    #[serde(default, rename = "action")]
    actions: Vec<Action>,
    #[serde(default, rename = "rule")]
    rules: Vec<Rule>,
}

/// Parse and validate a ruleset from a TOML document.
///
/// # Errors
///
/// Returns [`CoreError::InvalidConfig`] if the document doesn't deserialize
/// into the expected shape, or fails the post-load validation pass.
pub fn load_str(toml_src: &str) -> Result<Ruleset> {
    let file: RulesetFile =
        toml::from_str(toml_src).map_err(|e| CoreError::InvalidConfig(e.to_string()))?;

    let mut accounts = HashMap::with_capacity(file.accounts.len());
    for account in file.accounts {
        accounts.insert(account.name.clone(), account);
    }

    let mut actions = HashMap::with_capacity(file.actions.len());
    for action in file.actions {
        actions.insert(action.name.clone(), action);
    }

    let mut ruleset = Ruleset {
        rules: file.rules,
        actions,
        accounts,
        default_user: file.default_user,
        implicit_action: file.implicit_action,
    };

    init(&mut ruleset)?;
    Ok(ruleset)
}

/// Read and parse a ruleset from a TOML file on disk.
///
/// # Errors
///
/// Returns [`CoreError::InvalidConfig`] if the file cannot be read, or if
/// [`load_str`] rejects its contents.
pub fn load_file(path: impl AsRef<Path>) -> Result<Ruleset> {
    let contents = std::fs::read_to_string(path.as_ref())
        .map_err(|e| CoreError::InvalidConfig(format!("{}: {e}", path.as_ref().display())))?;
    load_str(&contents)
}

/// Post-deserialize validation/compile pass (§11): assigns stable `idx`
/// values in traversal order, then rejects a ruleset that is structurally
/// sound TOML but a meaningless ruleset (ambiguous user-resolution knobs,
/// an action-name pattern that can't even compile as a glob).
fn init(ruleset: &mut Ruleset) -> Result<()> {
    let mut next_idx = 0;
    for rule in &mut ruleset.rules {
        assign_indices(rule, &mut next_idx);
    }

    for rule in &mut ruleset.rules {
        compile_lambdas(rule, &mut ruleset.actions)?;
    }

    for rule in &ruleset.rules {
        validate_rule(rule)?;
    }

    Ok(())
}

fn assign_indices(rule: &mut Rule, next_idx: &mut u32) {
    rule.idx = *next_idx;
    *next_idx += 1;
    for child in &mut rule.nested {
        assign_indices(child, next_idx);
    }
}

/// Compiles a rule's inline `lambda` (§3 Rule "actions") into a synthetic
/// named [`Action`] registered under a generated, collision-proof name, then
/// appends that name onto `rule.actions` and clears `lambda`. After this
/// pass, every rule's deliveries are reachable purely through `actions`,
/// named or synthetic alike, so nothing downstream needs to know the
/// anonymous form ever existed.
fn compile_lambdas(rule: &mut Rule, actions: &mut HashMap<String, Action>) -> Result<()> {
    if let Some(items) = rule.lambda.take() {
        if !items.is_empty() {
            if !rule.actions.is_empty() {
                return Err(CoreError::InvalidConfig(format!(
                    "rule {}: actions and lambda are mutually exclusive",
                    rule.idx
                )));
            }
            let name = format!("__lambda_{}", rule.idx);
            actions.insert(
                name.clone(),
                Action {
                    name: name.clone(),
                    users: None,
                    find_uid: false,
                    items,
                },
            );
            rule.actions.push(name);
        }
    }

    for child in &mut rule.nested {
        compile_lambdas(child, actions)?;
    }

    Ok(())
}

fn validate_rule(rule: &Rule) -> Result<()> {
    if rule.find_uid && rule.users.as_ref().is_some_and(|users| !users.is_empty()) {
        return Err(CoreError::InvalidConfig(format!(
            "rule {}: find_uid and a non-empty users list are mutually exclusive",
            rule.idx
        )));
    }

    for template in &rule.actions {
        // Templated names (containing `${...}`) can't be glob-compiled until
        // substitution happens at match time; only literal names are
        // checked here.
        if !template.contains("${") {
            if let Err(e) = globset::Glob::new(template) {
                return Err(CoreError::InvalidConfig(format!(
                    "rule {}: invalid action name pattern {template:?}: {e}",
                    rule.idx
                )));
            }
        }
    }

    for child in &rule.nested {
        validate_rule(child)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        default_user = 1000
        implicit_action = "keep"

        [[account]]
        name = "a1"

        [[action]]
        name = "keep"

        [[action.items]]
        deliverer = "tag"
        config = "action=keep"

        [[rule]]
        actions = ["keep"]

        [[rule]]
        stop = true

        [[rule.rules]]
        actions = ["keep"]
    "#;

    #[test]
    fn load_file_reads_and_parses_a_ruleset_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let ruleset = load_file(file.path()).unwrap();
        assert_eq!(ruleset.default_user, 1000);
        assert!(ruleset.actions.contains_key("keep"));
    }

    #[test]
    fn load_file_reports_a_missing_path_as_invalid_config_not_a_panic() {
        let err = load_file("/nonexistent/empath.toml").unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn loads_a_representative_ruleset() {
        let ruleset = load_str(SAMPLE).unwrap();
        assert_eq!(ruleset.default_user, 1000);
        assert_eq!(ruleset.implicit_action, ImplicitAction::Keep);
        assert_eq!(ruleset.rules.len(), 2);
        assert!(ruleset.accounts.contains_key("a1"));
        assert!(ruleset.actions.contains_key("keep"));
    }

    #[test]
    fn assigns_stable_indices_in_traversal_order() {
        let ruleset = load_str(SAMPLE).unwrap();
        assert_eq!(ruleset.rules[0].idx, 0);
        assert_eq!(ruleset.rules[1].idx, 1);
        assert_eq!(ruleset.rules[1].nested[0].idx, 2);
    }

    #[test]
    fn nested_rules_key_is_rules_not_nested() {
        let ruleset = load_str(SAMPLE).unwrap();
        assert_eq!(ruleset.rules[1].nested.len(), 1);
    }

    #[test]
    fn structurally_invalid_document_is_a_descriptive_error_not_a_panic() {
        let bad = r#"
            default_user = 1000
            [[rule]]
            accounts = [42]
        "#;
        let err = load_str(bad).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn find_uid_with_nonempty_users_is_rejected() {
        let bad = r#"
            default_user = 1000
            [[rule]]
            find_uid = true
            users = [1000]
        "#;
        let err = load_str(bad).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn unmatchable_literal_action_glob_is_caught_at_load_time() {
        let bad = r#"
            default_user = 1000
            [[rule]]
            actions = ["["]
        "#;
        let err = load_str(bad).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn lambda_is_compiled_into_a_synthetic_named_action() {
        let src = r#"
            default_user = 1000
            [[rule]]
            [[rule.lambda]]
            deliverer = "tag"
            config = "action=keep"
        "#;
        let ruleset = load_str(src).unwrap();
        assert!(ruleset.rules[0].lambda.is_none());
        assert_eq!(ruleset.rules[0].actions.len(), 1);
        let name = &ruleset.rules[0].actions[0];
        let action = ruleset.actions.get(name).unwrap();
        assert_eq!(action.items.len(), 1);
        assert_eq!(action.items[0].deliverer, "tag");
    }

    #[test]
    fn lambda_and_actions_together_are_rejected() {
        let bad = r#"
            default_user = 1000
            [[action]]
            name = "keep"
            [[rule]]
            actions = ["keep"]
            [[rule.lambda]]
            deliverer = "tag"
            config = "action=keep"
        "#;
        let err = load_str(bad).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn empty_lambda_list_is_a_no_op() {
        let src = r#"
            default_user = 1000
            [[rule]]
            lambda = []
        "#;
        let ruleset = load_str(src).unwrap();
        assert!(ruleset.rules[0].actions.is_empty());
    }
}
