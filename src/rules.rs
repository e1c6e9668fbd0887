//! The if-condition-then-action rules engine.
//!
//! Rule definitions live in the `rules` table as JSON and are compiled once
//! per load into evaluators (regexes pre-built, operands pre-parsed where
//! numeric). Rules run in user order against each newly ingested item;
//! later rules see the item as mutated by earlier rules, and an item hidden
//! by an earlier rule stays visible to later rules so that, for example, a
//! mark-favorite rule can still trigger.

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{Database, NewArticle, RuleRow};

// ============================================================================
// Rule Definition (stored form)
// ============================================================================

/// How a rule's conditions combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combine {
    AllOf,
    AnyOf,
}

/// Article field a condition reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    Content,
    FeedId,
    Category,
    /// Seconds between publication and ingest
    Age,
    IsRead,
    IsFavorite,
    IsHidden,
    IsReadLater,
}

/// Condition operator, applied per the field's semantic type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    Contains,
    RegexMatches,
    StartsWith,
    EndsWith,
    LessThan,
    GreaterThan,
    IsSet,
    IsUnset,
}

/// One `(field, operator, operand)` triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionDef {
    pub field: Field,
    pub op: Operator,
    #[serde(default)]
    pub operand: String,
}

/// Action applied when a rule matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    MarkRead,
    MarkFavorite,
    Hide,
    MoveToCategory(String),
    MarkReadLater,
}

/// The JSON shape stored in `rules.definition_json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDef {
    pub combine: Combine,
    pub conditions: Vec<ConditionDef>,
    pub actions: Vec<Action>,
}

// ============================================================================
// Compilation
// ============================================================================

/// Why a stored rule could not be compiled.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Rule definition is not valid JSON: {0}")]
    Definition(#[from] serde_json::Error),
    #[error("Invalid regex {pattern:?}: {message}")]
    InvalidRegex { pattern: String, message: String },
}

#[derive(Debug)]
enum CompiledMatcher {
    Text(Operator, String),
    Regex(Regex),
    Number(Operator, i64),
    Presence { set: bool },
}

#[derive(Debug)]
struct CompiledCondition {
    field: Field,
    matcher: CompiledMatcher,
}

/// A rule ready to evaluate.
#[derive(Debug)]
pub struct CompiledRule {
    pub id: i64,
    combine: Combine,
    conditions: Vec<CompiledCondition>,
    actions: Vec<Action>,
}

impl CompiledRule {
    /// Compile a stored rule row. Regex patterns are taken as written —
    /// anchored only if the user anchored them.
    pub fn compile(row: &RuleRow) -> Result<Self, RuleError> {
        let def: RuleDef = serde_json::from_str(&row.definition_json)?;

        let mut conditions = Vec::with_capacity(def.conditions.len());
        for cond in &def.conditions {
            let matcher = match cond.op {
                Operator::RegexMatches => {
                    let regex = Regex::new(&cond.operand).map_err(|e| RuleError::InvalidRegex {
                        pattern: cond.operand.clone(),
                        message: e.to_string(),
                    })?;
                    CompiledMatcher::Regex(regex)
                }
                Operator::LessThan | Operator::GreaterThan => {
                    let n = cond.operand.trim().parse::<i64>().unwrap_or(0);
                    CompiledMatcher::Number(cond.op, n)
                }
                Operator::IsSet => CompiledMatcher::Presence { set: true },
                Operator::IsUnset => CompiledMatcher::Presence { set: false },
                op => CompiledMatcher::Text(op, cond.operand.clone()),
            };
            conditions.push(CompiledCondition {
                field: cond.field,
                matcher,
            });
        }

        Ok(CompiledRule {
            id: row.id,
            combine: def.combine,
            conditions,
            actions: def.actions,
        })
    }

    /// Evaluate conditions against the item's current state. `all_of`
    /// short-circuits on the first miss, `any_of` on the first hit.
    fn matches(&self, target: &RuleTarget<'_>) -> bool {
        match self.combine {
            Combine::AllOf => self.conditions.iter().all(|c| c.eval(target)),
            Combine::AnyOf => self.conditions.iter().any(|c| c.eval(target)),
        }
    }
}

impl CompiledCondition {
    fn eval(&self, target: &RuleTarget<'_>) -> bool {
        match &self.matcher {
            CompiledMatcher::Text(op, operand) => {
                let value = target.text_value(self.field);
                match op {
                    Operator::Equals => match target.number_value(self.field) {
                        Some(n) => operand.trim().parse::<i64>().map_or(false, |o| o == n),
                        None => value == operand.as_str(),
                    },
                    Operator::Contains => value.to_lowercase().contains(&operand.to_lowercase()),
                    Operator::StartsWith => value.starts_with(operand.as_str()),
                    Operator::EndsWith => value.ends_with(operand.as_str()),
                    _ => false,
                }
            }
            CompiledMatcher::Regex(regex) => regex.is_match(target.text_value(self.field)),
            CompiledMatcher::Number(op, operand) => {
                let Some(value) = target.number_value(self.field) else {
                    return false;
                };
                match op {
                    Operator::LessThan => value < *operand,
                    Operator::GreaterThan => value > *operand,
                    _ => false,
                }
            }
            CompiledMatcher::Presence { set } => target.is_set(self.field) == *set,
        }
    }
}

// ============================================================================
// Evaluation Target
// ============================================================================

/// Read-only view of the item state a condition sees. Rebuilt between
/// rules so later rules observe earlier mutations.
struct RuleTarget<'a> {
    article: &'a NewArticle,
    feed_id: i64,
    feed_category: &'a str,
    now: i64,
}

impl RuleTarget<'_> {
    fn text_value(&self, field: Field) -> &str {
        match field {
            Field::Title => &self.article.title,
            Field::Content => self
                .article
                .content
                .as_deref()
                .or(self.article.summary.as_deref())
                .unwrap_or(""),
            Field::Category => self
                .article
                .category
                .as_deref()
                .unwrap_or(self.feed_category),
            _ => "",
        }
    }

    fn number_value(&self, field: Field) -> Option<i64> {
        match field {
            Field::FeedId => Some(self.feed_id),
            Field::Age => {
                let published = self.article.published_at.unwrap_or(self.now);
                Some((self.now - published).max(0))
            }
            _ => None,
        }
    }

    fn is_set(&self, field: Field) -> bool {
        match field {
            Field::IsRead => self.article.is_read,
            Field::IsFavorite => self.article.is_favorite,
            Field::IsHidden => self.article.is_hidden,
            Field::IsReadLater => self.article.is_read_later,
            Field::Title => !self.article.title.is_empty(),
            Field::Content => self.article.content.as_deref().is_some_and(|c| !c.is_empty()),
            Field::Category => {
                !self
                    .article
                    .category
                    .as_deref()
                    .unwrap_or(self.feed_category)
                    .is_empty()
            }
            Field::FeedId | Field::Age => true,
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// The loaded rule set, applied to every new item at ingest.
pub struct RulesEngine {
    rules: Vec<CompiledRule>,
}

impl RulesEngine {
    /// An engine with no rules; items pass through untouched.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Load and compile all enabled rules in evaluation order.
    ///
    /// A rule that fails to compile (bad regex, bad JSON) is disabled in
    /// the store and reported; the rest of the set still loads.
    pub async fn load(db: &Database) -> Result<Self> {
        let mut rules = Vec::new();
        for row in db.list_rules().await? {
            if !row.enabled {
                continue;
            }
            match CompiledRule::compile(&row) {
                Ok(rule) => rules.push(rule),
                Err(e) => {
                    tracing::warn!(rule_id = row.id, error = %e, "Disabling uncompilable rule");
                    db.set_rule_enabled(row.id, false).await?;
                }
            }
        }
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Run every rule, in order, against a new item.
    ///
    /// `feed_category` is the owning feed's path; a `move_to_category`
    /// action overrides it for this article only.
    pub fn apply(&self, article: &mut NewArticle, feed_id: i64, feed_category: &str, now: i64) {
        for rule in &self.rules {
            let matched = {
                let target = RuleTarget {
                    article,
                    feed_id,
                    feed_category,
                    now,
                };
                rule.matches(&target)
            };
            if !matched {
                continue;
            }

            for action in &rule.actions {
                match action {
                    Action::MarkRead => article.is_read = true,
                    Action::MarkFavorite => article.is_favorite = true,
                    Action::Hide => article.is_hidden = true,
                    Action::MoveToCategory(path) => article.category = Some(path.clone()),
                    Action::MarkReadLater => article.is_read_later = true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(json: &str) -> CompiledRule {
        CompiledRule::compile(&RuleRow {
            id: 1,
            order_rank: 0,
            enabled: true,
            definition_json: json.to_string(),
        })
        .unwrap()
    }

    fn engine(defs: &[&str]) -> RulesEngine {
        RulesEngine {
            rules: defs
                .iter()
                .enumerate()
                .map(|(i, json)| {
                    CompiledRule::compile(&RuleRow {
                        id: i as i64 + 1,
                        order_rank: i as i64,
                        enabled: true,
                        definition_json: json.to_string(),
                    })
                    .unwrap()
                })
                .collect(),
        }
    }

    fn item(title: &str) -> NewArticle {
        NewArticle {
            fingerprint: title.to_string(),
            title: title.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_regex_hide_and_contains_favorite() {
        // Scenario: an ad-hiding rule followed by a release-favoriting rule.
        let engine = engine(&[
            r#"{"combine":"all_of",
                "conditions":[{"field":"title","op":"regex_matches","operand":"^Ad: "}],
                "actions":["hide"]}"#,
            r#"{"combine":"all_of",
                "conditions":[{"field":"title","op":"contains","operand":"release"}],
                "actions":["mark_favorite"]}"#,
        ]);

        let mut ad = item("Ad: Buy X");
        let mut release = item("v2 release");
        let mut plain = item("Newsletter");

        engine.apply(&mut ad, 1, "", 0);
        engine.apply(&mut release, 1, "", 0);
        engine.apply(&mut plain, 1, "", 0);

        assert!(ad.is_hidden && !ad.is_favorite);
        assert!(release.is_favorite && !release.is_hidden);
        assert!(!plain.is_hidden && !plain.is_favorite && !plain.is_read);
    }

    #[test]
    fn test_hidden_item_still_visible_to_later_rules() {
        let engine = engine(&[
            r#"{"combine":"all_of",
                "conditions":[{"field":"title","op":"starts_with","operand":"Ad:"}],
                "actions":["hide"]}"#,
            r#"{"combine":"all_of",
                "conditions":[{"field":"title","op":"contains","operand":"keep"}],
                "actions":["mark_favorite"]}"#,
        ]);

        let mut both = item("Ad: but keep this one");
        engine.apply(&mut both, 1, "", 0);
        assert!(both.is_hidden);
        assert!(both.is_favorite);
    }

    #[test]
    fn test_later_rule_sees_earlier_mutation() {
        // Rule 1 moves to a category; rule 2 matches on that category.
        let engine = engine(&[
            r#"{"combine":"all_of",
                "conditions":[{"field":"title","op":"contains","operand":"rust"}],
                "actions":[{"move_to_category":"Tech"}]}"#,
            r#"{"combine":"all_of",
                "conditions":[{"field":"category","op":"equals","operand":"Tech"}],
                "actions":["mark_read_later"]}"#,
        ]);

        let mut article = item("Rust 2.0 announced");
        engine.apply(&mut article, 1, "News", 0);
        assert_eq!(article.category.as_deref(), Some("Tech"));
        assert!(article.is_read_later);
    }

    #[test]
    fn test_any_of_combination() {
        let r = rule(
            r#"{"combine":"any_of",
                "conditions":[
                    {"field":"title","op":"contains","operand":"alpha"},
                    {"field":"title","op":"contains","operand":"beta"}],
                "actions":["mark_read"]}"#,
        );

        let mut engine = RulesEngine::empty();
        engine.rules.push(r);

        let mut hit = item("beta notes");
        let mut miss = item("gamma notes");
        engine.apply(&mut hit, 1, "", 0);
        engine.apply(&mut miss, 1, "", 0);
        assert!(hit.is_read);
        assert!(!miss.is_read);
    }

    #[test]
    fn test_feed_id_and_age_comparisons() {
        let r = rule(
            r#"{"combine":"all_of",
                "conditions":[
                    {"field":"feed_id","op":"equals","operand":"7"},
                    {"field":"age","op":"greater_than","operand":"3600"}],
                "actions":["mark_read"]}"#,
        );
        let mut engine = RulesEngine::empty();
        engine.rules.push(r);

        let now = 1_700_000_000;
        let mut old = NewArticle {
            published_at: Some(now - 7200),
            ..item("old")
        };
        let mut fresh = NewArticle {
            published_at: Some(now - 60),
            ..item("fresh")
        };

        engine.apply(&mut old, 7, "", now);
        engine.apply(&mut fresh, 7, "", now);
        assert!(old.is_read);
        assert!(!fresh.is_read);

        let mut other_feed = NewArticle {
            published_at: Some(now - 7200),
            ..item("other")
        };
        engine.apply(&mut other_feed, 8, "", now);
        assert!(!other_feed.is_read);
    }

    #[test]
    fn test_is_set_on_flags() {
        let r = rule(
            r#"{"combine":"all_of",
                "conditions":[{"field":"is_favorite","op":"is_set"}],
                "actions":["mark_read_later"]}"#,
        );
        let mut engine = RulesEngine::empty();
        engine.rules.push(r);

        let mut favorited = NewArticle {
            is_favorite: true,
            ..item("fav")
        };
        engine.apply(&mut favorited, 1, "", 0);
        assert!(favorited.is_read_later);
    }

    #[test]
    fn test_invalid_regex_fails_compilation() {
        let err = CompiledRule::compile(&RuleRow {
            id: 9,
            order_rank: 0,
            enabled: true,
            definition_json: r#"{"combine":"all_of",
                "conditions":[{"field":"title","op":"regex_matches","operand":"[unclosed"}],
                "actions":["hide"]}"#
                .to_string(),
        })
        .unwrap_err();
        assert!(matches!(err, RuleError::InvalidRegex { .. }));
    }

    #[tokio::test]
    async fn test_load_disables_broken_rules() {
        let db = Database::open(":memory:").await.unwrap();
        db.insert_rule(
            0,
            r#"{"combine":"all_of",
                "conditions":[{"field":"title","op":"regex_matches","operand":"[bad"}],
                "actions":["hide"]}"#,
        )
        .await
        .unwrap();
        let good = db
            .insert_rule(
                1,
                r#"{"combine":"all_of",
                    "conditions":[{"field":"title","op":"contains","operand":"x"}],
                    "actions":["hide"]}"#,
            )
            .await
            .unwrap();

        let engine = RulesEngine::load(&db).await.unwrap();
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.rules[0].id, good);

        // The broken rule was disabled in the store.
        let rows = db.list_rules().await.unwrap();
        assert!(!rows[0].enabled);
        assert!(rows[1].enabled);
    }
}
