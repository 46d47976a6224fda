//! Global termination rules.

use crate::context::ExecutionContext;
use crate::error::FlowError;
use crate::expression::Expression;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rules that end a session early, independent of the flow's end steps.
///
/// Evaluated after every completed dialogue step.
///
/// # Examples
///
/// ```
/// use parley_core::TerminationRules;
///
/// let rules: TerminationRules = serde_json::from_str(
///     r#"{ "max_rounds": 8, "keywords": ["AGREED", "deadlock"] }"#,
/// ).unwrap();
/// assert_eq!(rules.max_rounds, Some(8));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminationRules {
    #[serde(default)]
    pub max_rounds: Option<u32>,
    /// Matched case-insensitively against the latest message.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub condition: Option<Expression>,
}

/// Which rule ended the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    MaxRounds(u32),
    Keyword(String),
    Condition(String),
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::MaxRounds(n) => write!(f, "reached {n} rounds"),
            TerminationReason::Keyword(k) => write!(f, "keyword '{k}' in latest message"),
            TerminationReason::Condition(c) => write!(f, "termination condition '{c}' held"),
        }
    }
}

impl TerminationRules {
    pub fn is_empty(&self) -> bool {
        self.max_rounds.is_none() && self.keywords.is_empty() && self.condition.is_none()
    }

    pub fn max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = Some(rounds);
        self
    }

    pub fn keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keywords.push(keyword.into());
        self
    }

    pub fn condition(mut self, expression: Expression) -> Self {
        self.condition = Some(expression);
        self
    }

    /// Checks the rules in order: round cap, keywords, condition.
    ///
    /// # Errors
    ///
    /// Propagates [`FlowError::ConditionEvaluation`] from the condition.
    pub fn evaluate(&self, ctx: &ExecutionContext) -> Result<Option<TerminationReason>, FlowError> {
        if let Some(max) = self.max_rounds {
            if ctx.rounds() >= max {
                return Ok(Some(TerminationReason::MaxRounds(ctx.rounds())));
            }
        }

        if let Some(last) = ctx.last_message() {
            let content = last.content.to_lowercase();
            let hit = self
                .keywords
                .iter()
                .find(|k| !k.is_empty() && content.contains(&k.to_lowercase()));
            if let Some(keyword) = hit {
                return Ok(Some(TerminationReason::Keyword(keyword.clone())));
            }
        }

        if let Some(condition) = &self.condition {
            if condition.evaluate(ctx)? {
                return Ok(Some(TerminationReason::Condition(condition.source().to_string())));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Message, SessionId};
    use crate::step::StepId;
    use crate::traits::RoleId;

    fn ctx(messages: &[&str]) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(SessionId::new("s1"));
        for m in messages {
            ctx.complete_round(Message::new(StepId::new("talk"), RoleId::new("a"), "A", *m));
        }
        ctx
    }

    #[test]
    fn test_max_rounds() {
        let rules = TerminationRules::default().max_rounds(2);
        assert_eq!(rules.evaluate(&ctx(&["one"])).unwrap(), None);
        assert_eq!(
            rules.evaluate(&ctx(&["one", "two"])).unwrap(),
            Some(TerminationReason::MaxRounds(2))
        );
    }

    #[test]
    fn test_keyword_is_case_insensitive_and_checks_latest_only() {
        let rules = TerminationRules::default().keyword("Agreed");
        assert_eq!(
            rules.evaluate(&ctx(&["fine, we are AGREED"])).unwrap(),
            Some(TerminationReason::Keyword("Agreed".into()))
        );
        assert_eq!(rules.evaluate(&ctx(&["agreed", "no wait"])).unwrap(), None);
        assert_eq!(rules.evaluate(&ctx(&[])).unwrap(), None);
    }

    #[test]
    fn test_condition_rule_and_errors() {
        let rules = TerminationRules::default()
            .condition(Expression::parse("contains(last_message, 'bye')").unwrap());
        assert!(matches!(
            rules.evaluate(&ctx(&["ok bye"])).unwrap(),
            Some(TerminationReason::Condition(_))
        ));

        let broken = TerminationRules::default()
            .condition(Expression::parse("verdict == 'done'").unwrap());
        assert!(broken.evaluate(&ctx(&["x"])).is_err());
        assert!(!broken.is_empty());
        assert!(TerminationRules::default().is_empty());
    }
}
