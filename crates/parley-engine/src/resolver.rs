//! Input resolvers: what the executor does when an agent asks a question.
//!
//! A resolver is chosen at configuration time ([`ResolverSpec`]) or passed
//! per run. It answers, defers the task to out-of-band completion, or
//! rejects the question outright.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use parley_core::{AgentId, InputRequest, OperationId};

/// Everything a resolver can see about one question.
#[derive(Clone, Debug)]
pub struct InputContext {
    /// Agent asking.
    pub agent_id: AgentId,
    /// Operation the question belongs to.
    pub operation_id: OperationId,
    /// Task name.
    pub task: String,
    /// Original task arguments.
    pub args: Value,
    /// The question itself.
    pub request: InputRequest,
    /// 1-based clarification round this question opens.
    pub round: u32,
}

/// What to do about a question.
#[derive(Clone, Debug, PartialEq)]
pub enum InputDecision {
    /// Send this value as the next turn.
    Answer(Value),
    /// Accept that the task will finish out of band.
    Defer,
    /// Refuse to answer.
    Reject(String),
}

/// Decides how to answer agent questions.
#[async_trait]
pub trait InputResolver: Send + Sync {
    /// Decide on one question.
    async fn resolve(&self, ctx: &InputContext) -> InputDecision;
}

/// Answers from a fixed table: by the question's `field`, then by the
/// longest key that appears (case-insensitively) in the question text.
pub struct FieldMapResolver {
    answers: BTreeMap<String, Value>,
    fallback: Option<Arc<dyn InputResolver>>,
}

impl FieldMapResolver {
    /// Resolver over a fixed answer table.
    pub fn new(answers: BTreeMap<String, Value>) -> Self {
        Self {
            answers,
            fallback: None,
        }
    }

    /// Resolver to ask when no key matches.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn InputResolver>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    fn lookup(&self, request: &InputRequest) -> Option<&Value> {
        if let Some(value) = request.field.as_deref().and_then(|f| self.answers.get(f)) {
            return Some(value);
        }
        let question = request.question.to_lowercase();
        self.answers
            .iter()
            .filter(|(key, _)| !key.is_empty() && question.contains(&key.to_lowercase()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, value)| value)
    }
}

#[async_trait]
impl InputResolver for FieldMapResolver {
    async fn resolve(&self, ctx: &InputContext) -> InputDecision {
        if let Some(value) = self.lookup(&ctx.request) {
            return InputDecision::Answer(value.clone());
        }
        match &self.fallback {
            Some(fallback) => fallback.resolve(ctx).await,
            None => InputDecision::Reject(format!("no answer for: {}", ctx.request.question)),
        }
    }
}

/// Predicate over an [`InputContext`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// The agent named this argument.
    FieldEquals {
        /// Argument name.
        field: String,
    },
    /// The question text contains this, case-insensitively.
    QuestionContains {
        /// Substring to look for.
        text: String,
    },
    /// This is at least the given round.
    RoundAtLeast {
        /// 1-based round.
        round: u32,
    },
    /// The question came from this agent.
    AgentIs {
        /// Agent to match.
        agent_id: AgentId,
    },
    /// The question belongs to this task.
    TaskIs {
        /// Task name to match.
        task: String,
    },
}

impl Condition {
    /// Whether the condition holds for this question.
    pub fn matches(&self, ctx: &InputContext) -> bool {
        match self {
            Self::FieldEquals { field } => ctx.request.field.as_deref() == Some(field.as_str()),
            Self::QuestionContains { text } => ctx
                .request
                .question
                .to_lowercase()
                .contains(&text.to_lowercase()),
            Self::RoundAtLeast { round } => ctx.round >= *round,
            Self::AgentIs { agent_id } => &ctx.agent_id == agent_id,
            Self::TaskIs { task } => &ctx.task == task,
        }
    }
}

/// First matching rule wins; `otherwise` handles the rest (defer by default).
pub struct ConditionalResolver {
    rules: Vec<(Condition, Arc<dyn InputResolver>)>,
    otherwise: Arc<dyn InputResolver>,
}

impl ConditionalResolver {
    /// Resolver that defers everything until rules are added.
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            otherwise: Arc::new(DeferResolver),
        }
    }

    /// Add a rule; earlier rules win.
    #[must_use]
    pub fn when(mut self, condition: Condition, then: Arc<dyn InputResolver>) -> Self {
        self.rules.push((condition, then));
        self
    }

    /// Resolver for questions no rule matches.
    #[must_use]
    pub fn otherwise(mut self, resolver: Arc<dyn InputResolver>) -> Self {
        self.otherwise = resolver;
        self
    }
}

impl Default for ConditionalResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InputResolver for ConditionalResolver {
    async fn resolve(&self, ctx: &InputContext) -> InputDecision {
        let target = self
            .rules
            .iter()
            .find(|(condition, _)| condition.matches(ctx))
            .map_or(&self.otherwise, |(_, resolver)| resolver);
        target.resolve(ctx).await
    }
}

/// Defers every question.
pub struct DeferResolver;

#[async_trait]
impl InputResolver for DeferResolver {
    async fn resolve(&self, _ctx: &InputContext) -> InputDecision {
        InputDecision::Defer
    }
}

/// Rejects every question with a fixed reason.
pub struct RejectResolver {
    reason: String,
}

impl RejectResolver {
    /// Resolver rejecting with `reason`.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl InputResolver for RejectResolver {
    async fn resolve(&self, _ctx: &InputContext) -> InputDecision {
        InputDecision::Reject(self.reason.clone())
    }
}

/// Always answers with the same value (e.g. `true` to auto-approve).
pub struct ConstantResolver {
    value: Value,
}

impl ConstantResolver {
    /// Resolver answering `value`.
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

#[async_trait]
impl InputResolver for ConstantResolver {
    async fn resolve(&self, _ctx: &InputContext) -> InputDecision {
        InputDecision::Answer(self.value.clone())
    }
}

/// Serializable resolver configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolverSpec {
    /// [`FieldMapResolver`].
    FieldMap {
        /// Answers keyed by field name or question substring.
        answers: BTreeMap<String, Value>,
        /// Used when no key matches.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback: Option<Box<ResolverSpec>>,
    },
    /// [`ConditionalResolver`].
    Conditional {
        /// Checked in order.
        rules: Vec<ResolverRule>,
        /// Used when no rule matches.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        otherwise: Option<Box<ResolverSpec>>,
    },
    /// [`DeferResolver`].
    #[default]
    Defer,
    /// [`RejectResolver`].
    Reject {
        /// Reason sent back with every rejection.
        reason: String,
    },
    /// [`ConstantResolver`].
    Constant {
        /// Answer to every question.
        value: Value,
    },
}

/// One conditional rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolverRule {
    /// When the rule applies.
    pub when: Condition,
    /// Resolver to use when it does.
    pub then: ResolverSpec,
}

impl ResolverSpec {
    /// Instantiate the configured resolver.
    pub fn build(&self) -> Arc<dyn InputResolver> {
        match self {
            Self::FieldMap { answers, fallback } => {
                let mut resolver = FieldMapResolver::new(answers.clone());
                if let Some(fallback) = fallback {
                    resolver = resolver.with_fallback(fallback.build());
                }
                Arc::new(resolver)
            }
            Self::Conditional { rules, otherwise } => {
                let mut resolver = rules.iter().fold(ConditionalResolver::new(), |acc, rule| {
                    acc.when(rule.when.clone(), rule.then.build())
                });
                if let Some(otherwise) = otherwise {
                    resolver = resolver.otherwise(otherwise.build());
                }
                Arc::new(resolver)
            }
            Self::Defer => Arc::new(DeferResolver),
            Self::Reject { reason } => Arc::new(RejectResolver::new(reason.clone())),
            Self::Constant { value } => Arc::new(ConstantResolver::new(value.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(question: &str, field: Option<&str>, round: u32) -> InputContext {
        let mut request = InputRequest::new(question);
        if let Some(field) = field {
            request = request.for_field(field);
        }
        InputContext {
            agent_id: AgentId::from_raw("sales"),
            operation_id: OperationId::from_raw("op_1"),
            task: "create_media_buy".into(),
            args: json!({}),
            request,
            round,
        }
    }

    fn answers() -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("budget".to_string(), json!(50_000)),
            ("total budget".to_string(), json!(75_000)),
            ("start_date".to_string(), json!("2026-01-01")),
        ])
    }

    #[tokio::test]
    async fn field_map_prefers_field_then_longest_match() {
        let r = FieldMapResolver::new(answers());
        assert_eq!(
            r.resolve(&ctx("When?", Some("start_date"), 1)).await,
            InputDecision::Answer(json!("2026-01-01"))
        );
        assert_eq!(
            r.resolve(&ctx("What is your Total Budget?", None, 1)).await,
            InputDecision::Answer(json!(75_000))
        );
        assert_eq!(
            r.resolve(&ctx("budget?", None, 1)).await,
            InputDecision::Answer(json!(50_000))
        );
    }

    #[tokio::test]
    async fn field_map_falls_back_or_rejects() {
        let bare = FieldMapResolver::new(answers());
        assert!(matches!(
            bare.resolve(&ctx("Which region?", None, 1)).await,
            InputDecision::Reject(_)
        ));

        let with_fallback = FieldMapResolver::new(answers()).with_fallback(Arc::new(DeferResolver));
        assert_eq!(
            with_fallback.resolve(&ctx("Which region?", None, 1)).await,
            InputDecision::Defer
        );
    }

    #[tokio::test]
    async fn conditional_first_match_wins() {
        let r = ConditionalResolver::new()
            .when(
                Condition::RoundAtLeast { round: 3 },
                Arc::new(RejectResolver::new("too many questions")),
            )
            .when(
                Condition::QuestionContains { text: "approve".into() },
                Arc::new(ConstantResolver::new(json!(true))),
            );

        assert_eq!(
            r.resolve(&ctx("Please APPROVE the plan", None, 1)).await,
            InputDecision::Answer(json!(true))
        );
        assert_eq!(
            r.resolve(&ctx("Please approve the plan", None, 3)).await,
            InputDecision::Reject("too many questions".into())
        );
        assert_eq!(r.resolve(&ctx("Anything else?", None, 1)).await, InputDecision::Defer);
    }

    #[test]
    fn conditions() {
        let c = ctx("q", Some("budget"), 2);
        assert!(Condition::FieldEquals { field: "budget".into() }.matches(&c));
        assert!(Condition::AgentIs { agent_id: AgentId::from_raw("sales") }.matches(&c));
        assert!(Condition::TaskIs { task: "create_media_buy".into() }.matches(&c));
        assert!(!Condition::TaskIs { task: "other".into() }.matches(&c));
        assert!(!Condition::RoundAtLeast { round: 3 }.matches(&c));
    }

    #[tokio::test]
    async fn spec_from_json_builds_resolver() {
        let spec: ResolverSpec = serde_json::from_value(json!({
            "kind": "conditional",
            "rules": [
                {
                    "when": {"kind": "task_is", "task": "create_media_buy"},
                    "then": {"kind": "field_map", "answers": {"budget": 50000}}
                }
            ],
            "otherwise": {"kind": "reject", "reason": "unsupported"}
        }))
        .unwrap();

        let r = spec.build();
        assert_eq!(
            r.resolve(&ctx("budget?", None, 1)).await,
            InputDecision::Answer(json!(50000))
        );

        let mut other = ctx("budget?", None, 1);
        other.task = "sync_creatives".into();
        assert_eq!(r.resolve(&other).await, InputDecision::Reject("unsupported".into()));
    }

    #[test]
    fn default_spec_defers() {
        assert_eq!(ResolverSpec::default(), ResolverSpec::Defer);
        let json = serde_json::to_value(ResolverSpec::Defer).unwrap();
        assert_eq!(json, json!({"kind": "defer"}));
    }
}
