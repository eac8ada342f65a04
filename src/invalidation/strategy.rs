//! Declarative invalidation strategies
//!
//! A strategy binds triggers to actions: when a live [`TriggerEvent`] matches
//! one of its [`Trigger`]s and every [`Condition`] holds, its [`Action`]s run
//! in order. Key and pattern templates may reference event fields as
//! `{path}`, `{action}`, `{event}`, `{endpoint}` or `{data.<name>}`.

use crate::cache::key::KeyNamespace;
use crate::cache::pattern::glob_match;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Kind of data change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
    /// Matches every change (only meaningful inside a [`Trigger`])
    Any,
}

impl ChangeType {
    fn accepts(self, actual: ChangeType) -> bool {
        self == ChangeType::Any || self == actual
    }
}

/// What a strategy listens for. String fields are glob patterns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire on a fixed schedule
    Time { interval_ms: u64 },
    DataChange { data_path: String, change_type: ChangeType },
    UserAction { action: String },
    ExternalEvent {
        event: String,
        #[serde(default)]
        source: Option<String>,
    },
    ApiResponse {
        endpoint: String,
        #[serde(default)]
        status: Option<u16>,
    },
}

impl Trigger {
    /// Whether a live event satisfies this trigger
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        match (self, event) {
            (Trigger::Time { interval_ms }, TriggerEvent::Time { interval_ms: fired }) => interval_ms == fired,
            (
                Trigger::DataChange {
                    data_path,
                    change_type,
                },
                TriggerEvent::DataChange {
                    path,
                    change_type: actual,
                    ..
                },
            ) => glob_match(data_path, path) && change_type.accepts(*actual),
            (Trigger::UserAction { action }, TriggerEvent::UserAction { action: actual, .. }) => {
                glob_match(action, actual)
            }
            (
                Trigger::ExternalEvent { event, source },
                TriggerEvent::ExternalEvent {
                    event: actual,
                    source: actual_source,
                    ..
                },
            ) => {
                glob_match(event, actual)
                    && source
                        .as_ref()
                        .map(|s| actual_source.as_deref() == Some(s.as_str()))
                        .unwrap_or(true)
            }
            (
                Trigger::ApiResponse { endpoint, status },
                TriggerEvent::ApiResponse {
                    endpoint: actual,
                    status: actual_status,
                    ..
                },
            ) => glob_match(endpoint, actual) && status.map(|s| *actual_status == Some(s)).unwrap_or(true),
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Time { .. } => "time",
            Trigger::DataChange { .. } => "data_change",
            Trigger::UserAction { .. } => "user_action",
            Trigger::ExternalEvent { .. } => "external_event",
            Trigger::ApiResponse { .. } => "api_response",
        }
    }
}

/// A signal observed by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerEvent {
    Time {
        interval_ms: u64,
    },
    DataChange {
        path: String,
        change_type: ChangeType,
        #[serde(default)]
        data: Map<String, Value>,
    },
    UserAction {
        action: String,
        #[serde(default)]
        data: Map<String, Value>,
    },
    ExternalEvent {
        event: String,
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        data: Map<String, Value>,
    },
    ApiResponse {
        endpoint: String,
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        data: Map<String, Value>,
    },
}

impl TriggerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TriggerEvent::Time { .. } => "time",
            TriggerEvent::DataChange { .. } => "data_change",
            TriggerEvent::UserAction { .. } => "user_action",
            TriggerEvent::ExternalEvent { .. } => "external_event",
            TriggerEvent::ApiResponse { .. } => "api_response",
        }
    }

    fn data(&self) -> Option<&Map<String, Value>> {
        match self {
            TriggerEvent::Time { .. } => None,
            TriggerEvent::DataChange { data, .. }
            | TriggerEvent::UserAction { data, .. }
            | TriggerEvent::ExternalEvent { data, .. }
            | TriggerEvent::ApiResponse { data, .. } => Some(data),
        }
    }

    /// Named field as a string: `path`, `change_type`, `action`, `event`,
    /// `source`, `endpoint`, `status` or `data.<name>`
    pub fn field(&self, name: &str) -> Option<String> {
        if let Some(key) = name.strip_prefix("data.") {
            return self.data()?.get(key).map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }

        match (name, self) {
            ("path", TriggerEvent::DataChange { path, .. }) => Some(path.clone()),
            ("change_type", TriggerEvent::DataChange { change_type, .. }) => {
                serde_json::to_value(change_type)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
            }
            ("action", TriggerEvent::UserAction { action, .. }) => Some(action.clone()),
            ("event", TriggerEvent::ExternalEvent { event, .. }) => Some(event.clone()),
            ("source", TriggerEvent::ExternalEvent { source, .. }) => source.clone(),
            ("endpoint", TriggerEvent::ApiResponse { endpoint, .. }) => Some(endpoint.clone()),
            ("status", TriggerEvent::ApiResponse { status, .. }) => status.map(|s| s.to_string()),
            _ => None,
        }
    }

    /// Numeric `data.<name>` field
    pub fn number(&self, name: &str) -> Option<f64> {
        self.data()?.get(name).and_then(Value::as_f64)
    }

    /// Replace `{field}` placeholders; unknown placeholders stay as written
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    let name = &after[..close];
                    match self.field(name) {
                        Some(value) => out.push_str(&value),
                        None => {
                            out.push('{');
                            out.push_str(name);
                            out.push('}');
                        }
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl Comparison {
    pub fn compare(self, actual: f64, expected: f64) -> bool {
        match self {
            Comparison::Gt => actual > expected,
            Comparison::Gte => actual >= expected,
            Comparison::Lt => actual < expected,
            Comparison::Lte => actual <= expected,
            Comparison::Eq => (actual - expected).abs() < f64::EPSILON,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Comparison::Gt => ">",
            Comparison::Gte => ">=",
            Comparison::Lt => "<",
            Comparison::Lte => "<=",
            Comparison::Eq => "==",
        };
        f.write_str(op)
    }
}

/// Predicate over the trigger context; all of a strategy's conditions must hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Glob-match an event field
    Pattern { field: String, pattern: String },
    /// Compare a context metric (or numeric `data` field) to a value
    Threshold {
        metric: String,
        operator: Comparison,
        value: f64,
    },
    /// Passes when `key` has registered dependents
    Dependency { key: String },
}

/// Everything conditions are evaluated against
#[derive(Debug, Clone, Default)]
pub struct TriggerContext {
    pub metrics: HashMap<String, f64>,
    /// Keys that currently have dependents
    pub dependency_keys: HashSet<String>,
}

impl Condition {
    pub fn evaluate(&self, event: &TriggerEvent, ctx: &TriggerContext) -> bool {
        match self {
            Condition::Pattern { field, pattern } => event
                .field(field)
                .map(|value| glob_match(pattern, &value))
                .unwrap_or(false),
            Condition::Threshold {
                metric,
                operator,
                value,
            } => ctx
                .metrics
                .get(metric)
                .copied()
                .or_else(|| event.number(metric))
                .map(|actual| operator.compare(actual, *value))
                .unwrap_or(false),
            Condition::Dependency { key } => ctx.dependency_keys.contains(key),
        }
    }
}

/// Effect of a strategy firing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    InvalidateKeys {
        keys: Vec<String>,
        #[serde(default)]
        cascade: bool,
    },
    InvalidatePattern { pattern: String },
    /// Drop the keys locally and ask the backend to warm them again
    RefreshData { keys: Vec<String> },
    NotifyComponents { components: Vec<String> },
    /// Remove `<section>:*` keys and entries tagged `<section>`
    ClearSection { section: String },
}

/// Trigger/condition/action bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationStrategy {
    pub id: String,
    pub name: String,
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    /// Higher runs first
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub debounce_ms: Option<u64>,
    /// Strategy ids run after this one, with the same trigger
    #[serde(default)]
    pub cascade_rules: Vec<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl InvalidationStrategy {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            triggers: Vec::new(),
            conditions: Vec::new(),
            actions: Vec::new(),
            priority: 0,
            debounce_ms: None,
            cascade_rules: Vec::new(),
            enabled: true,
        }
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn debounce_ms(mut self, ms: u64) -> Self {
        self.debounce_ms = Some(ms);
        self
    }

    pub fn cascade_to(mut self, id: impl Into<String>) -> Self {
        self.cascade_rules.push(id.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(CacheError::InvalidOptions("strategy id must not be empty".to_string()));
        }
        if self.triggers.is_empty() {
            return Err(CacheError::InvalidOptions(format!(
                "strategy {} has no triggers",
                self.id
            )));
        }
        if self.actions.is_empty() {
            return Err(CacheError::InvalidOptions(format!(
                "strategy {} has no actions",
                self.id
            )));
        }
        Ok(())
    }

    /// Matches `event` via any trigger
    pub fn is_triggered_by(&self, event: &TriggerEvent) -> bool {
        self.enabled && self.triggers.iter().any(|t| t.matches(event))
    }

    /// All conditions hold
    pub fn conditions_pass(&self, event: &TriggerEvent, ctx: &TriggerContext) -> bool {
        self.conditions.iter().all(|c| c.evaluate(event, ctx))
    }

    /// Effective debounce window, `None` for immediate execution
    pub fn debounce(&self) -> Option<u64> {
        self.debounce_ms.filter(|ms| *ms > 0)
    }

    /// Scheduled intervals from time triggers
    pub fn time_intervals(&self) -> Vec<u64> {
        self.triggers
            .iter()
            .filter_map(|t| match t {
                Trigger::Time { interval_ms } if *interval_ms > 0 => Some(*interval_ms),
                _ => None,
            })
            .collect()
    }

    /// Apply a partial update
    pub fn apply(&mut self, update: StrategyUpdate) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(triggers) = update.triggers {
            self.triggers = triggers;
        }
        if let Some(conditions) = update.conditions {
            self.conditions = conditions;
        }
        if let Some(actions) = update.actions {
            self.actions = actions;
        }
        if let Some(priority) = update.priority {
            self.priority = priority;
        }
        if let Some(debounce_ms) = update.debounce_ms {
            self.debounce_ms = debounce_ms;
        }
        if let Some(cascade_rules) = update.cascade_rules {
            self.cascade_rules = cascade_rules;
        }
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
    }
}

/// Partial update for [`InvalidationStrategy`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyUpdate {
    pub name: Option<String>,
    pub triggers: Option<Vec<Trigger>>,
    pub conditions: Option<Vec<Condition>>,
    pub actions: Option<Vec<Action>>,
    pub priority: Option<i32>,
    /// `Some(None)` removes the debounce
    pub debounce_ms: Option<Option<u64>>,
    pub cascade_rules: Option<Vec<String>>,
    pub enabled: Option<bool>,
}

pub const SEARCH_RESULTS_STRATEGY: &str = "search-results";
pub const USER_LOGOUT_STRATEGY: &str = "user-logout";
pub const PERIODIC_CLEANUP_STRATEGY: &str = "periodic-cleanup";

/// Strategies registered on every engine
pub fn builtin_strategies() -> Vec<InvalidationStrategy> {
    vec![
        InvalidationStrategy::new(SEARCH_RESULTS_STRATEGY, "Search result invalidation")
            .trigger(Trigger::DataChange {
                data_path: "search*".to_string(),
                change_type: ChangeType::Any,
            })
            .trigger(Trigger::DataChange {
                data_path: "entries*".to_string(),
                change_type: ChangeType::Any,
            })
            .action(Action::InvalidatePattern {
                pattern: KeyNamespace::Search.pattern(),
            })
            .action(Action::InvalidatePattern {
                pattern: KeyNamespace::Autocomplete.pattern(),
            })
            .action(Action::NotifyComponents {
                components: vec!["search-results".to_string()],
            })
            .priority(5)
            .debounce_ms(500),
        InvalidationStrategy::new(USER_LOGOUT_STRATEGY, "Clear user data on logout")
            .trigger(Trigger::UserAction {
                action: "logout".to_string(),
            })
            .action(Action::ClearSection {
                section: KeyNamespace::User.to_string(),
            })
            .action(Action::NotifyComponents {
                components: vec!["session".to_string()],
            })
            .priority(100),
        InvalidationStrategy::new(PERIODIC_CLEANUP_STRATEGY, "Shed low-value entries under memory pressure")
            .trigger(Trigger::Time {
                interval_ms: 300_000,
            })
            .condition(Condition::Threshold {
                metric: "memory_utilization".to_string(),
                operator: Comparison::Gt,
                value: 0.8,
            })
            .action(Action::InvalidatePattern {
                pattern: KeyNamespace::Autocomplete.pattern(),
            })
            .action(Action::ClearSection {
                section: KeyNamespace::Metrics.to_string(),
            })
            .priority(-10),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data_change(path: &str, change_type: ChangeType) -> TriggerEvent {
        TriggerEvent::DataChange {
            path: path.to_string(),
            change_type,
            data: Map::new(),
        }
    }

    #[test]
    fn test_data_change_matching() {
        let trigger = Trigger::DataChange {
            data_path: "entries/*".to_string(),
            change_type: ChangeType::Any,
        };
        assert!(trigger.matches(&data_change("entries/42", ChangeType::Update)));
        assert!(!trigger.matches(&data_change("users/42", ChangeType::Update)));

        let deletes_only = Trigger::DataChange {
            data_path: "*".to_string(),
            change_type: ChangeType::Delete,
        };
        assert!(deletes_only.matches(&data_change("x", ChangeType::Delete)));
        assert!(!deletes_only.matches(&data_change("x", ChangeType::Create)));
    }

    #[test]
    fn test_trigger_kinds_do_not_cross() {
        let trigger = Trigger::UserAction {
            action: "*".to_string(),
        };
        assert!(!trigger.matches(&data_change("logout", ChangeType::Any)));
    }

    #[test]
    fn test_api_response_status_filter() {
        let trigger = Trigger::ApiResponse {
            endpoint: "/api/entries*".to_string(),
            status: Some(201),
        };
        let event = |status| TriggerEvent::ApiResponse {
            endpoint: "/api/entries/7".to_string(),
            status: Some(status),
            data: Map::new(),
        };
        assert!(trigger.matches(&event(201)));
        assert!(!trigger.matches(&event(200)));
    }

    #[test]
    fn test_conditions() {
        let mut data = Map::new();
        data.insert("category".to_string(), json!("JCL"));
        data.insert("count".to_string(), json!(12));
        let event = TriggerEvent::UserAction {
            action: "rate".to_string(),
            data,
        };
        let mut ctx = TriggerContext::default();
        ctx.metrics.insert("memory_utilization".to_string(), 0.9);
        ctx.dependency_keys.insert("entry:1".to_string());

        let pattern = Condition::Pattern {
            field: "data.category".to_string(),
            pattern: "J*".to_string(),
        };
        let pressure = Condition::Threshold {
            metric: "memory_utilization".to_string(),
            operator: Comparison::Gt,
            value: 0.8,
        };
        let from_data = Condition::Threshold {
            metric: "count".to_string(),
            operator: Comparison::Lte,
            value: 10.0,
        };
        let dependency = Condition::Dependency {
            key: "entry:1".to_string(),
        };

        assert!(pattern.evaluate(&event, &ctx));
        assert!(pressure.evaluate(&event, &ctx));
        assert!(!from_data.evaluate(&event, &ctx));
        assert!(dependency.evaluate(&event, &ctx));
        assert!(!Condition::Dependency { key: "entry:2".to_string() }.evaluate(&event, &ctx));
    }

    #[test]
    fn test_render_templates() {
        let mut data = Map::new();
        data.insert("id".to_string(), json!(42));
        let event = TriggerEvent::DataChange {
            path: "entries".to_string(),
            change_type: ChangeType::Update,
            data,
        };
        assert_eq!(event.render("entry:{data.id}"), "entry:42");
        assert_eq!(event.render("{path}:*"), "entries:*");
        assert_eq!(event.render("x:{missing}"), "x:{missing}");
        assert_eq!(event.render("open{"), "open{");
    }

    #[test]
    fn test_apply_update() {
        let mut strategy = InvalidationStrategy::new("s", "S")
            .trigger(Trigger::UserAction {
                action: "save".to_string(),
            })
            .action(Action::InvalidatePattern {
                pattern: "*".to_string(),
            })
            .debounce_ms(100);

        strategy.apply(StrategyUpdate {
            priority: Some(7),
            debounce_ms: Some(None),
            ..Default::default()
        });
        assert_eq!(strategy.priority, 7);
        assert_eq!(strategy.debounce(), None);
        assert_eq!(strategy.triggers.len(), 1);
    }

    #[test]
    fn test_builtins_are_valid() {
        let builtins = builtin_strategies();
        assert_eq!(builtins.len(), 3);
        for strategy in &builtins {
            strategy.validate().unwrap();
        }
        let logout = builtins.iter().find(|s| s.id == USER_LOGOUT_STRATEGY).unwrap();
        assert!(builtins.iter().all(|s| s.priority <= logout.priority));
        assert!(logout.debounce().is_none());
    }

    #[test]
    fn test_strategy_serde_shape() {
        let json = json!({
            "id": "api",
            "name": "API writes",
            "triggers": [{"type": "api_response", "endpoint": "/api/*"}],
            "actions": [{"type": "invalidate_keys", "keys": ["entry:{data.id}"]}]
        });
        let strategy: InvalidationStrategy = serde_json::from_value(json).unwrap();
        assert!(strategy.enabled);
        assert_eq!(
            strategy.actions[0],
            Action::InvalidateKeys {
                keys: vec!["entry:{data.id}".to_string()],
                cascade: false
            }
        );
    }
}
