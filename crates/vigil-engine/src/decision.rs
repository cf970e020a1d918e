//! Decision engine — named triggers evaluated against state snapshots.
//!
//! A trigger is a condition/action pair gated by a cooldown. Triggers are
//! registered once at startup and evaluated independently in registration
//! order; a panic-free contract means a failing condition or action only
//! skips its own trigger for the tick. Cooldown timestamps live in
//! [`TrackerState`] so a restart does not unleash a burst of re-fires.

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use vigil_core::{Result, VigilError};

use crate::snapshot::StateSnapshot;
use crate::tracker::TrackerState;

/// What the scheduler should do with a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Notify,
    EnqueueTask,
    RequestApproval,
    Ignore,
}

/// Urgency of a decision. Drives quiet-hours suppression and queue priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    /// Mapping into the task queue's 1 (urgent) .. 10 (idle) scale.
    pub fn queue_priority(&self) -> i64 {
        match self {
            Priority::High => 1,
            Priority::Medium => 5,
            Priority::Low => 8,
        }
    }
}

/// Immutable outcome of one trigger firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action_type: ActionType,
    pub priority: Priority,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Explicit dedup key for the notification router. When absent the
    /// router derives one from content, which risks collisions between
    /// different messages with similar text — prefer setting it.
    #[serde(default)]
    pub dedup_key: Option<String>,
}

impl Decision {
    pub fn notify(priority: Priority, title: &str, message: &str) -> Self {
        Self {
            action_type: ActionType::Notify,
            priority,
            title: title.to_string(),
            message: message.to_string(),
            payload: serde_json::Value::Null,
            dedup_key: None,
        }
    }

    pub fn enqueue(priority: Priority, title: &str, payload: serde_json::Value) -> Self {
        Self {
            action_type: ActionType::EnqueueTask,
            priority,
            title: title.to_string(),
            message: String::new(),
            payload,
            dedup_key: None,
        }
    }

    pub fn with_dedup_key(mut self, key: &str) -> Self {
        self.dedup_key = Some(key.to_string());
        self
    }
}

type Condition = Box<dyn Fn(&StateSnapshot) -> Result<bool> + Send + Sync>;
type Action = Box<dyn Fn(&StateSnapshot) -> Result<Decision> + Send + Sync>;

/// A named condition/action pair with a cooldown.
pub struct Trigger {
    pub name: String,
    pub cooldown: Duration,
    condition: Condition,
    action: Action,
}

impl Trigger {
    pub fn new<C, A>(name: &str, cooldown: Duration, condition: C, action: A) -> Self
    where
        C: Fn(&StateSnapshot) -> Result<bool> + Send + Sync + 'static,
        A: Fn(&StateSnapshot) -> Result<Decision> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            cooldown,
            condition: Box::new(condition),
            action: Box::new(action),
        }
    }
}

/// Evaluates registered triggers against each snapshot.
pub struct DecisionEngine {
    triggers: Vec<Trigger>,
    tracker: Arc<TrackerState>,
}

impl DecisionEngine {
    pub fn new(tracker: Arc<TrackerState>) -> Self {
        Self {
            triggers: Vec::new(),
            tracker,
        }
    }

    /// Register a trigger. Names must be unique.
    pub fn register(&mut self, trigger: Trigger) -> Result<()> {
        if self.triggers.iter().any(|t| t.name == trigger.name) {
            return Err(VigilError::InvalidState(format!(
                "trigger '{}' is already registered",
                trigger.name
            )));
        }
        tracing::debug!("🧩 Registered trigger '{}'", trigger.name);
        self.triggers.push(trigger);
        Ok(())
    }

    pub fn trigger_names(&self) -> Vec<&str> {
        self.triggers.iter().map(|t| t.name.as_str()).collect()
    }

    /// Evaluate every trigger against a snapshot, in registration order.
    ///
    /// A trigger inside its cooldown window is skipped even if its condition
    /// holds. A condition or action error is logged and isolates to that
    /// trigger. The cooldown starts only when the action actually produced a
    /// decision.
    pub fn evaluate(&self, snapshot: &StateSnapshot) -> Vec<Decision> {
        let mut decisions = Vec::new();
        for trigger in &self.triggers {
            let key = format!("trigger:{}", trigger.name);
            if !self.tracker.check_cooldown(&key, trigger.cooldown) {
                continue;
            }
            match (trigger.condition)(snapshot) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    tracing::warn!("⚠️ Trigger '{}' condition failed: {e}", trigger.name);
                    continue;
                }
            }
            match (trigger.action)(snapshot) {
                Ok(decision) => {
                    self.tracker.record_cooldown(&key);
                    tracing::info!(
                        "🔔 Trigger '{}' fired ({} / {})",
                        trigger.name,
                        decision.priority.as_str(),
                        decision.title
                    );
                    decisions.push(decision);
                }
                Err(e) => {
                    tracing::warn!("⚠️ Trigger '{}' action failed: {e}", trigger.name);
                }
            }
        }
        decisions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tracker() -> Arc<TrackerState> {
        let path = std::env::temp_dir()
            .join(format!("vigil-decision-{}.json", uuid::Uuid::new_v4()));
        Arc::new(TrackerState::open(&path))
    }

    fn snapshot(memory: u64) -> StateSnapshot {
        StateSnapshot::new("system", 1, json!({"memory_percent": memory}))
    }

    fn memory_trigger(cooldown: Duration) -> Trigger {
        Trigger::new(
            "high_memory",
            cooldown,
            |snap| {
                Ok(snap
                    .get("/memory_percent")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0)
                    > 90)
            },
            |_| Ok(Decision::notify(Priority::High, "Memory high", "above 90%")),
        )
    }

    #[test]
    fn fires_when_condition_holds_and_respects_cooldown() {
        let mut engine = DecisionEngine::new(tracker());
        engine.register(memory_trigger(Duration::minutes(10))).unwrap();

        assert!(engine.evaluate(&snapshot(50)).is_empty());

        let fired = engine.evaluate(&snapshot(95));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].title, "Memory high");

        // Condition still true, but inside cooldown window
        assert!(engine.evaluate(&snapshot(95)).is_empty());
    }

    #[test]
    fn cooldown_survives_engine_restart() {
        let path = std::env::temp_dir()
            .join(format!("vigil-decision-{}.json", uuid::Uuid::new_v4()));
        {
            let tracker = Arc::new(TrackerState::open(&path));
            let mut engine = DecisionEngine::new(tracker.clone());
            engine.register(memory_trigger(Duration::minutes(10))).unwrap();
            assert_eq!(engine.evaluate(&snapshot(95)).len(), 1);
            tracker.flush().unwrap();
        }

        let mut engine = DecisionEngine::new(Arc::new(TrackerState::open(&path)));
        engine.register(memory_trigger(Duration::minutes(10))).unwrap();
        assert!(engine.evaluate(&snapshot(95)).is_empty());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn failing_trigger_does_not_affect_others() {
        let mut engine = DecisionEngine::new(tracker());
        engine
            .register(Trigger::new(
                "broken",
                Duration::zero(),
                |_| Err(VigilError::Provider("x".into(), "gone".into())),
                |_| Ok(Decision::notify(Priority::Low, "never", "")),
            ))
            .unwrap();
        engine.register(memory_trigger(Duration::minutes(1))).unwrap();

        let fired = engine.evaluate(&snapshot(95));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].title, "Memory high");
    }

    #[test]
    fn failed_action_does_not_start_cooldown() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();

        let mut engine = DecisionEngine::new(tracker());
        engine
            .register(Trigger::new(
                "flaky_action",
                Duration::minutes(10),
                |_| Ok(true),
                move |_| {
                    if attempts2.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(VigilError::Store("transient".into()))
                    } else {
                        Ok(Decision::notify(Priority::Medium, "ok now", ""))
                    }
                },
            ))
            .unwrap();

        assert!(engine.evaluate(&snapshot(95)).is_empty());
        // Next tick retries because the cooldown never started
        assert_eq!(engine.evaluate(&snapshot(95)).len(), 1);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut engine = DecisionEngine::new(tracker());
        engine.register(memory_trigger(Duration::zero())).unwrap();
        assert!(matches!(
            engine.register(memory_trigger(Duration::zero())),
            Err(VigilError::InvalidState(_))
        ));
    }

    #[test]
    fn evaluation_preserves_registration_order() {
        let mut engine = DecisionEngine::new(tracker());
        for name in ["first", "second", "third"] {
            engine
                .register(Trigger::new(
                    name,
                    Duration::zero(),
                    |_| Ok(true),
                    move |_| Ok(Decision::notify(Priority::Low, name, "")),
                ))
                .unwrap();
        }
        let titles: Vec<String> = engine
            .evaluate(&snapshot(0))
            .into_iter()
            .map(|d| d.title)
            .collect();
        assert_eq!(titles, vec!["first", "second", "third"]);
    }
}
