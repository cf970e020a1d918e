//! Notification routing — multi-channel delivery with dedup and quiet hours.
//!
//! Channels are tried in ascending `order`; the first that reports delivery
//! wins. Channels never raise: a failed send is `false`, and a fully
//! undelivered notification ends up in the log rather than an error path.
//! Repeats of the same dedup key inside the window are suppressed, and
//! quiet hours suppress everything below high priority.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, Timelike, Utc};

use crate::decision::{Decision, Priority};

/// A delivery backend. Implementations report failure by returning `false`,
/// never by panicking or erroring.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, title: &str, message: &str, priority: Priority) -> bool;
}

/// Local quiet window in wall-clock hours. `start == end` disables it.
#[derive(Debug, Clone, Copy)]
pub struct QuietHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl QuietHours {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour == self.end_hour {
            return false;
        }
        if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            // Window wraps midnight, e.g. 22 -> 7
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Routes decisions to the first willing channel.
pub struct NotificationRouter {
    channels: Vec<(u32, Box<dyn Channel>)>,
    quiet_hours: QuietHours,
    dedup_window: Duration,
    recent: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl NotificationRouter {
    pub fn new(quiet_hours: QuietHours, dedup_window: Duration) -> Self {
        Self {
            channels: Vec::new(),
            quiet_hours,
            dedup_window,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Register a channel. Lower `order` is tried first; ties keep
    /// registration order.
    pub fn register_channel(&mut self, channel: Box<dyn Channel>, order: u32) {
        tracing::debug!(
            "📡 Registered notification channel '{}' (order {order})",
            channel.name()
        );
        self.channels.push((order, channel));
        self.channels.sort_by_key(|(order, _)| *order);
    }

    /// Route a decision. Returns whether any channel delivered it.
    pub async fn send(&self, decision: &Decision) -> bool {
        self.send_at(decision, Local::now().hour()).await
    }

    async fn send_at(&self, decision: &Decision, local_hour: u32) -> bool {
        let key = self.dedup_key(decision);

        if self.is_duplicate(&key) {
            tracing::debug!("🔇 Suppressed duplicate notification '{}'", decision.title);
            return false;
        }

        if self.quiet_hours.contains(local_hour) && decision.priority != Priority::High {
            tracing::info!(
                "🌙 Quiet hours: suppressed {} notification '{}'",
                decision.priority.as_str(),
                decision.title
            );
            return false;
        }

        for (_, channel) in &self.channels {
            if channel
                .send(&decision.title, &decision.message, decision.priority)
                .await
            {
                tracing::info!("📤 '{}' delivered via {}", decision.title, channel.name());
                self.record_sent(&key);
                return true;
            }
            tracing::warn!(
                "⚠️ Channel {} declined '{}', trying next",
                channel.name(),
                decision.title
            );
        }

        tracing::error!("📭 Undelivered notification: '{}'", decision.title);
        false
    }

    /// Explicit key from the decision, or derived from content plus the
    /// primary channel class.
    fn dedup_key(&self, decision: &Decision) -> String {
        if let Some(key) = &decision.dedup_key {
            return key.clone();
        }
        let class = self
            .channels
            .first()
            .map(|(_, c)| c.name())
            .unwrap_or("none");
        format!("{}|{}|{}", decision.title, decision.message, class)
    }

    /// Was this key delivered within the dedup window? Prunes expired
    /// records as a side effect to keep the map bounded.
    fn is_duplicate(&self, key: &str) -> bool {
        let now = Utc::now();
        let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        recent.retain(|_, sent_at| now - *sent_at < self.dedup_window);
        recent.contains_key(key)
    }

    fn record_sent(&self, key: &str) {
        let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        recent.insert(key.to_string(), Utc::now());
    }
}

/// Last-resort channel that writes to the process log. Always delivers.
pub struct ConsoleChannel;

#[async_trait]
impl Channel for ConsoleChannel {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(&self, title: &str, message: &str, priority: Priority) -> bool {
        tracing::info!("🔔 [{}] {title}: {message}", priority.as_str());
        true
    }
}
