//! Topic-based monitoring hub
//!
//! Live dashboards connect to the hub, pick the topics they care about and
//! receive JSON envelopes:
//!
//! ```json
//! {"type": "cache", "data": {...}, "timestamp": "2024-01-01T00:00:00Z", "id": "..."}
//! ```
//!
//! All connections share one broadcast channel and filter by their topic set.
//! A keep-alive `ping` envelope goes to every connection on a fixed period,
//! and connections that have not called [`MonitorHub::touch`] within the idle
//! timeout are dropped on the same tick.

use crate::clock::{millis_between, system_clock, SharedClock};
use crate::error::{CacheError, Result};
use crate::metrics::collector::{MetricsCollector, Subscription};
use crate::scheduler::ScheduledTask;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Envelope type used for keep-alive messages
pub const PING: &str = "ping";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Metrics,
    Alerts,
    Sla,
    Queries,
    Cache,
}

impl Topic {
    pub const ALL: [Topic; 5] = [Topic::Metrics, Topic::Alerts, Topic::Sla, Topic::Queries, Topic::Cache];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Metrics => "metrics",
            Topic::Alerts => "alerts",
            Topic::Sla => "sla",
            Topic::Queries => "queries",
            Topic::Cache => "cache",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CacheError::InvalidOptions(format!("unknown topic: {}", s)))
    }
}

/// Wire message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub id: String,
}

impl Envelope {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_ping(&self) -> bool {
        self.kind == PING
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub channel_capacity: usize,
    pub keep_alive: Duration,
    pub idle_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            keep_alive: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(CacheError::Config("channel_capacity must be at least 1".to_string()));
        }
        if self.keep_alive.is_zero() {
            return Err(CacheError::Config("keep_alive must be positive".to_string()));
        }
        if self.idle_timeout < self.keep_alive {
            return Err(CacheError::Config(
                "idle_timeout must not be shorter than keep_alive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ConnectionState {
    topics: HashSet<Topic>,
    last_seen: DateTime<Utc>,
}

/// Receiving side of one dashboard connection
pub struct Connection {
    id: String,
    rx: broadcast::Receiver<Envelope>,
    hub: Weak<MonitorHub>,
}

impl Connection {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next envelope for a subscribed topic (or a ping).
    ///
    /// Returns `None` once the connection has been closed or reaped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let envelope = match self.rx.recv().await {
                Ok(envelope) => envelope,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Connection {} lagged, {} envelopes skipped", self.id, skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            };

            let hub = self.hub.upgrade()?;
            let connections = hub.connections.read().await;
            let state = connections.get(&self.id)?;
            if envelope.is_ping() || topic_of(&envelope).map(|t| state.topics.contains(&t)).unwrap_or(false) {
                return Some(envelope);
            }
        }
    }
}

fn topic_of(envelope: &Envelope) -> Option<Topic> {
    envelope.kind.parse().ok()
}

/// Publish/subscribe fan-out for monitoring data
pub struct MonitorHub {
    config: MonitorConfig,
    clock: SharedClock,
    tx: broadcast::Sender<Envelope>,
    connections: RwLock<HashMap<String, ConnectionState>>,
    keep_alive: Mutex<Option<ScheduledTask>>,
}

impl MonitorHub {
    pub fn new(config: MonitorConfig) -> Result<Arc<Self>> {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: MonitorConfig, clock: SharedClock) -> Result<Arc<Self>> {
        config.validate()?;
        let (tx, _) = broadcast::channel(config.channel_capacity);

        Ok(Arc::new_cyclic(|this: &Weak<MonitorHub>| {
            let keep_alive = ScheduledTask::every("monitor-keep-alive", config.keep_alive, this.clone(), |hub: Arc<MonitorHub>| async move {
                hub.ping();
                hub.reap_idle().await;
            });
            Self {
                config,
                clock,
                tx,
                connections: RwLock::new(HashMap::new()),
                keep_alive: Mutex::new(keep_alive),
            }
        }))
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Open a connection subscribed to `topics`
    pub async fn connect(self: &Arc<Self>, topics: &[Topic]) -> Connection {
        let id = Uuid::new_v4().to_string();
        let rx = self.tx.subscribe();
        self.connections.write().await.insert(
            id.clone(),
            ConnectionState {
                topics: topics.iter().copied().collect(),
                last_seen: self.clock.now(),
            },
        );
        info!("Monitor connection {} opened ({} topics)", id, topics.len());

        Connection {
            id,
            rx,
            hub: Arc::downgrade(self),
        }
    }

    pub async fn subscribe(&self, id: &str, topics: &[Topic]) -> bool {
        let mut connections = self.connections.write().await;
        let Some(state) = connections.get_mut(id) else {
            return false;
        };
        state.topics.extend(topics.iter().copied());
        state.last_seen = self.clock.now();
        true
    }

    pub async fn unsubscribe(&self, id: &str, topics: &[Topic]) -> bool {
        let mut connections = self.connections.write().await;
        let Some(state) = connections.get_mut(id) else {
            return false;
        };
        for topic in topics {
            state.topics.remove(topic);
        }
        state.last_seen = self.clock.now();
        true
    }

    /// Record client activity; keeps the connection from being reaped
    pub async fn touch(&self, id: &str) -> bool {
        match self.connections.write().await.get_mut(id) {
            Some(state) => {
                state.last_seen = self.clock.now();
                true
            }
            None => false,
        }
    }

    pub async fn disconnect(&self, id: &str) -> bool {
        let removed = self.connections.write().await.remove(id).is_some();
        if removed {
            info!("Monitor connection {} closed", id);
        }
        removed
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Topics a connection currently receives, sorted
    pub async fn topics(&self, id: &str) -> Option<Vec<Topic>> {
        let connections = self.connections.read().await;
        let mut topics: Vec<Topic> = connections.get(id)?.topics.iter().copied().collect();
        topics.sort_by_key(|t| t.as_str());
        Some(topics)
    }

    /// Broadcast `data` on a topic; returns the number of live receivers
    pub fn publish(&self, topic: Topic, data: Value) -> usize {
        self.send(topic.as_str(), data)
    }

    /// Send the keep-alive envelope to every connection
    pub fn ping(&self) -> usize {
        self.send(PING, Value::Null)
    }

    fn send(&self, kind: &str, data: Value) -> usize {
        let envelope = Envelope {
            kind: kind.to_string(),
            data,
            timestamp: self.clock.now(),
            id: Uuid::new_v4().to_string(),
        };
        match self.tx.send(envelope) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("No receivers for {} envelope", kind);
                0
            }
        }
    }

    /// Drop connections idle longer than the timeout; returns their ids
    pub async fn reap_idle(&self) -> Vec<String> {
        let now = self.clock.now();
        let limit = self.config.idle_timeout.as_millis() as u64;
        let mut connections = self.connections.write().await;

        let idle: Vec<String> = connections
            .iter()
            .filter(|(_, state)| millis_between(state.last_seen, now) > limit)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &idle {
            connections.remove(id);
            info!("Monitor connection {} reaped after idle timeout", id);
        }
        idle
    }

    /// Forward collector snapshots to the metrics, queries, cache and sla
    /// topics, and each SLA violation to alerts
    pub fn attach_collector(self: &Arc<Self>, collector: &Arc<MetricsCollector>) -> Option<Subscription> {
        let hub = Arc::downgrade(self);
        collector.subscribe(move |snapshot| {
            let hub = hub.clone();
            async move {
                let Some(hub) = hub.upgrade() else {
                    return;
                };
                let parts = [
                    (Topic::Queries, serde_json::to_value(&snapshot.query)),
                    (Topic::Cache, serde_json::to_value(&snapshot.cache)),
                    (Topic::Sla, serde_json::to_value(&snapshot.sla)),
                    (Topic::Metrics, serde_json::to_value(&snapshot)),
                ];
                for (topic, data) in parts {
                    match data {
                        Ok(data) => {
                            hub.publish(topic, data);
                        }
                        Err(e) => warn!("Could not encode {} snapshot: {}", topic, e),
                    }
                }
                for violation in &snapshot.sla.violations {
                    match serde_json::to_value(violation) {
                        Ok(data) => {
                            hub.publish(Topic::Alerts, data);
                        }
                        Err(e) => warn!("Could not encode SLA violation: {}", e),
                    }
                }
            }
        })
    }

    pub async fn shutdown(&self) {
        if let Some(mut task) = self.keep_alive.lock().await.take() {
            task.cancel();
        }
        self.connections.write().await.clear();
        info!("Monitor hub shut down");
    }
}
