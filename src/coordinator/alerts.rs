use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::health::HealthSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Which side of the threshold counts as a breach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Upper,
    Lower,
}

/// Threshold rule for one metric. Resolution requires crossing back past
/// `threshold ∓ hysteresis`, so a metric wobbling at the boundary cannot
/// flap the alert.
#[derive(Debug, Clone)]
pub struct AlertRule {
    pub id: String,
    pub metric: String,
    pub bound: Bound,
    pub threshold: f64,
    pub hysteresis: f64,
    pub severity: Severity,
    /// Suppressed rules still track breach state but are not forwarded to
    /// the sink.
    pub suppressed: bool,
}

impl AlertRule {
    pub fn upper(id: impl Into<String>, metric: impl Into<String>, threshold: f64) -> Self {
        Self {
            id: id.into(),
            metric: metric.into(),
            bound: Bound::Upper,
            threshold,
            hysteresis: 0.0,
            severity: Severity::Warning,
            suppressed: false,
        }
    }

    pub fn lower(id: impl Into<String>, metric: impl Into<String>, threshold: f64) -> Self {
        Self {
            bound: Bound::Lower,
            ..Self::upper(id, metric, threshold)
        }
    }

    pub fn with_hysteresis(mut self, hysteresis: f64) -> Self {
        self.hysteresis = hysteresis;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn suppressed(mut self) -> Self {
        self.suppressed = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub rule_id: String,
    pub agent_id: String,
    pub severity: Severity,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub suppressed: bool,
}

#[derive(Debug, Clone)]
pub enum AlertTransition {
    Opened(AlertEvent),
    Resolved(AlertEvent),
}

impl AlertTransition {
    pub fn event(&self) -> &AlertEvent {
        match self {
            AlertTransition::Opened(e) | AlertTransition::Resolved(e) => e,
        }
    }
}

/// Where alert transitions go. The default sink writes discrete timestamped
/// log records; production deployments point this at syslog or a pager
/// webhook collaborator.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, transition: &AlertTransition);
}

pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, transition: &AlertTransition) {
        match transition {
            AlertTransition::Opened(event) => {
                tracing::warn!(
                    rule = %event.rule_id,
                    agent = %event.agent_id,
                    severity = %event.severity,
                    opened_at = %event.opened_at,
                    "Alert opened"
                );
            }
            AlertTransition::Resolved(event) => {
                tracing::info!(
                    rule = %event.rule_id,
                    agent = %event.agent_id,
                    resolved_at = %event.resolved_at.unwrap_or(event.opened_at),
                    "Alert resolved"
                );
            }
        }
    }
}

/// Evaluates samples against rules, holding at most one open event per
/// (rule, agent) pair.
#[derive(Debug, Default)]
pub struct AlertManager {
    rules: Vec<AlertRule>,
    open: HashMap<(String, String), AlertEvent>,
}

impl AlertManager {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        Self {
            rules,
            open: HashMap::new(),
        }
    }

    pub fn add_rule(&mut self, rule: AlertRule) {
        self.rules.push(rule);
    }

    pub fn open_events(&self) -> impl Iterator<Item = &AlertEvent> {
        self.open.values()
    }

    /// Apply one batch of samples. An open event does not re-fire while the
    /// breach persists; a new event for the pair can only open after the
    /// previous one resolved.
    pub fn evaluate(&mut self, samples: &[HealthSample], now: DateTime<Utc>) -> Vec<AlertTransition> {
        let mut transitions = Vec::new();
        for sample in samples {
            for rule in self.rules.iter().filter(|r| r.metric == sample.metric) {
                let key = (rule.id.clone(), sample.agent_id.clone());
                let breached = match rule.bound {
                    Bound::Upper => sample.value > rule.threshold,
                    Bound::Lower => sample.value < rule.threshold,
                };
                let cleared = match rule.bound {
                    Bound::Upper => sample.value < rule.threshold - rule.hysteresis,
                    Bound::Lower => sample.value > rule.threshold + rule.hysteresis,
                };

                if breached {
                    if !self.open.contains_key(&key) {
                        let event = AlertEvent {
                            rule_id: rule.id.clone(),
                            agent_id: sample.agent_id.clone(),
                            severity: rule.severity,
                            opened_at: now,
                            resolved_at: None,
                            suppressed: rule.suppressed,
                        };
                        self.open.insert(key, event.clone());
                        transitions.push(AlertTransition::Opened(event));
                    }
                } else if cleared {
                    if let Some(mut event) = self.open.remove(&key) {
                        event.resolved_at = Some(now);
                        transitions.push(AlertTransition::Resolved(event));
                    }
                }
                // inside the hysteresis band: no state change either way
            }
        }
        transitions
    }
}
