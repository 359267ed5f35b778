//! Delivery with bounded retries and a log fallback.
//!
//! Every channel call runs under a timeout so a hung transport counts as a
//! failed attempt instead of stalling the worker. `silent` never attempts
//! delivery and `log` is tried exactly once. Any other channel gets up to
//! `max_attempts` tries with exponential backoff; if all fail the report
//! goes to the log channel and is marked degraded.

use crate::alert::Notifier;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use vigilo_core::baseline::AlertMode;
use vigilo_core::error::VigiloError;
use vigilo_core::report::{AlertReport, AttemptOutcome, ChangeRecord, DeliveryStatus, DispatchAttempt};
use vigilo_core::settings::MonitorSettings;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &MonitorSettings) -> Self {
        Self {
            max_attempts: settings.dispatch.max_attempts,
            backoff_base: settings.backoff_base(),
            timeout: settings.channel_timeout(),
        }
    }

    /// Delay before attempt `attempt + 1`: base, 2×base, 4×base, …
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&MonitorSettings::default())
    }
}

pub struct Dispatcher {
    channels: HashMap<AlertMode, Arc<dyn Notifier>>,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>, policy: RetryPolicy) -> Self {
        let channels = notifiers.into_iter().map(|n| (n.mode(), n)).collect();
        Self { channels, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn has_channel(&self, mode: AlertMode) -> bool {
        self.channels.contains_key(&mode)
    }

    /// Build the report for `record` and deliver it through `mode`.
    pub async fn dispatch(&self, record: &ChangeRecord, mode: AlertMode) -> AlertReport {
        let mut report = AlertReport::from_record(record, mode);
        self.deliver(&mut report).await;
        report
    }

    /// Deliver an already built report, recording every attempt on it.
    pub async fn deliver(&self, report: &mut AlertReport) {
        let mode = report.alert_mode;
        report.delivery = match mode {
            AlertMode::Silent => {
                debug!(path = %report.path.display(), "silent mode, not delivering");
                DeliveryStatus::Silenced
            }
            AlertMode::Log => {
                if self.try_channel(report, AlertMode::Log, 1).await {
                    DeliveryStatus::Delivered
                } else {
                    DeliveryStatus::Failed
                }
            }
            _ => {
                let mut delivered = false;
                for attempt in 1..=self.policy.max_attempts {
                    if self.try_channel(report, mode, attempt).await {
                        delivered = true;
                        break;
                    }
                    if !self.has_channel(mode) {
                        break;
                    }
                    if attempt < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.backoff(attempt)).await;
                    }
                }
                if delivered {
                    DeliveryStatus::Delivered
                } else {
                    warn!(
                        path = %report.path.display(),
                        channel = %mode,
                        "alert channel exhausted, falling back to log"
                    );
                    if self.try_channel(report, AlertMode::Log, 1).await {
                        DeliveryStatus::Degraded
                    } else {
                        DeliveryStatus::Failed
                    }
                }
            }
        };
        match report.delivery {
            DeliveryStatus::Failed => {
                error!(path = %report.path.display(), "alert could not be delivered on any channel")
            }
            status => info!(path = %report.path.display(), event = %report.event_type, ?status, "alert dispatched"),
        }
    }

    async fn try_channel(&self, report: &mut AlertReport, mode: AlertMode, attempt: u32) -> bool {
        let outcome = match self.channels.get(&mode) {
            None => AttemptOutcome::Failed {
                error: format!("channel {mode} is not configured"),
            },
            Some(channel) => match tokio::time::timeout(self.policy.timeout, channel.send(report)).await {
                Ok(Ok(())) => AttemptOutcome::Delivered,
                Ok(Err(e)) => AttemptOutcome::Failed {
                    error: e.to_string(),
                },
                Err(_) => {
                    let after_ms = self.policy.timeout.as_millis() as u64;
                    let timeout = VigiloError::ChannelTimeout {
                        channel: mode.to_string(),
                        timeout_ms: after_ms,
                    };
                    debug!(error = %timeout, "alert channel did not answer");
                    AttemptOutcome::TimedOut { after_ms }
                }
            },
        };
        if outcome != AttemptOutcome::Delivered {
            warn!(channel = %mode, attempt, ?outcome, "alert delivery attempt failed");
        }
        let delivered = outcome == AttemptOutcome::Delivered;
        report.dispatch_attempts.push(DispatchAttempt {
            channel: mode,
            attempt,
            outcome,
            at: Utc::now(),
        });
        delivered
    }
}
