mod telegram;

pub use telegram::TelegramSink;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::core::config::AlertConfig;
use crate::core::error::{SupervisorError, SupervisorResult};

/// Telegram rejects messages above 4096 characters; keep some headroom.
pub const MAX_MESSAGE_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    ErrorLog,
    Crash,
    UpdateCycle,
}

impl AlertKind {
    pub fn label(self) -> &'static str {
        match self {
            AlertKind::ErrorLog => "error log",
            AlertKind::Crash => "crash",
            AlertKind::UpdateCycle => "update cycle",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    /// Bot the alert is about; `None` for fleet-wide reports.
    pub bot: Option<String>,
    pub kind: AlertKind,
    pub body: String,
}

impl Alert {
    pub fn for_bot(bot: impl Into<String>, kind: AlertKind, body: impl Into<String>) -> Self {
        Self {
            bot: Some(bot.into()),
            kind,
            body: body.into(),
        }
    }

    pub fn fleet(kind: AlertKind, body: impl Into<String>) -> Self {
        Self {
            bot: None,
            kind,
            body: body.into(),
        }
    }

    /// Plain-text rendering, capped at [`MAX_MESSAGE_CHARS`].
    pub fn render(&self) -> String {
        let subject = self.bot.as_deref().unwrap_or("fleet");
        let text = format!("[botwarden] {} · {}\n{}", subject, self.kind.label(), self.body);
        truncate_chars(&text, MAX_MESSAGE_CHARS)
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// An external messaging endpoint.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, text: &str) -> SupervisorResult<()>;
}

/// Best-effort alert delivery.
///
/// Every attempt is bounded by `timeout`; a transient failure gets exactly one
/// immediate retry. Failures are logged here and never returned to callers.
#[derive(Clone)]
pub struct AlertDispatcher {
    sink: Option<Arc<dyn AlertSink>>,
    timeout: Duration,
    retry_transient: bool,
}

impl AlertDispatcher {
    pub fn new(sink: Option<Arc<dyn AlertSink>>, timeout: Duration, retry_transient: bool) -> Self {
        Self {
            sink,
            timeout,
            retry_transient,
        }
    }

    /// Dispatcher that only logs alerts locally.
    pub fn disabled() -> Self {
        Self::new(None, Duration::from_secs(10), false)
    }

    pub fn from_config(config: &AlertConfig) -> Self {
        let sink: Option<Arc<dyn AlertSink>> = match (&config.telegram_token, config.chat_id) {
            (Some(token), Some(chat_id)) if !token.trim().is_empty() => {
                Some(Arc::new(TelegramSink::new(token, chat_id)))
            }
            _ => {
                info!("Alert channel not configured; alerts will only be logged.");
                None
            }
        };
        Self::new(sink, config.timeout(), config.retry_transient)
    }

    pub fn is_configured(&self) -> bool {
        self.sink.is_some()
    }

    async fn attempt(&self, sink: &dyn AlertSink, text: &str) -> SupervisorResult<()> {
        match tokio::time::timeout(self.timeout, sink.deliver(text)).await {
            Ok(result) => result,
            Err(_) => Err(SupervisorError::AlertDelivery {
                transient: true,
                reason: format!("timed out after {:?}", self.timeout),
            }),
        }
    }

    /// Deliver an alert; returns whether it reached the endpoint.
    pub async fn dispatch(&self, alert: Alert) -> bool {
        let text = alert.render();
        let Some(sink) = self.sink.as_deref() else {
            info!("ALERT {}", text.replace('\n', " | "));
            return false;
        };

        let mut result = self.attempt(sink, &text).await;
        if let Err(e) = &result
            && self.retry_transient
            && e.is_transient()
        {
            warn!("Alert delivery failed ({}), retrying once", e);
            result = self.attempt(sink, &text).await;
        }

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Dropping {} alert for {}: {}",
                    alert.kind.label(),
                    alert.bot.as_deref().unwrap_or("fleet"),
                    e
                );
                false
            }
        }
    }

    /// Fire-and-forget variant for callers that must not wait on the network.
    pub fn spawn(&self, alert: Alert) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.dispatch(alert).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakySink {
        failures_left: AtomicUsize,
        transient: bool,
        calls: AtomicUsize,
        delivered: Mutex<Vec<String>>,
    }

    impl FlakySink {
        fn new(failures: usize, transient: bool) -> Arc<Self> {
            Arc::new(Self {
                failures_left: AtomicUsize::new(failures),
                transient,
                calls: AtomicUsize::new(0),
                delivered: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AlertSink for FlakySink {
        async fn deliver(&self, text: &str) -> SupervisorResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(SupervisorError::AlertDelivery {
                    transient: self.transient,
                    reason: "boom".into(),
                });
            }
            self.delivered.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct HangingSink;

    #[async_trait]
    impl AlertSink for HangingSink {
        async fn deliver(&self, _text: &str) -> SupervisorResult<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[test]
    fn render_names_bot_and_kind_and_caps_length() {
        let alert = Alert::for_bot("alpha", AlertKind::Crash, "exit code 1");
        assert_eq!(alert.render(), "[botwarden] alpha · crash\nexit code 1");

        let long = Alert::fleet(AlertKind::UpdateCycle, "é".repeat(5000));
        assert_eq!(long.render().chars().count(), MAX_MESSAGE_CHARS);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once() {
        let sink = FlakySink::new(1, true);
        let dispatcher = AlertDispatcher::new(Some(sink.clone()), Duration::from_secs(1), true);
        assert!(
            dispatcher
                .dispatch(Alert::for_bot("alpha", AlertKind::ErrorLog, "Traceback"))
                .await
        );
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_is_swallowed_without_retry() {
        let sink = FlakySink::new(5, false);
        let dispatcher = AlertDispatcher::new(Some(sink.clone()), Duration::from_secs(1), true);
        assert!(
            !dispatcher
                .dispatch(Alert::for_bot("alpha", AlertKind::Crash, "signal 9"))
                .await
        );
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_endpoint_is_bounded_by_the_timeout() {
        let dispatcher =
            AlertDispatcher::new(Some(Arc::new(HangingSink)), Duration::from_secs(2), true);
        let started = tokio::time::Instant::now();
        assert!(
            !dispatcher
                .dispatch(Alert::fleet(AlertKind::UpdateCycle, "report"))
                .await
        );
        assert!(started.elapsed() <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unconfigured_dispatcher_only_logs() {
        let dispatcher = AlertDispatcher::disabled();
        assert!(!dispatcher.is_configured());
        assert!(
            !dispatcher
                .dispatch(Alert::for_bot("alpha", AlertKind::Crash, "exit 1"))
                .await
        );
    }
}
