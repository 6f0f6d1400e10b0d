use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::EmailConfig;
use crate::db;
use crate::email::{Outbox, QueuedEmail};

const DELIVERY_BATCH: usize = 50;

/// Where queued e-mails go once delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Leave e-mails queued for an external delivery process.
    #[default]
    Outbox,
    Stdout,
    Webhook,
}

#[async_trait]
pub trait EmailSink: Send + Sync {
    async fn deliver(&self, email: &QueuedEmail) -> Result<()>;
}

pub struct StdoutSink;

#[async_trait]
impl EmailSink for StdoutSink {
    async fn deliver(&self, email: &QueuedEmail) -> Result<()> {
        println!(
            "To: {} <{}>\nFrom: {}\nSubject: {}\n\n{}",
            email.to_name, email.to_email, email.from_address, email.subject, email.body
        );
        Ok(())
    }
}

pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("clerk/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl EmailSink for WebhookSink {
    async fn deliver(&self, email: &QueuedEmail) -> Result<()> {
        self.client
            .post(&self.url)
            .json(email)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Builds the configured sink, or `None` when e-mails stay in the outbox.
pub fn build_sink(config: &EmailConfig) -> Result<Option<Box<dyn EmailSink>>> {
    match config.sink {
        SinkKind::Outbox => Ok(None),
        SinkKind::Stdout => Ok(Some(Box::new(StdoutSink))),
        SinkKind::Webhook => {
            if config.webhook_url.trim().is_empty() {
                warn!("email sink is webhook but no webhook_url is set; leaving emails queued");
                return Ok(None);
            }
            Ok(Some(Box::new(WebhookSink::new(config.webhook_url.clone())?)))
        }
    }
}

/// Claims a batch of queued e-mails and hands each to `sink`. Delivered rows
/// are marked sent; failed ones go back to the queue for a later call.
pub async fn deliver_pending(
    db_path: &Path,
    config: &EmailConfig,
    sink: &dyn EmailSink,
) -> Result<usize> {
    let claimed = {
        let conn = db::open(db_path)?;
        Outbox::new(&conn, config.site_name.as_str(), config.from_address.as_str())
            .claim_pending(DELIVERY_BATCH)?
    };
    if claimed.is_empty() {
        return Ok(0);
    }

    let mut delivered = Vec::new();
    let mut failed = Vec::new();
    for email in &claimed {
        match sink.deliver(email).await {
            Ok(()) => delivered.push(email.id),
            Err(err) => {
                warn!("failed delivering email {}: {err}", email.id);
                failed.push(email.id);
            }
        }
    }

    let conn = db::open(db_path)?;
    let outbox = Outbox::new(&conn, config.site_name.as_str(), config.from_address.as_str());
    outbox.mark_sent(&delivered)?;
    outbox.release(&failed)?;
    info!("delivered {} of {} queued emails", delivered.len(), claimed.len());
    Ok(delivered.len())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    use super::{build_sink, deliver_pending, EmailSink, SinkKind};
    use crate::accounts::UserStore;
    use crate::config::EmailConfig;
    use crate::db;
    use crate::email::{EmailTemplate, Mailer, Outbox, QueuedEmail};
    use crate::migrations::MigrationRunner;

    #[derive(Default)]
    struct CollectingSink {
        delivered: Mutex<Vec<String>>,
        fail: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl EmailSink for CollectingSink {
        async fn deliver(&self, email: &QueuedEmail) -> Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(anyhow!("smtp down"));
            }
            self.delivered
                .lock()
                .expect("sink mutex poisoned")
                .push(email.to_email.clone());
            Ok(())
        }
    }

    fn temp_db() -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("clerk-sink-{}-{nanos}.db", std::process::id()))
    }

    fn queue_one(path: &std::path::Path) {
        let conn = db::open(path).expect("open");
        MigrationRunner::new().run(&conn).expect("migrate");
        let user = UserStore::new(&conn)
            .create("c@example.com", "")
            .expect("create");
        Outbox::new(&conn, "Clerk", "support@localhost")
            .send_user_email(&user, EmailTemplate::PasswordChanged, BTreeMap::new())
            .expect("queue");
    }

    #[test]
    fn outbox_kind_builds_no_sink() {
        let config = EmailConfig::default();
        assert_eq!(config.sink, SinkKind::Outbox);
        assert!(build_sink(&config).expect("build").is_none());

        let webhook_without_url = EmailConfig {
            sink: SinkKind::Webhook,
            ..EmailConfig::default()
        };
        assert!(build_sink(&webhook_without_url).expect("build").is_none());
    }

    #[test]
    fn delivers_and_marks_queued_emails() {
        let path = temp_db();
        queue_one(&path);
        let sink = CollectingSink::default();
        let config = EmailConfig::default();

        let delivered =
            tokio_test::block_on(deliver_pending(&path, &config, &sink)).expect("deliver");
        assert_eq!(delivered, 1);
        assert_eq!(
            *sink.delivered.lock().expect("sink mutex poisoned"),
            vec!["c@example.com".to_string()]
        );

        let again = tokio_test::block_on(deliver_pending(&path, &config, &sink)).expect("deliver");
        assert_eq!(again, 0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn failed_deliveries_stay_queued() {
        let path = temp_db();
        queue_one(&path);
        let sink = CollectingSink {
            fail: true,
            ..CollectingSink::default()
        };
        let config = EmailConfig::default();

        let delivered =
            tokio_test::block_on(deliver_pending(&path, &config, &sink)).expect("deliver");
        assert_eq!(delivered, 0);

        let conn = db::open(&path).expect("open");
        let pending = Outbox::new(&conn, "Clerk", "support@localhost")
            .pending(10)
            .expect("pending");
        assert_eq!(pending.len(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn failed_deliveries_are_retried_by_the_next_run() {
        let path = temp_db();
        queue_one(&path);
        let config = EmailConfig::default();
        let failing = CollectingSink {
            fail: true,
            ..CollectingSink::default()
        };
        let working = CollectingSink::default();

        let first =
            tokio_test::block_on(deliver_pending(&path, &config, &failing)).expect("deliver");
        let second =
            tokio_test::block_on(deliver_pending(&path, &config, &working)).expect("deliver");
        assert_eq!((first, second), (0, 1));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn concurrent_runs_deliver_each_email_once() {
        let path = temp_db();
        queue_one(&path);
        let config = EmailConfig::default();
        let sink = CollectingSink {
            delay: Some(Duration::from_millis(50)),
            ..CollectingSink::default()
        };

        let (a, b) = tokio::join!(
            deliver_pending(&path, &config, &sink),
            deliver_pending(&path, &config, &sink)
        );
        assert_eq!(a.expect("deliver") + b.expect("deliver"), 1);
        assert_eq!(sink.delivered.lock().expect("sink mutex poisoned").len(), 1);
        let _ = std::fs::remove_file(&path);
    }
}
