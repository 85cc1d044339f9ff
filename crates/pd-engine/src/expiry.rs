use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::info;

use pd_infra::Result;
use pd_infra::mail::MailSender;
use pd_infra::notify::{MailTemplates, TEMPLATE_EXPIRING};
use pd_infra::types::Instance;

pub const SUBJECT_INSTANCE_EXPIRING: &str = "Your Paddock instance is about to expire";

const EXPIRY_DATE_FORMAT: &str = "%d-%m-%Y";

/// Warns users whose instances expire within a configurable window.
/// Already-expired instances are skipped; those are the apply
/// operation's business.
pub struct ExpiryNotifier {
    mailer: Arc<dyn MailSender>,
    templates: Arc<MailTemplates>,
    window: Duration,
}

impl ExpiryNotifier {
    pub fn new(mailer: Arc<dyn MailSender>, templates: Arc<MailTemplates>, window: Duration) -> Self {
        Self {
            mailer,
            templates,
            window,
        }
    }

    /// Send one warning per soon-expiring instance, returning how many
    /// were sent. Sequential; the first failure aborts.
    pub async fn run(&self, desired: &[Instance]) -> Result<usize> {
        let now = Utc::now();
        let mut notified = 0;

        for instance in desired {
            if instance.is_expired_at(now) || instance.expires_at - now > self.window {
                continue;
            }

            let expires = instance.expires_at.format(EXPIRY_DATE_FORMAT).to_string();
            let body = self.templates.render(
                TEMPLATE_EXPIRING,
                json!({
                    "name": instance.name,
                    "user": instance.user.name,
                    "expires": expires,
                }),
            )?;

            self.mailer
                .send(&instance.user.email, SUBJECT_INSTANCE_EXPIRING, &body)
                .await?;

            info!(name = %instance.name, expires = %expires, "expiry warning sent");
            notified += 1;
        }

        Ok(notified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pd_infra::types::{InstanceResources, User};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeMailer {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MailSender for FakeMailer {
        async fn send(&self, recipient: &str, _subject: &str, _body: &str) -> Result<()> {
            self.sent.lock().unwrap().push(recipient.to_string());
            Ok(())
        }
    }

    fn expiring_in(name: &str, days: i64) -> Instance {
        Instance {
            name: name.to_string(),
            resources: InstanceResources {
                flavor: "micro".into(),
                disk: 20,
            },
            user: User {
                name: format!("{name}-user"),
                email: format!("{name}@example.org"),
                public_key: "ssh-ed25519 AAAA".into(),
            },
            expires_at: Utc::now() + Duration::days(days),
        }
    }

    #[tokio::test]
    async fn warns_only_inside_the_window() {
        let mailer = Arc::new(FakeMailer::default());
        let notifier = ExpiryNotifier::new(
            Arc::clone(&mailer) as Arc<dyn MailSender>,
            Arc::new(MailTemplates::new().unwrap()),
            Duration::days(7),
        );

        let desired = vec![
            expiring_in("soon", 3),
            expiring_in("later", 30),
            expiring_in("gone", -1),
        ];

        let notified = notifier.run(&desired).await.unwrap();

        assert_eq!(notified, 1);
        assert_eq!(*mailer.sent.lock().unwrap(), vec!["soon@example.org".to_string()]);
    }
}
