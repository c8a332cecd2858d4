//! Mail notifications: a critical-issue alert (rate-limited by the issue's
//! own open/clear lifecycle), a recovery mail once a prior fatal marker
//! clears, and an internally rate-limited heartbeat. Grounded on
//! `src/manager_mail/mod.rs`'s `Mail` struct verbatim in shape.

pub mod errors;

use chrono::{DateTime, Local};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use log::info;

use crate::config::MailParameters;

use errors::MailError;

pub struct Notifier {
    sender: SmtpTransport,
    from: Mailbox,
    to: Mailbox,
    heartbeat_interval_s: i64,
    last_heartbeat: Option<DateTime<Local>>,
}

impl Notifier {
    /// Builds a Notifier over the configured SMTP relay.
    ///
    /// # Arguments
    ///
    /// * 'config' - mail configuration parameters
    /// * 'heartbeat_interval_s' - minimum spacing between heartbeat mails
    pub fn new(config: &MailParameters, heartbeat_interval_s: i64) -> Result<Self, MailError> {
        let credentials = Credentials::new(config.smtp_user.to_owned(), config.smtp_password.to_owned());
        let sender = SmtpTransport::relay(&config.smtp_endpoint)?.credentials(credentials).build();

        let from = config.from.parse::<Mailbox>()?;
        let to = config.to.parse::<Mailbox>()?;

        Ok(Notifier { sender, from, to, heartbeat_interval_s, last_heartbeat: None })
    }

    pub fn send_mail(&self, subject: String, body: String) -> Result<(), MailError> {
        let message = Message::builder().from(self.from.clone()).to(self.to.clone()).subject(subject).header(ContentType::TEXT_PLAIN).body(body)?;

        self.sender.send(&message)?;
        Ok(())
    }

    /// Raises a notifiable issue by mail immediately (issues are already
    /// rate-limited by their own ReportCriticalErrorsDelay open/clear
    /// lifecycle upstream, so every call here is worth sending).
    pub fn notify_issue(&self, kind: &str, message: String) -> Result<(), MailError> {
        self.send_mail(format!("Power controller issue: {}", kind), message)
    }

    /// Sent once a previously-open issue clears.
    pub fn notify_recovery(&self, kind: &str) -> Result<(), MailError> {
        self.send_mail(format!("Power controller recovered: {}", kind), format!("The '{}' issue has cleared.", kind))
    }

    /// Pings a heartbeat mail, internally rate-limited to at most one per
    /// `heartbeat_interval_s`. Returns whether a mail was actually sent.
    pub fn heartbeat(&mut self, now: DateTime<Local>) -> Result<bool, MailError> {
        if self.last_heartbeat.map(|t| (now - t).num_seconds() < self.heartbeat_interval_s).unwrap_or(false) {
            return Ok(false);
        }
        self.send_mail("Power controller heartbeat".into(), format!("Still running as of {}", now.to_rfc3339()))?;
        self.last_heartbeat = Some(now);
        info!("heartbeat sent at {}", now);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> MailParameters {
        MailParameters {
            smtp_user: "user".into(),
            smtp_password: "pw".into(),
            smtp_endpoint: "smtp.example.com".into(),
            from: "controller@example.com".into(),
            to: "ops@example.com".into(),
        }
    }

    #[test]
    fn heartbeat_respects_rate_limit() {
        // The interval gate short-circuits before any network call, so this
        // is safe to assert without a live SMTP relay.
        let mut notifier = Notifier::new(&config(), 3600).unwrap();
        let t0 = Local.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        notifier.last_heartbeat = Some(t0);

        let t1 = t0 + chrono::Duration::minutes(30);
        assert_eq!(notifier.heartbeat(t1).unwrap(), false);
    }
}
