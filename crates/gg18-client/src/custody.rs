//! Custody service notifier
//!
//! Every event is form-POSTed to `{base}/tss/keygen` or `{base}/tss/sign` on
//! each configured base URL. Delivery is best effort: the driver only turns
//! failures into warnings.

use gg18_core::sync::{async_trait, Checkpoint, ExternalSync, SyncEvent};
use gg18_core::{SessionKind, SyncError};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// [`ExternalSync`] over HTTP
pub struct HttpCustodySync {
    client: Client,
    bases: Vec<String>,
    timeout: Duration,
}

impl HttpCustodySync {
    pub fn new<I, S>(bases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            client: Client::new(),
            bases: bases
                .into_iter()
                .map(|base| base.as_ref().trim_end_matches('/').to_string())
                .collect(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn bases(&self) -> &[String] {
        &self.bases
    }

    async fn post(&self, url: &str, form: &[(&'static str, String)]) -> Result<(), SyncError> {
        let response = self
            .client
            .post(url)
            .form(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SyncError::Timeout(self.timeout)
                } else {
                    SyncError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Status(status.as_u16()));
        }

        let body = response.text().await.unwrap_or_default();
        debug!(%url, %body, "Custody service answered");
        Ok(())
    }
}

/// Path on the custody service for a session kind
pub fn custody_path(kind: SessionKind) -> &'static str {
    match kind {
        SessionKind::Keygen => "tss/keygen",
        SessionKind::Sign => "tss/sign",
    }
}

/// Form fields sent for one event
pub fn custody_form(event: &SyncEvent) -> Vec<(&'static str, String)> {
    let user_id = event
        .identity
        .user_id
        .clone()
        .unwrap_or_else(|| event.session_id.to_string());

    let mut form = vec![
        ("user_id", user_id),
        ("threshold", event.config.threshold().to_string()),
        ("share", event.party_id.to_string()),
    ];

    match (event.checkpoint, event.kind) {
        (Checkpoint::SessionStart, SessionKind::Keygen) => {
            if let Some(name) = &event.identity.key_name {
                form.push(("name", name.clone()));
            }
        }
        (Checkpoint::SessionStart, SessionKind::Sign) => {
            if let Some(digest) = &event.digest {
                form.push(("digest", digest.to_hex()));
            }
            if let Some(address) = &event.user_address {
                form.push(("user_address", address.to_checksum()));
            }
        }
        (Checkpoint::Round(round), _) => form.push(("round", round.to_string())),
        (Checkpoint::SessionEnd, _) => form.push(("round", "end".to_string())),
    }

    form
}

#[async_trait]
impl ExternalSync for HttpCustodySync {
    async fn notify(&self, event: &SyncEvent) -> Result<(), SyncError> {
        let form = custody_form(event);
        let path = custody_path(event.kind);
        let mut first_error = None;

        // Every base is tried even after a failure
        for base in &self.bases {
            let url = format!("{}/{}", base, path);
            if let Err(e) = self.post(&url, &form).await {
                warn!(%url, error = %e, checkpoint = %event.checkpoint, "Custody notification failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
