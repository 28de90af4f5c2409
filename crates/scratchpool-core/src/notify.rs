//! Best-effort notification of newly provisioned environments

use crate::error::PoolError;
use crate::logging::LogContext;
use crate::remote::RemoteClient;
use crate::types::AllocatedHandle;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Side channel telling a requester about their environment
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver connection details to `recipient`
    async fn notify(&self, recipient: &str, handle: &AllocatedHandle) -> Result<(), PoolError>;
}

/// Sends mail through the hub's `emailSimple` action
pub struct EmailNotifier {
    remote: Arc<dyn RemoteClient>,
    api_version: String,
    sender: String,
    log: LogContext,
}

impl EmailNotifier {
    /// Create notifier; `sender` is the hub username shown in the message
    #[must_use]
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        api_version: impl Into<String>,
        sender: impl Into<String>,
        log: &LogContext,
    ) -> Self {
        Self {
            remote,
            api_version: api_version.into(),
            sender: sender.into(),
            log: log.child("notify"),
        }
    }

    fn body(&self, handle: &AllocatedHandle) -> String {
        format!(
            "{sender} has generated a new scratch org for you in the pool.\n\
             <p>The login url for this org is: {url}\n\
             <p>Username: {user}\n\
             <p>Password: {password}\n\
             <p>Authenticate with: sf org login web --instance-url {url} --alias &lt;alias&gt;</p>",
            sender = self.sender,
            url = handle.login_url,
            user = handle.username,
            password = handle.password,
        )
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, recipient: &str, handle: &AllocatedHandle) -> Result<(), PoolError> {
        let payload = json!({
            "inputs": [{
                "emailBody": self.body(handle),
                "emailAddresses": recipient,
                "emailSubject": format!("{} created you a new Salesforce org", self.sender),
                "senderType": "CurrentUser"
            }]
        });
        let path = format!(
            "/services/data/v{}/actions/standard/emailSimple",
            self.api_version
        );
        self.remote.post(&path, &payload).await?;
        tracing::debug!(
            parent: self.log.span(),
            "sent email to {recipient} for {}",
            handle.username
        );
        Ok(())
    }
}
