//! Services without a document or version.

use async_trait::async_trait;
use docket_core::{Action, ServiceCapabilities, ServiceOptions};

use super::host::ServiceHost;
use super::operation::{Operation, OperationResult};

/// A service that handles operations directly, without a document.
///
/// Operations run concurrently; there is no per-path queue. DISCOVER is
/// answered by the host from [`capabilities`](StatelessService::capabilities).
#[async_trait]
pub trait StatelessService: Send + Sync + 'static {
    fn options(&self) -> ServiceOptions {
        ServiceOptions::empty()
    }

    fn capabilities(&self, self_link: &str) -> ServiceCapabilities {
        ServiceCapabilities {
            document_self_link: self_link.to_string(),
            document_kind: None,
            options: self.options().names(),
            actions: Action::ALL.to_vec(),
            description: None,
        }
    }

    async fn handle(&self, host: &ServiceHost, op: Operation) -> OperationResult;
}
