use cluster_core::Operation;
use tracing::Span;
use uuid::Uuid;

/// Caller identity and correlation data passed explicitly to every operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub user_agent: Option<String>,
    pub org_name: Option<String>,
    pub user_name: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            user_agent: None,
            org_name: None,
            user_name: None,
        }
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_org(mut self, org_name: impl Into<String>) -> Self {
        self.org_name = Some(org_name.into());
        self
    }

    pub fn with_user(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = Some(user_name.into());
        self
    }

    /// Span the detached operation worker runs in.
    pub fn operation_span(&self, operation: Operation, cluster_id: &str) -> Span {
        tracing::info_span!(
            "cluster_operation",
            request_id = %self.request_id,
            operation = %operation,
            cluster_id = %cluster_id,
            user = self.user_name.as_deref().unwrap_or("-"),
        )
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
