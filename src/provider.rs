//! Provider entity and the explicit per-operation context threaded through
//! C1/C3/C5 (spec §9: usage metadata must reach the pool at acquisition
//! time via an explicit value, never thread-local/ambient state).

use std::sync::Arc;

use crate::config::{ProviderConfig, ProviderPriority};

/// An immutable, config-loaded Usenet provider. Mutated only by reloading
/// configuration and constructing a fresh `Provider`/pool pair.
#[derive(Debug, Clone)]
pub struct Provider {
    pub name: Arc<str>,
    pub host: Arc<str>,
    pub port: u16,
    pub tls: bool,
    pub username: Option<Arc<str>>,
    pub password: Option<Arc<str>>,
    pub max_connections: usize,
    pub priority: ProviderPriority,
}

impl From<&ProviderConfig> for Provider {
    fn from(cfg: &ProviderConfig) -> Self {
        Provider {
            name: Arc::from(cfg.name.as_str()),
            host: Arc::from(cfg.host.as_str()),
            port: cfg.port,
            tls: cfg.tls,
            username: cfg.username.as_deref().map(Arc::from),
            password: cfg.password.as_deref().map(Arc::from),
            max_connections: cfg.max_connections,
            priority: cfg.priority,
        }
    }
}

/// Usage classification controlling reservation behaviour and limiter
/// membership (spec §3 "Connection usage context", glossary "Usage type").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageType {
    Streaming,
    Queue,
    HealthCheck,
    Repair,
    Analysis,
    Unknown,
}

impl UsageType {
    /// Background usage types must leave headroom for streaming (spec §4.1).
    pub fn is_background(self) -> bool {
        matches!(
            self,
            UsageType::Queue | UsageType::HealthCheck | UsageType::Repair
        )
    }
}

/// The explicit context carried on every pool acquisition and fetch,
/// replacing the source's thread-local/cancellation-side-table ambient
/// state (spec §9, first bullet).
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub usage: UsageType,
    pub job_name: Option<Arc<str>>,
    pub affinity_key: Option<Arc<str>>,
    pub item_id: Option<Arc<str>>,
    pub cancel: tokio_util::sync::CancellationToken,
}

impl OperationContext {
    pub fn new(usage: UsageType) -> Self {
        OperationContext {
            usage,
            job_name: None,
            affinity_key: None,
            item_id: None,
            cancel: tokio_util::sync::CancellationToken::new(),
        }
    }

    pub fn with_affinity_key(mut self, key: impl Into<Arc<str>>) -> Self {
        self.affinity_key = Some(key.into());
        self
    }

    pub fn with_job_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.job_name = Some(name.into());
        self
    }

    pub fn with_item_id(mut self, id: impl Into<Arc<str>>) -> Self {
        self.item_id = Some(id.into());
        self
    }

    /// Derive a linked child context: cancelling the child never cancels the
    /// parent, but cancelling the parent cancels every child (spec §5:
    /// "propagate through linked cancellations by carrying it on the derived
    /// scope explicitly").
    pub fn child(&self) -> Self {
        OperationContext {
            usage: self.usage,
            job_name: self.job_name.clone(),
            affinity_key: self.affinity_key.clone(),
            item_id: self.item_id.clone(),
            cancel: self.cancel.child_token(),
        }
    }
}
