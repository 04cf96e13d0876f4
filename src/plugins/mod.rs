//! Inspection plugins
//!
//! Plugins subscribe handlers to the dispatch core and enrich sessions
//! with classification results. Each plugin owns its startup/shutdown
//! lifecycle; the daemon shell runs them in parallel around the
//! dispatch core's own lifecycle.

pub mod classify;
pub mod sni;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::dict::SessionDictionary;
use crate::dispatch::Dispatch;
use crate::reports::EventSink;

/// Priorities for the bundled plugins. Lower runs earlier, so
/// classification results are in place before anything that consumes
/// them.
pub const SNI_PRIORITY: i32 = 1;
pub const CLASSIFY_PRIORITY: i32 = 2;

/// Shared handles a plugin needs to do its work
#[derive(Clone)]
pub struct PluginContext {
    pub dispatch: Arc<Dispatch>,
    pub dict: Arc<dyn SessionDictionary>,
    pub reports: Arc<dyn EventSink>,
}

/// One inspection plugin
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique plugin name; doubles as the subscription owner
    fn name(&self) -> &'static str;

    /// Register subscriptions and start any background tasks
    async fn startup(&self) -> Result<()>;

    /// Stop background tasks; must return within the daemon's
    /// shutdown budget
    async fn shutdown(&self);
}
