//! flowsentry - userspace packet inspection daemon
//!
//! Receives live traffic from the kernel's netfilter queue, tracks
//! per-connection sessions keyed by conntrack id, and runs an ordered
//! pipeline of inspection plugins against each packet. Plugins publish
//! classification results into a per-session dictionary and an
//! event-report stream, and release their subscriptions once a flow is
//! decided so traffic can bypass further inspection.

pub mod config;
pub mod core;
pub mod dict;
pub mod dispatch;
pub mod kernel;
pub mod plugins;
pub mod reports;
pub mod warehouse;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tracing::{info, warn};

use config::Config;
use dict::{InMemoryDictionary, NullDictionary, SessionDictionary};
use dispatch::Dispatch;
use plugins::classify::ClassifyPlugin;
use plugins::sni::SniPlugin;
use plugins::{Plugin, PluginContext};
use reports::{EventSink, TracingSink};

/// Budget for stopping all plugins at shutdown
const PLUGIN_SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

/// The assembled daemon: sinks, dispatch core, and plugins
///
/// `startup` builds everything in dependency order (sinks, then the
/// dispatch core, then plugins); `shutdown` tears it down in reverse.
pub struct Daemon {
    pub config: Config,
    pub dispatch: Arc<Dispatch>,
    pub dict: Arc<dyn SessionDictionary>,
    pub reports: Arc<dyn EventSink>,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Daemon {
    /// Construct services and start the configured plugins
    pub async fn startup(config: Config) -> Result<Self> {
        let dict: Arc<dyn SessionDictionary> = if config.general.disable_dict {
            Arc::new(NullDictionary)
        } else {
            InMemoryDictionary::new()
        };
        let reports: Arc<dyn EventSink> = TracingSink::new();

        let dispatch = Dispatch::startup(
            config.dispatch.settings(),
            Arc::clone(&dict),
            Arc::clone(&reports),
        );

        let ctx = PluginContext {
            dispatch: Arc::clone(&dispatch),
            dict: Arc::clone(&dict),
            reports: Arc::clone(&reports),
        };

        let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();
        if config.classify.enabled {
            plugins.push(ClassifyPlugin::new(ctx.clone(), config.classify.clone()));
        }
        if config.sni.enabled {
            plugins.push(SniPlugin::new(ctx.clone()));
        }

        info!("starting {} plugins", plugins.len());
        let mut startups = JoinSet::new();
        for plugin in &plugins {
            let plugin = Arc::clone(plugin);
            startups.spawn(async move {
                let name = plugin.name();
                (name, plugin.startup().await)
            });
        }
        while let Some(joined) = startups.join_next().await {
            if let Ok((name, Err(err))) = joined {
                warn!("plugin {} failed to start: {}", name, err);
            }
        }

        Ok(Self {
            config,
            dispatch,
            dict,
            reports,
            plugins,
        })
    }

    /// Stop plugins, then the dispatch core
    pub async fn shutdown(&self) {
        info!("stopping plugins");
        let mut shutdowns = JoinSet::new();
        for plugin in &self.plugins {
            let plugin = Arc::clone(plugin);
            shutdowns.spawn(async move { plugin.shutdown().await });
        }
        let drain = async {
            while shutdowns.join_next().await.is_some() {}
        };
        if tokio::time::timeout(PLUGIN_SHUTDOWN_WAIT, drain).await.is_err() {
            warn!("failed to properly shutdown plugins");
        }

        self.dispatch.shutdown().await;
        info!("daemon stopped; {} events reported", self.reports.events_logged());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_daemon_lifecycle() {
        let mut config = Config::default();
        // no external daemon in unit tests
        config.classify.enabled = false;
        config.general.disable_dict = true;

        let daemon = Daemon::startup(config).await.unwrap();
        assert_eq!(daemon.plugins.len(), 1);
        assert_eq!(daemon.dispatch.session_count(), 0);
        daemon.shutdown().await;
    }
}
