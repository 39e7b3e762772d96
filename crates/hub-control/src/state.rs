use std::sync::Arc;

use hub_agent::{
    CacheConfig, ConfigStore, EventBus, Hub, HubResult, Pm2Oracle, PsSampler, SnapshotCache,
    TunnelConfig, TunnelManager,
};
use tokio::sync::watch;

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub events: EventBus,
    /// Flips to `true` once; background loops and open event streams end.
    pub shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn new(hub: Hub, events: EventBus) -> Self {
        let (shutdown, _rx) = watch::channel(false);
        Self {
            hub,
            events,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Wires the pm2 oracle, `ps` sampler and ngrok tunnels from the environment.
    pub fn from_env() -> HubResult<Self> {
        let config = Arc::new(ConfigStore::from_env());
        let cache = Arc::new(SnapshotCache::new(
            Arc::new(Pm2Oracle::default()),
            Arc::new(PsSampler::default()),
            CacheConfig::from_env(),
        ));
        let tunnels = TunnelManager::new(TunnelConfig::from_env()?);
        Ok(Self::new(Hub::new(config, cache, tunnels), EventBus::default()))
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}
