//! Polls restart counters and emits one event per newly observed restart.

use std::{collections::HashMap, sync::Arc, time::Duration};

use hub_process::{HubEvent, ProcessSnapshot};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};

use crate::{cache::SnapshotCache, config::ConfigStore};

const EVENT_CAPACITY: usize = 256;

/// Last restart count seen per project. A project with no entry has not been
/// observed yet.
#[derive(Debug, Default)]
pub struct Watermarks {
    seen: HashMap<String, u32>,
}

impl Watermarks {
    /// Folds one poll into the watermarks and returns the alerts it produced.
    ///
    /// The first sighting of a project only records its count. Afterwards a
    /// higher non-zero count alerts, a lower one re-baselines silently, and
    /// projects missing from `snapshots` keep their watermark.
    pub fn observe<'a>(
        &mut self,
        names: impl IntoIterator<Item = &'a str>,
        snapshots: &[ProcessSnapshot],
    ) -> Vec<HubEvent> {
        let mut alerts = Vec::new();
        for name in names {
            let Some(snap) = snapshots.iter().find(|s| s.name == name) else {
                continue;
            };
            let count = snap.restart_count;
            match self.seen.get_mut(name) {
                None => {
                    self.seen.insert(name.to_string(), count);
                }
                Some(mark) if count > *mark && count > 0 => {
                    *mark = count;
                    alerts.push(HubEvent::Restart {
                        name: name.to_string(),
                        restarts: count,
                    });
                }
                Some(mark) => {
                    *mark = count;
                }
            }
        }
        alerts
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.seen.get(name).copied()
    }
}

/// Fan-out channel for alerts. Subscribers only see events sent after they
/// subscribed; a subscriber that falls behind loses the overflow.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HubEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }
}

impl EventBus {
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, event: HubEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}

pub struct ChangeDetector {
    cache: Arc<SnapshotCache>,
    config: Arc<ConfigStore>,
    bus: EventBus,
    interval: Duration,
    marks: Watermarks,
}

impl ChangeDetector {
    pub fn new(
        cache: Arc<SnapshotCache>,
        config: Arc<ConfigStore>,
        bus: EventBus,
        interval: Duration,
    ) -> Self {
        Self {
            cache,
            config,
            bus,
            interval,
            marks: Watermarks::default(),
        }
    }

    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.tick().await;
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("change detector stopped");
        })
    }

    pub async fn tick(&mut self) -> usize {
        let config = match self.config.load().await {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(error = %err, "change detector could not read config");
                return 0;
            }
        };
        let list = self.cache.process_list().await;
        let alerts = self
            .marks
            .observe(config.projects.iter().map(|p| p.name.as_str()), &list);

        let emitted = alerts.len();
        for alert in alerts {
            if let HubEvent::Restart { name, restarts } = &alert {
                tracing::warn!(project = %name, restarts, "process restart detected");
            }
            self.bus.publish(alert);
        }
        emitted
    }
}

#[cfg(test)]
mod tests {
    use hub_process::Project;

    use super::*;
    use crate::{
        cache::CacheConfig,
        testing::{FakeOracle, FakeSampler, running},
    };

    fn poll(marks: &mut Watermarks, counts: &[u32]) -> Vec<Vec<HubEvent>> {
        counts
            .iter()
            .map(|c| marks.observe(["api"], &[running("api", 10, *c)]))
            .collect()
    }

    #[test]
    fn rising_count_alerts_once() {
        let mut marks = Watermarks::default();
        let out = poll(&mut marks, &[0, 0, 2]);
        assert!(out[0].is_empty());
        assert!(out[1].is_empty());
        assert_eq!(
            out[2],
            vec![HubEvent::Restart {
                name: "api".to_string(),
                restarts: 2
            }]
        );
    }

    #[test]
    fn steady_count_never_alerts() {
        let mut marks = Watermarks::default();
        let out = poll(&mut marks, &[2, 2, 2]);
        assert!(out.iter().all(Vec::is_empty));
        assert_eq!(marks.get("api"), Some(2));
    }

    #[test]
    fn falling_count_rebaselines() {
        let mut marks = Watermarks::default();
        let out = poll(&mut marks, &[3, 1]);
        assert!(out.iter().all(Vec::is_empty));
        assert_eq!(marks.get("api"), Some(1));

        let next = marks.observe(["api"], &[running("api", 10, 2)]);
        assert_eq!(next.len(), 1);
    }

    #[test]
    fn absent_project_is_skipped() {
        let mut marks = Watermarks::default();
        marks.observe(["api"], &[running("api", 10, 1)]);
        assert!(marks.observe(["api"], &[]).is_empty());
        assert_eq!(marks.get("api"), Some(1));
        assert_eq!(marks.get("web"), None);
        assert!(marks.observe(["web"], &[]).is_empty());
        assert_eq!(marks.get("web"), None);
    }

    #[test]
    fn unconfigured_processes_are_ignored() {
        let mut marks = Watermarks::default();
        let snaps = [running("stray", 1, 0)];
        marks.observe(["api"], &snaps);
        assert_eq!(marks.get("stray"), None);
    }

    #[tokio::test]
    async fn bus_delivers_to_every_subscriber_without_replay() {
        let bus = EventBus::default();
        assert_eq!(
            bus.publish(HubEvent::Restart {
                name: "early".to_string(),
                restarts: 1
            }),
            0
        );

        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        let ev = HubEvent::Restart {
            name: "api".to_string(),
            restarts: 4,
        };
        assert_eq!(bus.publish(ev.clone()), 2);
        assert_eq!(a.recv().await.unwrap(), ev);
        assert_eq!(b.recv().await.unwrap(), ev);
        assert!(a.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn tick_reads_through_cache_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigStore::new(dir.path().join("projects.json")));
        config
            .add_project(Project {
                name: "api".to_string(),
                path: "/srv/api".to_string(),
                command: "node server.js".to_string(),
                port: None,
                domain: None,
                tunnel: false,
                max_cpu: None,
                max_memory: None,
                enabled: true,
            })
            .await
            .unwrap();

        let oracle = Arc::new(FakeOracle::with_list(vec![running("api", 10, 0)]));
        let cache = Arc::new(SnapshotCache::new(
            oracle.clone(),
            Arc::new(FakeSampler::default()),
            CacheConfig::default(),
        ));
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let mut detector =
            ChangeDetector::new(cache.clone(), config, bus, Duration::from_secs(5));

        assert_eq!(detector.tick().await, 0);
        oracle.set_list(vec![running("api", 11, 1)]);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(detector.tick().await, 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            HubEvent::Restart {
                name: "api".to_string(),
                restarts: 1
            }
        );
    }
}
