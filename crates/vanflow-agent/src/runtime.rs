//! Agent runtime orchestration.

use crate::config::AgentConfig;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use vanflow_core::{ControllerRecord, Record, RecordRef, SiteRecord, Time};
use vanflow_eventsource::{
    flush_on_first_message, Client, ClientError, ClientOptions, Discovery, DiscoveryHandlers,
    DiscoveryOptions, Info, Manager, ManagerConfig, SourceAddress, WatchConfig,
};
use vanflow_session::{Container, ContainerConfig, MqttConnector, MqttConnectorConfig};
use vanflow_store::{MemoryStore, SourceRef, Store};

/// How long a newly discovered source gets to send something before the
/// collector requests a flush anyway.
const FIRST_MESSAGE_WAIT: Duration = Duration::from_secs(5);

/// The main agent runtime.
pub struct Agent {
    config: AgentConfig,
    container: Container,
}

impl Agent {
    /// Create a new agent.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let connector = MqttConnector::new(MqttConnectorConfig {
            broker: config.broker.clone(),
            client_prefix: format!("vanflow-{}", config.source_id),
            ..MqttConnectorConfig::default()
        })
        .context("Invalid VANFLOW_BROKER")?;
        let container = Container::new(
            Arc::new(connector),
            ContainerConfig {
                container_id: format!("vanflow-agent-{}", config.source_id),
                ..ContainerConfig::default()
            },
        );
        Ok(Self { config, container })
    }

    /// Run until Ctrl-C or until every agent loop has ended.
    ///
    /// # Errors
    ///
    /// Returns error if the shutdown signal cannot be installed.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Starting agent runtime");

        let cancel = CancellationToken::new();
        self.container.on_session_error(|err| match err.retry_in() {
            Some(retry_in) => tracing::warn!(error = %err, ?retry_in, "Session lost, reconnecting"),
            None => tracing::error!(error = %err, "Container stopped"),
        });
        let supervisor = self.container.start(cancel.clone());

        let tracker = TaskTracker::new();
        let manager = Manager::new(self.container.clone(), self.manager_config());
        {
            let cancel = cancel.clone();
            tracker.spawn(async move {
                if let Err(err) = manager.run(&cancel).await {
                    tracing::error!(error = %err, "Manager failed");
                }
            });
        }

        if self.config.collect {
            let collector = Collector::new(
                self.container.clone(),
                self.config.source_id.clone(),
                self.config.watch_timeout,
            );
            let cancel = cancel.clone();
            tracker.spawn(
                async move { collector.run(&cancel).await }
                    .instrument(tracing::info_span!("collector")),
            );
        }
        tracker.close();

        tracing::info!("Agent running, press Ctrl+C to stop");
        let signal = tokio::select! {
            signal = tokio::signal::ctrl_c() => Some(signal),
            () = tracker.wait() => None,
        };

        cancel.cancel();
        tracker.wait().await;
        if let Err(err) = supervisor.await {
            tracing::warn!(error = %err, "Container supervisor panicked");
        }

        match signal {
            Some(signal) => {
                signal.context("Failed to listen for shutdown signal")?;
                tracing::info!("Agent stopped after shutdown signal");
            }
            None => tracing::warn!("Agent loops ended without a shutdown signal"),
        }
        Ok(())
    }

    fn manager_config(&self) -> ManagerConfig {
        let source = Info::new(self.config.source_id.clone(), self.config.source_type.clone());
        let store = MemoryStore::from_records(
            local_records(&self.config),
            &SourceRef::new(self.config.source_id.clone()),
        );
        ManagerConfig {
            source,
            stores: vec![Arc::new(store)],
            heartbeat_interval: self.config.heartbeat_interval,
            beacon_interval: self.config.beacon_interval,
            flush_batch_size: self.config.flush_batch_size,
            ..ManagerConfig::default()
        }
    }
}

/// The controller and site records describing the agent itself.
fn local_records(config: &AgentConfig) -> Vec<RecordRef> {
    let started = Time::now();
    let site_id = config.site_id();

    let mut site = SiteRecord::new(site_id.clone());
    site.base.start_time = started;
    site.name.clone_from(&config.site_name);

    let mut controller = ControllerRecord::new(config.source_id.clone());
    controller.base.start_time = started;
    controller.parent = Some(site_id);
    controller.hostname = std::env::var("HOSTNAME").ok();
    controller.name.clone_from(&config.site_name);
    controller.build_version = Some(env!("CARGO_PKG_VERSION").to_string());

    vec![Arc::new(site), Arc::new(controller)]
}

enum SourceEvent {
    Discovered(Info),
    Forgotten(Info),
}

/// Discovers remote sources and merges their records into a local store.
struct Collector {
    container: Container,
    discovery: Discovery,
    store: Arc<MemoryStore>,
    own_id: String,
    watch_timeout: Duration,
}

impl Collector {
    fn new(container: Container, own_id: String, watch_timeout: Duration) -> Self {
        Self {
            discovery: Discovery::new(container.clone(), DiscoveryOptions::default()),
            container,
            store: Arc::new(MemoryStore::new()),
            own_id,
            watch_timeout,
        }
    }

    async fn run(self, cancel: &CancellationToken) {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let handlers = DiscoveryHandlers::default()
            .on_discovered({
                let events_tx = events_tx.clone();
                move |info| {
                    let _ = events_tx.send(SourceEvent::Discovered(info));
                }
            })
            .on_forgotten(move |info| {
                let _ = events_tx.send(SourceEvent::Forgotten(info));
            });

        let discovery = {
            let discovery = self.discovery.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { discovery.run(&cancel, handlers).await })
        };

        let flushes = TaskTracker::new();
        let mut clients: HashMap<String, Client> = HashMap::new();
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(SourceEvent::Discovered(info)) => {
                    if info.id == self.own_id {
                        continue;
                    }
                    match self.watch(cancel, &info) {
                        Ok(client) => {
                            tracing::info!(source = %info.id, source_type = %info.source_type, "Source discovered");
                            flushes.spawn(request_flush(cancel.clone(), client.clone()));
                            if let Some(stale) = clients.insert(info.id.clone(), client) {
                                stale.close().await;
                            }
                        }
                        Err(err) => tracing::warn!(source = %info.id, error = %err, "Failed to watch source"),
                    }
                }
                Some(SourceEvent::Forgotten(info)) => {
                    if let Some(client) = clients.remove(&info.id) {
                        client.close().await;
                    }
                    let removed = self.forget_records(&info.id);
                    tracing::info!(source = %info.id, removed, "Source forgotten");
                }
                None => break,
            }
        }

        match discovery.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(error = %err, "Discovery failed"),
            Err(err) => tracing::error!(error = %err, "Discovery task panicked"),
        }
        for client in clients.into_values() {
            client.close().await;
        }
        flushes.close();
        flushes.wait().await;
        tracing::info!(records = self.store.len(), "Collector stopped");
    }

    /// Listen to `info` and merge its records until the watch forgets it.
    fn watch(&self, cancel: &CancellationToken, info: &Info) -> Result<Client> {
        let client = Client::new(self.container.clone(), ClientOptions::new(info.clone()));

        let store = Arc::clone(&self.store);
        let origin = SourceRef::new(info.id.clone());
        client.on_record(move |msg| {
            for record in &msg.records {
                match store.patch(Arc::clone(record), origin.clone()) {
                    Ok(true) => tracing::debug!(source = %origin.id, record = %record.identity(), "Record merged"),
                    Ok(false) => {}
                    Err(err) => tracing::warn!(source = %origin.id, error = %err, "Failed to merge record"),
                }
            }
        });
        client.on_heartbeat(|heartbeat| {
            tracing::trace!(source = %heartbeat.identity, now = heartbeat.now, "Heartbeat");
        });

        // The watch owns the client from here on and closes it when it ends.
        let mut config = WatchConfig::new(client.clone(), info.id.clone());
        config.timeout = Some(self.watch_timeout);
        config.grace_period = FIRST_MESSAGE_WAIT;
        self.discovery
            .new_watch_client(cancel, config)
            .context("Failed to start watch")?;

        client.listen(cancel, SourceAddress::Primary)?;
        client.listen(cancel, SourceAddress::Heartbeats)?;
        Ok(client)
    }

    fn forget_records(&self, id: &str) -> usize {
        self.store
            .list()
            .into_iter()
            .filter(|entry| entry.metadata.source.id == id)
            .filter_map(|entry| self.store.delete(entry.record.identity()))
            .count()
    }
}

/// Request a flush once the source is heard from, or after
/// [`FIRST_MESSAGE_WAIT`] if it stays quiet.
async fn request_flush(cancel: CancellationToken, client: Client) {
    let op = cancel.child_token();
    let deadline = {
        let op = op.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = op.cancelled() => {}
                () = tokio::time::sleep(FIRST_MESSAGE_WAIT) => op.cancel(),
            }
        })
    };
    let result = flush_on_first_message(&op, &client).await;
    op.cancel();
    let _ = deadline.await;

    match result {
        Ok(()) => {}
        Err(ClientError::Timeout(id)) if !cancel.is_cancelled() && !client.is_closed() => {
            tracing::debug!(source = %id, "Source quiet, requesting flush");
            if let Err(err) = client.send_flush(&cancel).await {
                tracing::warn!(source = %id, error = %err, "Flush request failed");
            }
        }
        Err(err) => tracing::debug!(source = %client.source().id, error = %err, "Flush not requested"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_records() {
        let config = AgentConfig {
            source_id: "agent-1".to_string(),
            site_name: Some("east".to_string()),
            ..AgentConfig::default()
        };
        let records = local_records(&config);
        assert_eq!(records.len(), 2);

        let site = records[0].downcast_ref::<SiteRecord>().unwrap();
        assert_eq!(site.base.id, "agent-1-site");
        assert_eq!(site.name.as_deref(), Some("east"));
        assert!(site.base.start_time.is_set());

        let controller = records[1].downcast_ref::<ControllerRecord>().unwrap();
        assert_eq!(controller.identity(), "agent-1");
        assert_eq!(controller.parent.as_deref(), Some("agent-1-site"));
        assert!(controller.build_version.is_some());
    }

    #[test]
    fn test_invalid_broker() {
        let config = AgentConfig {
            broker: "http://broker".to_string(),
            ..AgentConfig::default()
        };
        assert!(Agent::new(config).is_err());
    }
}
