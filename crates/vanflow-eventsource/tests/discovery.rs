//! Discovery of beaconing sources and staleness detection.

mod common;

use common::{container, wait_until};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vanflow_eventsource::{Client, ClientOptions, Discovery, DiscoveryHandlers, DiscoveryOptions, Info, SourceAddress, WatchConfig};
use vanflow_proto::{HeartbeatMessage, MessageProps, BEACON_ADDRESS};
use vanflow_session::{Container, MemoryBus};

struct Fixture {
    bus: MemoryBus,
    cancel: CancellationToken,
    discovery: Discovery,
    discovery_ctr: Container,
    peer: Container,
    discovered: mpsc::UnboundedReceiver<Info>,
    forgotten: mpsc::UnboundedReceiver<Info>,
}

async fn fixture() -> Fixture {
    let bus = MemoryBus::new();
    let cancel = CancellationToken::new();
    let discovery_ctr = container(&bus, "discovery", &cancel);
    let discovery = Discovery::new(discovery_ctr.clone(), DiscoveryOptions::default());

    let (discovered_tx, discovered) = mpsc::unbounded_channel();
    let (forgotten_tx, forgotten) = mpsc::unbounded_channel();
    let handlers = DiscoveryHandlers::default()
        .on_discovered(move |info| {
            let _ = discovered_tx.send(info);
        })
        .on_forgotten(move |info| {
            let _ = forgotten_tx.send(info);
        });
    {
        let discovery = discovery.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { discovery.run(&cancel, handlers).await });
    }
    wait_until("beacon receiver", || bus.receiver_count(BEACON_ADDRESS) == 1).await;

    let peer = container(&bus, "peer", &cancel);
    Fixture {
        bus,
        cancel,
        discovery,
        discovery_ctr,
        peer,
        discovered,
        forgotten,
    }
}

impl Fixture {
    async fn beacon(&self, info: &Info) {
        let sender = self.peer.new_sender(BEACON_ADDRESS);
        sender.send(&self.cancel, info.beacon().encode()).await.unwrap();
    }

    async fn heartbeat(&self, info: &Info) {
        let sender = self.peer.new_sender(info.address.clone());
        let msg = HeartbeatMessage {
            props: MessageProps {
                to: info.address.clone(),
                ..MessageProps::default()
            },
            identity: info.id.clone(),
            version: 1,
            now: 1,
        };
        sender.send(&self.cancel, msg.encode()).await.unwrap();
    }

    fn watch(&self, info: &Info, timeout: Duration) -> tokio::task::JoinHandle<()> {
        let client = Client::new(self.discovery_ctr.clone(), ClientOptions::new(info.clone()));
        client.listen(&self.cancel, SourceAddress::Primary).unwrap();
        let mut config = WatchConfig::new(client, info.id.clone());
        config.timeout = Some(timeout);
        config.grace_period = Duration::from_millis(50);
        config.discovery_update_interval = Duration::from_millis(10);
        self.discovery.new_watch_client(&self.cancel, config).unwrap()
    }
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Info>) -> Info {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for discovery event")
        .expect("event channel closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn beacons_discover_sources_once() {
    let mut fx = fixture().await;
    let a = Info::new("a", "ROUTER");
    let b = Info::new("b", "CONTROLLER");
    fx.beacon(&a).await;
    fx.beacon(&b).await;

    let mut events = vec![recv(&mut fx.discovered).await, recv(&mut fx.discovered).await];
    events.sort_by(|x, y| x.id.cmp(&y.id));
    assert_eq!(events[0].id, "a");
    assert_eq!(events[0].source_type, "ROUTER");
    assert_eq!(events[0].direct, "sfe.a");
    assert_eq!(events[1].id, "b");

    let first_seen = fx.discovery.get("a").unwrap().last_seen;
    tokio::time::sleep(Duration::from_millis(5)).await;
    fx.beacon(&a).await;
    let discovery = fx.discovery.clone();
    wait_until("last seen to advance", || {
        discovery.get("a").is_some_and(|info| info.last_seen > first_seen)
    })
    .await;
    assert!(fx.discovered.try_recv().is_err());

    assert!(!fx.discovery.forget("c"));
    assert!(fx.discovery.forget("a"));
    assert_eq!(recv(&mut fx.forgotten).await.id, "a");
    assert_eq!(fx.discovery.list().len(), 1);

    // A beacon after forgetting starts over.
    fx.beacon(&a).await;
    assert_eq!(recv(&mut fx.discovered).await.id, "a");
    fx.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quiet_source_is_forgotten_exactly_once() {
    let mut fx = fixture().await;
    let quiet = Info::new("quiet", "ROUTER");
    fx.beacon(&quiet).await;
    recv(&mut fx.discovered).await;

    let watch = fx.watch(&quiet, Duration::from_millis(100));
    let forgotten = recv(&mut fx.forgotten).await;
    assert_eq!(forgotten.id, "quiet");
    tokio::time::timeout(Duration::from_secs(1), watch)
        .await
        .expect("watch did not end")
        .unwrap();
    assert!(fx.discovery.get("quiet").is_none());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(fx.forgotten.try_recv().is_err());
    fx.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn active_source_is_kept() {
    let mut fx = fixture().await;
    let chatty = Info::new("chatty", "ROUTER");
    fx.beacon(&chatty).await;
    let discovered = recv(&mut fx.discovered).await;

    let watch = fx.watch(&chatty, Duration::from_millis(100));
    let address = chatty.address.clone();
    let bus = fx.bus.clone();
    wait_until("watch client to attach", || bus.receiver_count(&address) == 1).await;

    // Heartbeats well inside the timeout for several timeout periods.
    for _ in 0..20 {
        fx.heartbeat(&chatty).await;
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(fx.forgotten.try_recv().is_err());
    let known = fx.discovery.get("chatty").expect("active source was forgotten");
    assert!(known.last_seen > discovered.last_seen);

    // Silence ends the watch.
    assert_eq!(recv(&mut fx.forgotten).await.id, "chatty");
    tokio::time::timeout(Duration::from_secs(1), watch)
        .await
        .expect("watch did not end")
        .unwrap();
    fx.cancel.cancel();
}
