//! Client dispatch, close and flush behaviour against a memory bus.

mod common;

use common::{container, wait_until};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vanflow_core::RouterRecord;
use vanflow_eventsource::{flush_on_first_message, Client, ClientOptions, Info, SourceAddress};
use vanflow_proto::{DecodedMessage, HeartbeatMessage, Message, MessageProps, Properties, RecordMessage};
use vanflow_session::{Container, MemoryBus, Sender};

struct Fixture {
    bus: MemoryBus,
    cancel: CancellationToken,
    source: Info,
    client: Client,
    peer: Container,
}

fn fixture(id: &str) -> Fixture {
    let bus = MemoryBus::new();
    let cancel = CancellationToken::new();
    let source = Info::new(id, "ROUTER");
    let client = Client::new(container(&bus, "client", &cancel), ClientOptions::new(source.clone()));
    let peer = container(&bus, "peer", &cancel);
    Fixture {
        bus,
        cancel,
        source,
        client,
        peer,
    }
}

fn heartbeat(source: &Info, now: u64) -> HeartbeatMessage {
    HeartbeatMessage {
        props: MessageProps {
            to: source.address.clone(),
            subject: "HEARTBEAT".into(),
            ..MessageProps::default()
        },
        identity: source.id.clone(),
        version: 1,
        now,
    }
}

async fn send(sender: &Sender, cancel: &CancellationToken, msg: Message) {
    sender.send(cancel, msg).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispatches_heartbeats_and_records() {
    let fx = fixture("dispatch");
    let (heartbeats_tx, mut heartbeats) = mpsc::unbounded_channel();
    let (records_tx, mut records) = mpsc::unbounded_channel();
    fx.client.on_heartbeat(move |msg| {
        let _ = heartbeats_tx.send(msg.clone());
    });
    fx.client.on_record(move |msg| {
        let _ = records_tx.send(msg.clone());
    });
    fx.client.listen(&fx.cancel, SourceAddress::Primary).unwrap();
    let address = fx.source.address.clone();
    let bus = fx.bus.clone();
    wait_until("client to attach", || bus.receiver_count(&address) == 1).await;

    let sender = fx.peer.new_sender(fx.source.address.clone());
    for now in 0..5 {
        send(&sender, &fx.cancel, heartbeat(&fx.source, now).encode()).await;
        let got = tokio::time::timeout(Duration::from_secs(5), heartbeats.recv()).await.unwrap().unwrap();
        assert_eq!(got, heartbeat(&fx.source, now));
    }

    // Malformed messages are skipped without ending the loop.
    let bogus = Message {
        properties: Some(Properties {
            to: Some(fx.source.address.clone()),
            subject: Some("BOGUS".into()),
            reply_to: None,
        }),
        ..Message::default()
    };
    send(&sender, &fx.cancel, bogus).await;

    let mut record = RecordMessage::new(fx.source.address.clone(), Vec::new());
    record.props.subject = "RECORD".into();
    for i in 0..3 {
        send(&sender, &fx.cancel, record.encode().unwrap()).await;
        let got = tokio::time::timeout(Duration::from_secs(5), records.recv()).await.unwrap().unwrap();
        assert_eq!(got, record);
        record.records.push(Arc::new(RouterRecord::new(format!("router-{i}"))));
    }

    tokio::time::timeout(Duration::from_secs(1), fx.client.close())
        .await
        .expect("close did not return promptly");
    fx.client.close().await;

    send(&sender, &fx.cancel, record.encode().unwrap()).await;
    let late = tokio::time::timeout(Duration::from_millis(100), records.recv()).await;
    assert!(!matches!(late, Ok(Some(_))), "client handled a record after close");
    fx.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_flush_reaches_direct_address() {
    let fx = fixture("flush");
    let receiver = fx.peer.new_receiver(fx.source.direct.clone(), 8);

    fx.client.send_flush(&fx.cancel).await.unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(5), receiver.next(&fx.cancel))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(vanflow_proto::decode(&msg), Ok(DecodedMessage::Flush(_))));
    fx.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flush_on_first_message_sends_exactly_one_flush() {
    let fx = fixture("first-message");
    let receiver = fx.peer.new_receiver(fx.source.direct.clone(), 8);
    fx.client.listen(&fx.cancel, SourceAddress::Primary).unwrap();
    let address = fx.source.address.clone();
    let bus = fx.bus.clone();
    wait_until("client to attach", || bus.receiver_count(&address) == 1).await;

    let heartbeats = {
        let sender = fx.peer.new_sender(fx.source.address.clone());
        let source = fx.source.clone();
        let cancel = fx.cancel.clone();
        tokio::spawn(async move {
            let mut now = 0;
            while !cancel.is_cancelled() {
                let _ = sender.send(&cancel, heartbeat(&source, now).encode()).await;
                now += 1;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    let op = CancellationToken::new();
    tokio::time::timeout(Duration::from_secs(5), flush_on_first_message(&op, &fx.client))
        .await
        .unwrap()
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(5), receiver.next(&fx.cancel))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(vanflow_proto::decode(&msg), Ok(DecodedMessage::Flush(_))));

    let second = tokio::time::timeout(Duration::from_millis(100), receiver.next(&fx.cancel)).await;
    assert!(second.is_err(), "expected a single flush request");

    fx.cancel.cancel();
    heartbeats.await.unwrap();
}
