//! Send/receive dispatch by message type against the in-memory broker

use std::time::Duration;

use bytes::Bytes;
use conduit_broker::{Broker, BrokeredMessage, Source};
use conduit_broker_memory::{DEAD_LETTER_REASON_PROPERTY, MemoryBroker, Operation};
use conduit_bus::{Bus, Error, TypeNameSerializer, handler_fn, headers};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct AccountOpened {
    account: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct AccountClosed {
    account: String,
}

#[derive(Debug, PartialEq)]
enum Event {
    Opened(String),
    Closed(String),
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}

async fn wait_for_dead_letters(broker: &MemoryBroker, queue: &str, count: usize) -> Vec<BrokeredMessage> {
    let source = Source::Queue(queue.to_string());
    timeout(Duration::from_secs(5), async {
        loop {
            let dead = broker.dead_letters(&source);
            if dead.len() >= count {
                return dead;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for dead letters")
}

async fn receive_accounts(bus: &Bus<MemoryBroker>, queue: &str) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = tx.clone();

    bus.receive_with(queue, move |handlers| {
        handlers
            .add::<AccountOpened, _>(handler_fn(move |event: AccountOpened| {
                let _ = tx.send(Event::Opened(event.account));
                async { Ok::<_, std::io::Error>(()) }
            }))?
            .add::<AccountClosed, _>(handler_fn(move |event: AccountClosed| {
                let _ = closed.send(Event::Closed(event.account));
                async { Ok::<_, std::io::Error>(()) }
            }))?;
        Ok(())
    })
    .await
    .unwrap();

    rx
}

#[tokio::test]
async fn test_messages_are_dispatched_by_type() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let broker = MemoryBroker::default();
    let bus = Bus::new(broker.clone());
    let mut events = receive_accounts(&bus, "accounts").await;

    bus.send(
        "accounts",
        &AccountOpened {
            account: "a-1".into(),
        },
    )
    .await
    .unwrap();
    bus.send(
        "accounts",
        &AccountClosed {
            account: "a-1".into(),
        },
    )
    .await
    .unwrap();

    assert_eq!(next(&mut events).await, Event::Opened("a-1".into()));
    assert_eq!(next(&mut events).await, Event::Closed("a-1".into()));

    let types: Vec<String> = broker
        .journal()
        .operations()
        .into_iter()
        .filter_map(|operation| match operation {
            Operation::Sent { message, .. } => message.property_str(headers::MESSAGE_TYPE),
            _ => None,
        })
        .collect();
    assert_eq!(
        types,
        vec![
            TypeNameSerializer::serialize::<AccountOpened>().unwrap(),
            TypeNameSerializer::serialize::<AccountClosed>().unwrap(),
        ]
    );
}

#[tokio::test]
async fn test_single_type_receive() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let bus = Bus::new(MemoryBroker::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.receive::<AccountOpened, _>(
        "opened",
        handler_fn(move |event: AccountOpened| {
            let _ = tx.send(Event::Opened(event.account));
            async { Ok::<_, std::io::Error>(()) }
        }),
    )
    .await
    .unwrap();

    bus.send(
        "opened",
        &AccountOpened {
            account: "b-2".into(),
        },
    )
    .await
    .unwrap();

    assert_eq!(next(&mut rx).await, Event::Opened("b-2".into()));
}

#[tokio::test]
async fn test_unknown_and_untyped_messages_are_dead_lettered() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let broker = MemoryBroker::default();
    let bus = Bus::new(broker.clone());
    let mut events = receive_accounts(&bus, "accounts").await;

    broker
        .send(
            "accounts",
            BrokeredMessage::new(Bytes::from_static(b"{}"))
                .with_property(headers::MESSAGE_TYPE, "somebody.else.Message"),
        )
        .await
        .unwrap();
    broker
        .send("accounts", BrokeredMessage::new(Bytes::from_static(b"{}")))
        .await
        .unwrap();
    bus.send(
        "accounts",
        &AccountOpened {
            account: "c-3".into(),
        },
    )
    .await
    .unwrap();

    assert_eq!(next(&mut events).await, Event::Opened("c-3".into()));

    let dead = wait_for_dead_letters(&broker, "accounts", 2).await;
    assert_eq!(dead.len(), 2);
    assert!(
        dead[0]
            .property_str(DEAD_LETTER_REASON_PROPERTY)
            .unwrap()
            .contains("somebody.else.Message")
    );
    assert!(dead[1].property_str(DEAD_LETTER_REASON_PROPERTY).is_some());
}

#[tokio::test]
async fn test_undecodable_body_is_dead_lettered() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let broker = MemoryBroker::default();
    let bus = Bus::new(broker.clone());
    let _events = receive_accounts(&bus, "accounts").await;

    broker
        .send(
            "accounts",
            BrokeredMessage::new(Bytes::from_static(b"[1, 2, 3]")).with_property(
                headers::MESSAGE_TYPE,
                TypeNameSerializer::serialize::<AccountOpened>().unwrap(),
            ),
        )
        .await
        .unwrap();

    let dead = wait_for_dead_letters(&broker, "accounts", 1).await;
    assert_eq!(dead[0].body, "[1, 2, 3]");
}

#[tokio::test]
async fn test_failed_handler_abandons() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let broker = MemoryBroker::default();
    let bus = Bus::new(broker.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.receive::<AccountClosed, _>(
        "closed",
        handler_fn(move |event: AccountClosed| {
            let _ = tx.send(Event::Closed(event.account));
            async { Err::<(), _>(std::io::Error::other("ledger locked")) }
        }),
    )
    .await
    .unwrap();

    bus.send(
        "closed",
        &AccountClosed {
            account: "d-4".into(),
        },
    )
    .await
    .unwrap();

    assert_eq!(next(&mut rx).await, Event::Closed("d-4".into()));
    assert_eq!(next(&mut rx).await, Event::Closed("d-4".into()));

    let abandons = broker
        .journal()
        .operations()
        .into_iter()
        .filter(|operation| matches!(operation, Operation::Abandoned { .. }))
        .count();
    assert!(abandons >= 1);
}

#[tokio::test]
async fn test_duplicate_handler_is_rejected() {
    let bus = Bus::new(MemoryBroker::default());

    let result = bus
        .receive_with("twice", |handlers| {
            handlers.add::<AccountOpened, _>(handler_fn(|_: AccountOpened| async {
                Ok::<_, std::io::Error>(())
            }))?;
            handlers.add::<AccountOpened, _>(handler_fn(|_: AccountOpened| async {
                Ok::<_, std::io::Error>(())
            }))?;
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(Error::DuplicateHandler(name)) if name.ends_with("AccountOpened")));
}
