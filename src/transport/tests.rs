use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tungstenite::http::StatusCode;

use super::serve;
use crate::broker::{Broker, Envelope};
use crate::client::{Publisher, Subscriber};
use crate::config::BrokerSettings;
use crate::utils::{RelayError, Result};

async fn start_relay(settings: BrokerSettings) -> (String, Arc<Broker>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let broker = Arc::new(Broker::new(&settings));
    tokio::spawn(serve(listener, broker.clone(), settings));
    (format!("ws://{addr}"), broker)
}

async fn wait_for_subscribers(broker: &Broker, topic: &str, expected: usize) {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(t) = broker.topic(topic) {
                if t.subscriber_count().await.expect("topic running") == expected {
                    return;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("topic '{topic}' never reached {expected} subscribers"));
}

async fn next(sub: &mut Subscriber) -> Envelope {
    timeout(Duration::from_secs(5), sub.next_envelope())
        .await
        .expect("timed out waiting for an envelope")
        .expect("connection closed")
        .expect("valid envelope")
}

fn rejected_status<T>(result: Result<T>) -> StatusCode {
    match result {
        Ok(_) => panic!("upgrade unexpectedly accepted"),
        Err(RelayError::Transport(tungstenite::Error::Http(response))) => response.status(),
        Err(other) => panic!("expected an HTTP rejection, got {other}"),
    }
}

#[tokio::test]
async fn test_publish_to_unknown_topic_rejected_until_subscribed() {
    let (url, broker) = start_relay(BrokerSettings::default()).await;

    let status = rejected_status(Publisher::connect(&url, "x").await);
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut sub = Subscriber::connect(&url, ["x"]).await.unwrap();
    wait_for_subscribers(&broker, "x", 1).await;

    let mut publisher = Publisher::connect(&url, "x").await.unwrap();
    publisher.publish("now it exists").await.unwrap();

    assert_eq!(next(&mut sub).await, Envelope::publish("x", "now it exists"));
}

#[tokio::test]
async fn test_subscribe_without_topic_rejected() {
    let (url, _broker) = start_relay(BrokerSettings::default()).await;

    let none: [&str; 0] = [];
    assert_eq!(
        rejected_status(Subscriber::connect(&url, none).await),
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        rejected_status(Subscriber::connect(&url, ["", "  "]).await),
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn test_unknown_path_not_found() {
    let (url, _broker) = start_relay(BrokerSettings::default()).await;

    match connect_async(format!("{url}/elsewhere?topic=a")).await {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::NOT_FOUND)
        }
        Err(other) => panic!("expected an HTTP rejection, got {other}"),
        Ok(_) => panic!("upgrade unexpectedly accepted"),
    }
}

#[tokio::test]
async fn test_news_and_sports_scenario() {
    let (url, broker) = start_relay(BrokerSettings::default()).await;

    let mut sub = Subscriber::connect(&url, ["news", "sports"]).await.unwrap();
    wait_for_subscribers(&broker, "news", 1).await;
    wait_for_subscribers(&broker, "sports", 1).await;

    let mut publisher = Publisher::connect(&url, "news").await.unwrap();
    publisher.publish("hello").await.unwrap();

    assert_eq!(next(&mut sub).await, Envelope::publish("news", "hello"));
    let extra = timeout(Duration::from_millis(300), sub.next_envelope()).await;
    assert!(extra.is_err(), "unexpected extra delivery: {:?}", extra.ok());
}

#[tokio::test]
async fn test_single_publisher_order_preserved() {
    let (url, broker) = start_relay(BrokerSettings::default()).await;

    let mut sub = Subscriber::connect(&url, ["x"]).await.unwrap();
    wait_for_subscribers(&broker, "x", 1).await;

    let mut publisher = Publisher::connect(&url, "x").await.unwrap();
    for i in 0..50 {
        publisher.publish(format!("m{i}")).await.unwrap();
    }

    for i in 0..50 {
        assert_eq!(next(&mut sub).await, Envelope::publish("x", format!("m{i}")));
    }
}

#[tokio::test]
async fn test_bad_frames_do_not_close_publisher() {
    let (url, broker) = start_relay(BrokerSettings::default()).await;

    let mut sub = Subscriber::connect(&url, ["x"]).await.unwrap();
    wait_for_subscribers(&broker, "x", 1).await;

    let mut publisher = Publisher::connect(&url, "x").await.unwrap();
    publisher.send_raw("not an envelope").await.unwrap();
    publisher.send(&Envelope::subscribe("x")).await.unwrap();
    publisher.send(&Envelope::publish("nobody-here", "lost")).await.unwrap();
    publisher.publish("still alive").await.unwrap();

    assert_eq!(next(&mut sub).await, Envelope::publish("x", "still alive"));
    assert_eq!(broker.topic_names(), ["x"]);
}

#[tokio::test]
async fn test_publisher_may_route_to_other_existing_topic() {
    let (url, broker) = start_relay(BrokerSettings::default()).await;

    let mut sub = Subscriber::connect(&url, ["a", "b"]).await.unwrap();
    wait_for_subscribers(&broker, "a", 1).await;
    wait_for_subscribers(&broker, "b", 1).await;

    let mut publisher = Publisher::connect(&url, "a").await.unwrap();
    publisher.send(&Envelope::publish("b", "to b")).await.unwrap();

    assert_eq!(next(&mut sub).await, Envelope::publish("b", "to b"));
}

#[tokio::test]
async fn test_subscriber_disconnect_unregisters_but_topic_remains() {
    let (url, broker) = start_relay(BrokerSettings::default()).await;

    let sub = Subscriber::connect(&url, ["news", "sports"]).await.unwrap();
    wait_for_subscribers(&broker, "news", 1).await;
    wait_for_subscribers(&broker, "sports", 1).await;

    sub.close().await.unwrap();

    wait_for_subscribers(&broker, "news", 0).await;
    wait_for_subscribers(&broker, "sports", 0).await;
    assert_eq!(broker.topic_names(), ["news", "sports"]);
}

#[tokio::test]
async fn test_subscriber_changes_topics_at_runtime() {
    let (url, broker) = start_relay(BrokerSettings::default()).await;

    let mut sub = Subscriber::connect(&url, ["a"]).await.unwrap();
    wait_for_subscribers(&broker, "a", 1).await;

    sub.subscribe("b").await.unwrap();
    wait_for_subscribers(&broker, "b", 1).await;
    sub.unsubscribe("a").await.unwrap();
    wait_for_subscribers(&broker, "a", 0).await;

    let mut publisher = Publisher::connect(&url, "b").await.unwrap();
    publisher.publish("via runtime subscribe").await.unwrap();
    assert_eq!(next(&mut sub).await, Envelope::publish("b", "via runtime subscribe"));
}

#[tokio::test]
async fn test_publish_from_subscriber_connection_rejected() {
    let (url, broker) = start_relay(BrokerSettings::default()).await;

    let mut reader = Subscriber::connect(&url, ["a"]).await.unwrap();
    let mut sneaky = Subscriber::connect(&url, ["a"]).await.unwrap();
    wait_for_subscribers(&broker, "a", 2).await;

    sneaky.send(&Envelope::publish("a", "not from a publisher")).await.unwrap();
    // the rejected frame is handled before this one, on the same connection
    sneaky.subscribe("b").await.unwrap();
    wait_for_subscribers(&broker, "b", 1).await;

    let mut publisher = Publisher::connect(&url, "a").await.unwrap();
    publisher.publish("real").await.unwrap();

    assert_eq!(next(&mut reader).await, Envelope::publish("a", "real"));
    assert_eq!(next(&mut sneaky).await, Envelope::publish("a", "real"));
    let extra = timeout(Duration::from_millis(300), reader.next_envelope()).await;
    assert!(extra.is_err(), "unexpected extra delivery: {:?}", extra.ok());
}

#[tokio::test]
async fn test_connection_limit_rejects_with_503() {
    let settings = BrokerSettings {
        max_connections: 1,
        ..BrokerSettings::default()
    };
    let (url, broker) = start_relay(settings).await;

    let _first = Subscriber::connect(&url, ["only"]).await.unwrap();
    wait_for_subscribers(&broker, "only", 1).await;

    assert_eq!(
        rejected_status(Subscriber::connect(&url, ["only"]).await),
        StatusCode::SERVICE_UNAVAILABLE
    );
}

#[tokio::test]
async fn test_idle_connection_closed_after_read_timeout() {
    let settings = BrokerSettings {
        read_timeout_secs: 1,
        ping_interval_secs: 0,
        ..BrokerSettings::default()
    };
    let (url, broker) = start_relay(settings).await;

    let mut sub = Subscriber::connect(&url, ["quiet"]).await.unwrap();
    wait_for_subscribers(&broker, "quiet", 1).await;

    let ended = timeout(Duration::from_secs(5), sub.next_envelope())
        .await
        .expect("server never closed the idle connection");
    assert!(ended.is_none());
    wait_for_subscribers(&broker, "quiet", 0).await;
}

#[tokio::test]
async fn test_pings_keep_idle_subscriber_alive() {
    let settings = BrokerSettings {
        read_timeout_secs: 2,
        ping_interval_secs: 1,
        ..BrokerSettings::default()
    };
    let (url, broker) = start_relay(settings).await;

    let mut sub = Subscriber::connect(&url, ["quiet"]).await.unwrap();
    wait_for_subscribers(&broker, "quiet", 1).await;

    // reading answers the server's pings
    let idle = timeout(Duration::from_secs(4), sub.next_envelope()).await;
    assert!(idle.is_err(), "connection ended while idle: {:?}", idle.ok());

    let mut publisher = Publisher::connect(&url, "quiet").await.unwrap();
    publisher.publish("still here").await.unwrap();
    assert_eq!(next(&mut sub).await, Envelope::publish("quiet", "still here"));
}

#[tokio::test]
async fn test_stalled_handshake_releases_connection_slot() {
    let settings = BrokerSettings {
        max_connections: 1,
        read_timeout_secs: 1,
        ..BrokerSettings::default()
    };
    let (url, broker) = start_relay(settings).await;
    let addr = url.trim_start_matches("ws://");

    // connects but never sends the upgrade request
    let _silent = TcpStream::connect(addr).await.unwrap();
    sleep(Duration::from_millis(2500)).await;

    let _sub = Subscriber::connect(&url, ["a"]).await.unwrap();
    wait_for_subscribers(&broker, "a", 1).await;
}
