// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! End-to-end broker/client scenarios over a real TCP listener.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use codec::{ConnectPacket, ConnectReturnCode, EncodePacket, QoS, SubscribeAck};
use tern::broker::{Broker, BrokerState};
use tern::client::{Client, ConnectOptions};
use tern::config::{ClientConfig, Config};
use tern::error::ErrorKind;

const BROKER_CONFIG: &str = r#"
[[listeners]]
protocol = "mqtt"
address = "127.0.0.1:0"
"#;

async fn start_broker() -> (Broker, SocketAddr) {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = Config::from_toml(BROKER_CONFIG).unwrap();
    let broker = Broker::new(config);
    broker.start().await.unwrap();
    let addr = broker.bound_addrs()[0];
    (broker, addr)
}

async fn connect_client(client_id: &str, addr: SocketAddr, clean_session: bool) -> Client {
    let client = Client::new(Some(client_id), ClientConfig::default()).unwrap();
    let mut options = ConnectOptions::new(&format!("mqtt://{addr}"));
    options.set_clean_session(clean_session);
    let code = client.connect(options).await.unwrap();
    assert_eq!(code, ConnectReturnCode::Accepted);
    client
}

#[tokio::test]
async fn test_qos0_delivery() {
    let (broker, addr) = start_broker().await;

    let subscriber = connect_client("sub-qos0", addr, true).await;
    let acks = subscriber
        .subscribe(&[("/qos0".to_string(), QoS::AtMostOnce)])
        .await
        .unwrap();
    assert_eq!(acks, vec![SubscribeAck::QoS(QoS::AtMostOnce)]);

    let publisher = connect_client("pub-qos0", addr, true).await;
    publisher
        .publish("/qos0", b"data", Some(QoS::AtMostOnce), None, None)
        .await
        .unwrap();

    let message = subscriber
        .deliver_message(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(message.topic, "/qos0");
    assert_eq!(message.data.as_ref(), b"data");
    assert_eq!(message.qos, QoS::AtMostOnce);

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_qos1_delivery() {
    let (broker, addr) = start_broker().await;

    let subscriber = connect_client("sub-qos1", addr, true).await;
    let acks = subscriber
        .subscribe(&[("qos1/topic".to_string(), QoS::AtLeastOnce)])
        .await
        .unwrap();
    assert_eq!(acks, vec![SubscribeAck::QoS(QoS::AtLeastOnce)]);

    let publisher = connect_client("pub-qos1", addr, true).await;
    let sent = publisher
        .publish("qos1/topic", b"once", Some(QoS::AtLeastOnce), None, None)
        .await
        .unwrap();
    // The publish call completed, so the broker acknowledged with PUBACK.
    assert!(sent.puback_packet.is_some());

    let message = subscriber
        .deliver_message(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(message.topic, "qos1/topic");
    assert_eq!(message.data.as_ref(), b"once");
    assert_eq!(message.qos, QoS::AtLeastOnce);

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_qos2_delivery() {
    let (broker, addr) = start_broker().await;

    let subscriber = connect_client("sub-qos2", addr, true).await;
    subscriber
        .subscribe(&[("qos2/topic".to_string(), QoS::ExactOnce)])
        .await
        .unwrap();

    let publisher = connect_client("pub-qos2", addr, true).await;
    let sent = publisher
        .publish("qos2/topic", b"exact", Some(QoS::ExactOnce), None, None)
        .await
        .unwrap();
    // The four-step exchange finished with PUBCOMP.
    assert!(sent.pubrec_packet.is_some());
    assert!(sent.pubcomp_packet.is_some());

    let message = subscriber
        .deliver_message(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(message.data.as_ref(), b"exact");
    assert_eq!(message.qos, QoS::ExactOnce);

    // Exactly once: no second copy arrives.
    let extra = subscriber.deliver_message(Some(Duration::from_secs(1))).await;
    assert!(extra.is_err());

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_subscribe_invalid_filters() {
    let (broker, addr) = start_broker().await;

    let subscriber = connect_client("sub-filters", addr, true).await;
    let acks = subscriber
        .subscribe(&[
            ("+".to_string(), QoS::AtMostOnce),
            ("+/tennis/#".to_string(), QoS::AtMostOnce),
            ("sport+".to_string(), QoS::AtMostOnce),
            ("sport/+/player1".to_string(), QoS::AtMostOnce),
        ])
        .await
        .unwrap();
    assert_eq!(
        acks,
        vec![
            SubscribeAck::QoS(QoS::AtMostOnce),
            SubscribeAck::QoS(QoS::AtMostOnce),
            SubscribeAck::Failed,
            SubscribeAck::QoS(QoS::AtMostOnce),
        ]
    );

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dollar_topic_isolation() {
    let (broker, addr) = start_broker().await;

    let subscriber = connect_client("sub-dollar", addr, true).await;
    subscriber
        .subscribe(&[("#".to_string(), QoS::AtMostOnce)])
        .await
        .unwrap();

    let publisher = connect_client("pub-dollar", addr, true).await;
    publisher
        .publish("$X", b"msg", Some(QoS::AtMostOnce), None, None)
        .await
        .unwrap();

    // [MQTT-4.7.2-1] The wildcard subscription receives nothing.
    let ret = subscriber.deliver_message(Some(Duration::from_secs(1))).await;
    assert!(ret.is_err());
    assert_eq!(ret.unwrap_err().kind(), ErrorKind::Timeout);

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retained_replay() {
    let (broker, addr) = start_broker().await;

    let publisher = connect_client("pub-retain", addr, true).await;
    publisher
        .publish("/r", b"r", Some(QoS::AtLeastOnce), Some(true), None)
        .await
        .unwrap();
    // Let the broker's ingress path store the retained message.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let subscriber = connect_client("sub-retain", addr, true).await;
    subscriber
        .subscribe(&[("/r".to_string(), QoS::ExactOnce)])
        .await
        .unwrap();

    let message = subscriber
        .deliver_message(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(message.topic, "/r");
    assert_eq!(message.data.as_ref(), b"r");
    // Delivered at min(sub_qos=2, retained_qos=1).
    assert_eq!(message.qos, QoS::AtLeastOnce);
    assert!(message.retain);

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retained_clear() {
    let (broker, addr) = start_broker().await;

    let publisher = connect_client("pub-clear", addr, true).await;
    publisher
        .publish("clear/me", b"kept", Some(QoS::AtLeastOnce), Some(true), None)
        .await
        .unwrap();
    // A zero-byte retained payload removes the stored message.
    publisher
        .publish("clear/me", b"", Some(QoS::AtLeastOnce), Some(true), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let subscriber = connect_client("sub-clear", addr, true).await;
    subscriber
        .subscribe(&[("clear/me".to_string(), QoS::AtLeastOnce)])
        .await
        .unwrap();
    let ret = subscriber.deliver_message(Some(Duration::from_secs(1))).await;
    assert!(ret.is_err());

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_session_takeover() {
    let (broker, addr) = start_broker().await;

    let first = connect_client("c1", addr, false).await;
    assert!(!first.session_present());

    // Second CONNECT with the same client id: the broker closes the first
    // connection and resumes the stored session.
    let second = connect_client("c1", addr, false).await;
    assert!(second.session_present());

    // The first client's connection is gone; its API calls fail once the
    // supervisor has observed the close.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let ret = first
        .publish("any/topic", b"x", Some(QoS::AtMostOnce), None, None)
        .await;
    assert!(ret.is_err());

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_empty_client_id_with_session() {
    let (broker, addr) = start_broker().await;

    // A zero-byte client id with clean_session=0 is rejected with CONNACK
    // code 2 [MQTT-3.1.3-8].
    let mut connect = ConnectPacket::new("").unwrap();
    connect.set_keep_alive(60);
    let mut buf = Vec::new();
    connect.encode(&mut buf).unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&buf).await.unwrap();

    let mut connack = [0_u8; 4];
    stream.read_exact(&mut connack).await.unwrap();
    assert_eq!(connack, [0x20, 0x02, 0x00, 0x02]);

    // The broker closes the connection after the rejection.
    let mut rest = [0_u8; 1];
    let n = stream.read(&mut rest).await.unwrap();
    assert_eq!(n, 0);

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_will_message_on_abnormal_disconnect() {
    let (broker, addr) = start_broker().await;

    let subscriber = connect_client("sub-will", addr, true).await;
    subscriber
        .subscribe(&[("will/topic".to_string(), QoS::AtMostOnce)])
        .await
        .unwrap();

    // Raw client announcing a will, then dying without DISCONNECT.
    let mut connect = ConnectPacket::new("will-client").unwrap();
    connect.set_keep_alive(60);
    connect
        .set_will("will/topic", b"gone", QoS::AtMostOnce, false)
        .unwrap();
    let mut flags = *connect.connect_flags();
    flags.set_clean_session(true);
    connect.set_connect_flags(flags);
    let mut buf = Vec::new();
    connect.encode(&mut buf).unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&buf).await.unwrap();
    let mut connack = [0_u8; 4];
    stream.read_exact(&mut connack).await.unwrap();
    assert_eq!(connack[3], 0x00);
    drop(stream);

    let message = subscriber
        .deliver_message(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(message.topic, "will/topic");
    assert_eq!(message.data.as_ref(), b"gone");

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_normal_disconnect_suppresses_will() {
    let (broker, addr) = start_broker().await;

    let subscriber = connect_client("sub-nowill", addr, true).await;
    subscriber
        .subscribe(&[("nowill/topic".to_string(), QoS::AtMostOnce)])
        .await
        .unwrap();

    let mut config = ClientConfig::default();
    config.set_will(Some(tern::config::WillConfig {
        topic: "nowill/topic".to_string(),
        message: "gone".to_string(),
        qos: QoS::AtMostOnce,
        retain: false,
    }));
    let client = Client::new(Some("will-client-2"), config).unwrap();
    let options = ConnectOptions::new(&format!("mqtt://{addr}"));
    client.connect(options).await.unwrap();

    // A DISCONNECT packet discards the will [MQTT-3.14.4-3].
    client.disconnect().await.unwrap();

    let ret = subscriber.deliver_message(Some(Duration::from_secs(1))).await;
    assert!(ret.is_err());

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (broker, addr) = start_broker().await;

    let subscriber = connect_client("sub-unsub", addr, true).await;
    subscriber
        .subscribe(&[("unsub/topic".to_string(), QoS::AtMostOnce)])
        .await
        .unwrap();
    // UNSUBACK arrives even for filters that were never subscribed.
    subscriber
        .unsubscribe(&["unsub/topic".to_string(), "never/subscribed".to_string()])
        .await
        .unwrap();

    let publisher = connect_client("pub-unsub", addr, true).await;
    publisher
        .publish("unsub/topic", b"x", Some(QoS::AtMostOnce), None, None)
        .await
        .unwrap();

    let ret = subscriber.deliver_message(Some(Duration::from_secs(1))).await;
    assert!(ret.is_err());

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ping() {
    let (broker, addr) = start_broker().await;
    let client = connect_client("pinger", addr, true).await;
    client.ping().await.unwrap();
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_broker_lifecycle() {
    let config = Config::from_toml(BROKER_CONFIG).unwrap();
    let broker = Broker::new(config);
    assert_eq!(broker.state(), BrokerState::New);

    broker.start().await.unwrap();
    assert_eq!(broker.state(), BrokerState::Started);

    // A second start from `started` is rejected.
    assert!(broker.start().await.is_err());

    broker.shutdown().await.unwrap();
    assert_eq!(broker.state(), BrokerState::Stopped);

    // `stopped → starting` is a legal transition.
    broker.start().await.unwrap();
    assert_eq!(broker.state(), BrokerState::Started);
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_clean_session_discards_subscriptions() {
    let (broker, addr) = start_broker().await;

    let first = connect_client("cleaner", addr, false).await;
    first
        .subscribe(&[("kept/topic".to_string(), QoS::AtMostOnce)])
        .await
        .unwrap();
    first.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.subscription_count(), 1);

    // Reconnecting with clean_session=1 deletes all prior state.
    let second = connect_client("cleaner", addr, true).await;
    assert!(!second.session_present());
    assert_eq!(broker.subscription_count(), 0);

    broker.shutdown().await.unwrap();
}
