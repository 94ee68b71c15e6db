//! Public API tests over an in-memory transport and a scripted broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use stomp_websocket::frame::headers;
use stomp_websocket::sockjs::SessionTokens;
use stomp_websocket::transport::{Dialer, Transport, TransportReader, TransportWriter};
use stomp_websocket::{ClientConfig, Command, Frame, Header, StompClient, StompError};

const WAIT: Duration = Duration::from_secs(2);
const BASE_URL: &str = "ws://broker.test/stomp";

struct FixedTokens;

impl SessionTokens for FixedTokens {
    fn server_id(&mut self) -> String {
        "042".to_string()
    }

    fn session_id(&mut self) -> String {
        "abcdefghABCDEFGH".to_string()
    }
}

struct ChannelWriter {
    out: mpsc::UnboundedSender<String>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl TransportWriter for ChannelWriter {
    async fn send(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let text = String::from_utf8(data.to_vec())?;
        self.out.send(text).map_err(|_| anyhow!("broker gone"))
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct ChannelReader {
    inbound: mpsc::UnboundedReceiver<anyhow::Result<Vec<u8>>>,
}

#[async_trait]
impl TransportReader for ChannelReader {
    async fn receive(&mut self) -> Option<anyhow::Result<Vec<u8>>> {
        self.inbound.recv().await
    }
}

/// Hands out one prepared transport and records what it was dialed with.
struct MemoryDialer {
    transport: Mutex<Option<Transport>>,
    dialed: Arc<Mutex<Option<(Url, Header)>>>,
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, url: &Url, headers: &Header) -> anyhow::Result<Transport> {
        *self.dialed.lock().unwrap() = Some((url.clone(), headers.clone()));
        self.transport
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("connection refused"))
    }
}

/// Broker end of the in-memory transport.
struct Broker {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<anyhow::Result<Vec<u8>>>,
    closes: Arc<AtomicUsize>,
    dialed: Arc<Mutex<Option<(Url, Header)>>>,
}

impl Broker {
    fn pair() -> (MemoryDialer, Broker) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        let dialed = Arc::new(Mutex::new(None));

        let transport = Transport::new(
            Box::new(ChannelWriter {
                out: out_tx,
                closes: Arc::clone(&closes),
            }),
            Box::new(ChannelReader { inbound: in_rx }),
        );
        let dialer = MemoryDialer {
            transport: Mutex::new(Some(transport)),
            dialed: Arc::clone(&dialed),
        };
        let broker = Broker {
            from_client: out_rx,
            to_client: in_tx,
            closes,
            dialed,
        };
        (dialer, broker)
    }

    fn send(&self, frame: &Frame) {
        self.send_raw(&format!("a{}", frame.encode()));
    }

    fn send_raw(&self, raw: &str) {
        self.to_client.send(Ok(raw.as_bytes().to_vec())).unwrap();
    }

    fn fail_read(&self, reason: &str) {
        self.to_client.send(Err(anyhow!(reason.to_string()))).unwrap();
    }

    /// Next frame written by the client, which must carry `command`.
    async fn expect(&mut self, command: Command) -> Frame {
        let raw = tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .expect("client wrote nothing")
            .expect("client transport dropped");
        let frame = Frame::decode(format!("a{raw}").as_bytes()).unwrap();
        assert_eq!(frame.command, command, "unexpected frame: {raw}");
        frame
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn dialed(&self) -> (Url, Header) {
        self.dialed.lock().unwrap().clone().expect("never dialed")
    }
}

fn connected_frame() -> Frame {
    Frame::new(Command::Connected).header("version", "1.2")
}

fn message(subscription: &str, body: &str) -> Frame {
    Frame::new(Command::Message)
        .header(headers::SUBSCRIPTION, subscription)
        .header(headers::DESTINATION, "/topic/test")
        .body(body)
}

fn receipt(id: &str) -> Frame {
    Frame::new(Command::Receipt).header(headers::RECEIPT_ID, id)
}

async fn connect_with(config: ClientConfig) -> (StompClient, Broker) {
    let (dialer, mut broker) = Broker::pair();
    broker.send_raw("o");
    broker.send(&connected_frame());

    let client = StompClient::builder(BASE_URL)
        .dialer(dialer)
        .session_tokens(FixedTokens)
        .config(config)
        .connect()
        .await
        .unwrap();
    broker.expect(Command::Connect).await;
    (client, broker)
}

async fn connect() -> (StompClient, Broker) {
    connect_with(ClientConfig::default()).await
}

async fn wait_closed(client: &StompClient) {
    tokio::time::timeout(WAIT, async {
        while !client.is_closed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection did not close");
}

async fn next(subscription: &mut stomp_websocket::Subscription) -> Option<Frame> {
    tokio::time::timeout(WAIT, subscription.recv())
        .await
        .expect("no frame arrived in time")
}

#[tokio::test]
async fn test_connect_sends_connect_frame_on_session_url() {
    let (dialer, mut broker) = Broker::pair();
    broker.send_raw("o");
    broker.send_raw("h");
    broker.send(&connected_frame());

    let client = StompClient::connect(BASE_URL, Header::new(), &dialer, ClientConfig::default())
        .await
        .unwrap();

    let connect = broker.expect(Command::Connect).await;
    assert_eq!(connect.contains(headers::ACCEPT_VERSION), Some("1.2,1.1,1.0"));
    assert_eq!(connect.contains(headers::HEART_BEAT), Some("10000,10000"));

    let (url, _) = broker.dialed();
    let segments: Vec<_> = url.path_segments().unwrap().collect();
    assert_eq!(segments[0], "stomp");
    assert_eq!(segments[1].len(), 3);
    assert_eq!(segments[2].len(), 16);
    assert_eq!(segments[3], "websocket");
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_builder_uses_session_tokens_and_request_headers() {
    let (client, broker) = connect().await;

    let (url, headers) = broker.dialed();
    assert_eq!(
        url.as_str(),
        "ws://broker.test/stomp/042/abcdefghABCDEFGH/websocket"
    );
    assert!(headers.is_empty());
    assert_eq!(client.label(), "/stomp/042/abcdefghABCDEFGH/websocket");
}

#[tokio::test]
async fn test_bearer_token_adds_host_origin_and_authorization() {
    let (dialer, broker) = Broker::pair();
    broker.send(&connected_frame());

    StompClient::builder("wss://broker.test:8443/stomp")
        .dialer(dialer)
        .session_tokens(FixedTokens)
        .header("X-Tenant", "7")
        .bearer_token("secret")
        .connect()
        .await
        .unwrap();

    let (_, headers) = broker.dialed();
    assert_eq!(headers.get("X-Tenant"), "7");
    assert_eq!(headers.get("Host"), "broker.test:8443");
    assert_eq!(headers.get("Origin"), "https://broker.test:8443");
    assert_eq!(headers.get("Authorization"), "Bearer secret");
}

#[tokio::test]
async fn test_unsupported_scheme_fails_before_dialing() {
    let (dialer, broker) = Broker::pair();

    let result = StompClient::builder("http://broker.test/stomp")
        .dialer(dialer)
        .bearer_token("secret")
        .connect()
        .await;

    assert_eq!(
        result.unwrap_err(),
        StompError::UnsupportedScheme("http".to_string())
    );
    assert!(broker.dialed.lock().unwrap().is_none());

    let result =
        StompClient::connect_with_token("ftp://broker.test/stomp", "t", ClientConfig::default())
            .await;
    assert_eq!(
        result.unwrap_err(),
        StompError::UnsupportedScheme("ftp".to_string())
    );
}

#[tokio::test]
async fn test_invalid_url_is_rejected() {
    let (dialer, _broker) = Broker::pair();
    let result =
        StompClient::connect("not a url", Header::new(), &dialer, ClientConfig::default()).await;
    assert!(matches!(result, Err(StompError::InvalidUrl(_))));
}

#[tokio::test]
async fn test_dial_failure_is_connection_failed() {
    let (dialer, _broker) = Broker::pair();
    dialer.transport.lock().unwrap().take();

    let result = StompClient::connect(BASE_URL, Header::new(), &dialer, ClientConfig::default())
        .await;
    match result {
        Err(StompError::ConnectionFailed(msg)) => assert!(msg.contains("connection refused")),
        other => panic!("expected ConnectionFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handshake_error_reply_fails_connect_and_closes_transport() {
    let (dialer, broker) = Broker::pair();
    broker.send_raw("o");
    broker.send(&Frame::error("bad credentials"));

    let result = StompClient::connect(BASE_URL, Header::new(), &dialer, ClientConfig::default())
        .await;

    assert_eq!(
        result.unwrap_err(),
        StompError::Handshake("bad credentials".to_string())
    );
    assert_eq!(broker.closes(), 1);
}

#[tokio::test]
async fn test_handshake_rejects_unexpected_reply() {
    let (dialer, broker) = Broker::pair();
    broker.send(&Frame::new(Command::Other("HELLO".to_string())));

    let result = StompClient::connect(BASE_URL, Header::new(), &dialer, ClientConfig::default())
        .await;

    assert_eq!(
        result.unwrap_err(),
        StompError::Handshake("expected CONNECTED, got HELLO".to_string())
    );
    assert_eq!(broker.closes(), 1);
}

#[tokio::test]
async fn test_handshake_validation_can_be_disabled() {
    let (dialer, broker) = Broker::pair();
    broker.send(&Frame::new(Command::Other("HELLO".to_string())));
    let config = ClientConfig {
        validate_handshake: false,
        ..ClientConfig::default()
    };

    let result = StompClient::connect(BASE_URL, Header::new(), &dialer, config).await;
    assert!(result.is_ok());
    assert_eq!(broker.closes(), 0);
}

#[tokio::test]
async fn test_handshake_times_out_without_reply() {
    let (dialer, broker) = Broker::pair();
    broker.send_raw("o");
    let config = ClientConfig {
        handshake_timeout_ms: 50,
        ..ClientConfig::default()
    };

    let result = StompClient::connect(BASE_URL, Header::new(), &dialer, config).await;
    assert_eq!(result.unwrap_err(), StompError::Timeout);
    assert_eq!(broker.closes(), 1);
}

#[tokio::test]
async fn test_subscribe_routes_messages_in_order() {
    let (client, mut broker) = connect().await;

    let mut news = client.subscribe("/topic/news").await.unwrap();
    let frame = broker.expect(Command::Subscribe).await;
    assert_eq!(frame.contains(headers::ID), Some(news.id()));
    assert_eq!(frame.contains(headers::DESTINATION), Some("/topic/news"));
    assert_eq!(news.topic(), "/topic/news");
    assert_eq!(news.label(), client.label());

    let mut sport = client.subscribe("/topic/sport").await.unwrap();
    broker.expect(Command::Subscribe).await;
    assert_ne!(news.id(), sport.id());

    broker.send(&message(news.id(), "first"));
    broker.send_raw("h");
    broker.send(&message(sport.id(), "goal"));
    broker.send(&message(news.id(), "second\nwith a line break"));
    broker.send(&message("someone-else", "ignored"));

    assert_eq!(next(&mut news).await.unwrap().body, "first");
    assert_eq!(next(&mut news).await.unwrap().body, "second\nwith a line break");
    assert_eq!(next(&mut sport).await.unwrap().body, "goal");
    assert!(news.try_recv().is_err());
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (client, mut broker) = connect().await;
    let mut news = client.subscribe("/topic/news").await.unwrap();
    broker.expect(Command::Subscribe).await;

    news.unsubscribe().await.unwrap();
    let frame = broker.expect(Command::Unsubscribe).await;
    assert_eq!(frame.contains(headers::ID), Some(news.id()));

    broker.send(&message(news.id(), "too late"));
    assert_eq!(next(&mut news).await, None);
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_subscribe_with_receipt_keeps_early_messages() {
    let (client, mut broker) = connect().await;

    let broker_side = async {
        let frame = broker.expect(Command::Subscribe).await;
        let id = frame.contains(headers::ID).unwrap().to_string();
        let receipt_id = frame.contains(headers::RECEIPT).unwrap().to_string();
        broker.send(&message(&id, "early"));
        broker.send(&receipt(&receipt_id));
        broker.send(&message(&id, "late"));
    };
    let (subscription, ()) = tokio::join!(client.subscribe_with_receipt("/topic/news"), broker_side);
    let mut subscription = subscription.unwrap();

    assert_eq!(next(&mut subscription).await.unwrap().body, "early");
    assert_eq!(next(&mut subscription).await.unwrap().body, "late");
}

#[tokio::test]
async fn test_unconfirmed_subscribe_is_withdrawn() {
    let config = ClientConfig {
        receipt_timeout_ms: 50,
        ..ClientConfig::default()
    };
    let (client, mut broker) = connect_with(config).await;

    let result = client.subscribe_with_receipt("/topic/slow").await;
    assert_eq!(result.unwrap_err(), StompError::Timeout);

    let subscribe = broker.expect(Command::Subscribe).await;
    let unsubscribe = broker.expect(Command::Unsubscribe).await;
    assert_eq!(
        unsubscribe.contains(headers::ID),
        subscribe.contains(headers::ID)
    );
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_subscribe_with_receipt_fails_on_error() {
    let (client, mut broker) = connect().await;

    let broker_side = async {
        broker.expect(Command::Subscribe).await;
        broker.send(&Frame::error("no such destination"));
    };
    let (result, ()) = tokio::join!(client.subscribe_with_receipt("/topic/missing"), broker_side);

    assert_eq!(
        result.unwrap_err(),
        StompError::Server("no such destination".to_string())
    );
}

#[tokio::test]
async fn test_disconnect_waits_for_receipt_and_closes_once() {
    let (client, mut broker) = connect().await;
    let mut news = client.subscribe("/topic/news").await.unwrap();
    broker.expect(Command::Subscribe).await;

    let broker_side = async {
        let frame = broker.expect(Command::Disconnect).await;
        let id = frame.contains(headers::RECEIPT).unwrap().to_string();
        broker.send(&receipt(&id));
    };
    let (result, ()) = tokio::join!(client.disconnect(), broker_side);
    result.unwrap();

    wait_closed(&client).await;
    assert_eq!(next(&mut news).await, None);
    assert_eq!(broker.closes(), 1);
    assert_eq!(
        client.subscribe("/topic/news").await.unwrap_err(),
        StompError::Closed
    );
}

#[tokio::test]
async fn test_disconnect_answered_with_error() {
    let (client, mut broker) = connect().await;

    let broker_side = async {
        broker.expect(Command::Disconnect).await;
        broker.send(&Frame::error("not now"));
    };
    let (result, ()) = tokio::join!(client.disconnect(), broker_side);

    assert_eq!(result.unwrap_err(), StompError::Server("not now".to_string()));
    wait_closed(&client).await;
    assert_eq!(broker.closes(), 1);
}

#[tokio::test]
async fn test_disconnect_times_out_without_receipt() {
    let config = ClientConfig {
        receipt_timeout_ms: 50,
        ..ClientConfig::default()
    };
    let (client, mut broker) = connect_with(config).await;

    assert_eq!(client.disconnect().await.unwrap_err(), StompError::Timeout);
    broker.expect(Command::Disconnect).await;
}

#[tokio::test]
async fn test_server_error_reaches_every_subscription() {
    let (client, mut broker) = connect().await;
    let mut a = client.subscribe("/topic/a").await.unwrap();
    let mut b = client.subscribe("/topic/b").await.unwrap();
    broker.expect(Command::Subscribe).await;
    broker.expect(Command::Subscribe).await;

    broker.send(&Frame::error("broker restarting"));

    for subscription in [&mut a, &mut b] {
        let frame = next(subscription).await.unwrap();
        assert_eq!(frame.command, Command::Error);
        assert_eq!(frame.error_message(), "broker restarting");
        assert_eq!(next(subscription).await, None);
    }

    wait_closed(&client).await;
    assert_eq!(broker.closes(), 1);
}

#[tokio::test]
async fn test_session_close_fails_subscriptions() {
    let (client, mut broker) = connect().await;
    let mut news = client.subscribe("/topic/news").await.unwrap();
    broker.expect(Command::Subscribe).await;

    broker.send_raw(r#"c[3000,"Go away!"]"#);

    let frame = next(&mut news).await.unwrap();
    assert_eq!(frame.error_message(), "session closed");
    wait_closed(&client).await;
    assert_eq!(broker.closes(), 1);
}

#[tokio::test]
async fn test_read_error_becomes_error_frame() {
    let (client, mut broker) = connect().await;
    let mut news = client.subscribe("/topic/news").await.unwrap();
    broker.expect(Command::Subscribe).await;

    broker.fail_read("connection reset by peer");

    let frame = next(&mut news).await.unwrap();
    assert_eq!(frame.command, Command::Error);
    assert!(frame.error_message().contains("connection reset by peer"));
    wait_closed(&client).await;
}

#[tokio::test]
async fn test_close_cancels_waiters() {
    let (client, mut broker) = connect().await;
    let mut news = client.subscribe("/topic/news").await.unwrap();
    broker.expect(Command::Subscribe).await;

    client.close();

    let frame = next(&mut news).await.unwrap();
    assert_eq!(frame.error_message(), "connection cancelled");
    assert_eq!(next(&mut news).await, None);
    assert!(client.is_closed());
    assert_eq!(news.unsubscribe().await.unwrap_err(), StompError::Closed);
}
