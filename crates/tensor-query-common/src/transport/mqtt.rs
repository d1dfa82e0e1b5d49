use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::endpoint::Endpoint;
use crate::protocol::error::{QueryError, Result};
use crate::protocol::{Envelope, Protocol, MAX_MQTT_PAYLOAD};
use crate::transport::codec::CommandCodec;
use crate::transport::{expect_protocol, with_timeout, Transport};

/// Room for the fixed header and topic of a publish packet on top of the envelope.
const PACKET_OVERHEAD: usize = 4 * 1024;

/// Requests queued between a client handle and its event loop.
const REQUEST_CAPACITY: usize = 64;

/// Envelopes buffered per connection before the broker session stalls.
const INBOX_CAPACITY: usize = 256;

const KEEP_ALIVE: Duration = Duration::from_secs(30);

const QOS: QoS = QoS::AtLeastOnce;

/// How long a closing client waits for its close notice to reach the broker.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Topic prefix shared by a server set up on `(host, port)` and its clients.
pub fn base_topic(host: &str, port: u16) -> String {
    format!("tensor_query/{}/{}", host, port)
}

/// Per-client inboxes of a server session, keyed by client id.
type Routes = Arc<Mutex<HashMap<String, mpsc::Sender<Bytes>>>>;

/// Progress reported by a driver to whoever is waiting on the handshake.
#[derive(Debug)]
enum Signal {
    Subscribed,
    Accepted,
    Failed(String),
}

fn options(client_id: &str, host: &str, port: u16) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_max_packet_size(
        MAX_MQTT_PAYLOAD + PACKET_OVERHEAD,
        MAX_MQTT_PAYLOAD + PACKET_OVERHEAD,
    );
    options
}

enum Side {
    /// Owns its broker session and the task polling it.
    Client {
        driver: JoinHandle<()>,
        closed_topic: String,
    },
    /// Shares the acceptor's broker session.
    Server { client_id: String, routes: Routes },
}

/// MQTT binding for tensor query.
///
/// Each envelope is one publish packet. A connection is a topic pair under
/// [`base_topic`]: the client publishes on `{base}/{id}/up` and receives on
/// `{base}/{id}/down`. A client leaving announces itself on
/// `{base}/{id}/closed`, by an explicit notice on close or by its last will.
pub struct MqttLink {
    client: Option<AsyncClient>,
    publish_topic: String,
    inbox: mpsc::Receiver<Bytes>,
    side: Side,
}

impl MqttLink {
    /// Id this connection is known by on the broker.
    pub fn client_id(&self) -> Option<&str> {
        match &self.side {
            Side::Server { client_id, .. } => Some(client_id),
            Side::Client { .. } => None,
        }
    }

    fn release(&mut self) {
        self.inbox.close();
        match &self.side {
            Side::Client { driver, .. } => driver.abort(),
            Side::Server { client_id, routes } => {
                lock(routes).remove(client_id);
            }
        }
    }
}

impl Transport for MqttLink {
    /// Connects to the broker at the endpoint and performs the accept handshake.
    ///
    /// Broker connect, subscription and the server's acceptance all share the
    /// one bound. A broker that drops the session during the handshake is
    /// reported as `Refused`.
    async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self> {
        expect_protocol(endpoint, Protocol::Mqtt)?;

        let client_id = uuid::Uuid::new_v4().simple().to_string();
        let base = base_topic(&endpoint.host, endpoint.port);
        let down_topic = format!("{}/{}/down", base, client_id);
        let accepted_topic = format!("{}/{}/accepted", base, client_id);
        let closed_topic = format!("{}/{}/closed", base, client_id);

        let mut options = options(&client_id, &endpoint.host, endpoint.port);
        options.set_last_will(LastWill::new(closed_topic.clone(), Vec::new(), QOS, false));
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (inbox_tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let (signal_tx, mut signals) = mpsc::channel(8);

        let driver = tokio::spawn(drive_client(
            eventloop,
            down_topic.clone(),
            accepted_topic.clone(),
            inbox_tx,
            signal_tx,
        ));

        // Constructed first so an early return aborts the driver.
        let mut link = Self {
            client: Some(client.clone()),
            publish_topic: format!("{}/{}/up", base, client_id),
            inbox,
            side: Side::Client {
                driver,
                closed_topic,
            },
        };

        let handshake = async {
            client.subscribe(down_topic, QOS).await?;
            client.subscribe(accepted_topic, QOS).await?;
            wait_for(&mut signals, |s| matches!(s, Signal::Subscribed)).await?;
            wait_for(&mut signals, |s| matches!(s, Signal::Subscribed)).await?;

            client
                .publish(format!("{}/connect", base), QOS, false, client_id.clone())
                .await?;
            wait_for(&mut signals, |s| matches!(s, Signal::Accepted)).await
        };

        match with_timeout(timeout, handshake).await {
            Ok(()) => {
                tracing::debug!("MQTT client {} accepted by {}", client_id, endpoint);
                Ok(link)
            }
            Err(e) => {
                link.release();
                Err(e)
            }
        }
    }

    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    fn is_open(&self) -> bool {
        self.client.is_some()
    }

    async fn send(&mut self, envelope: &Envelope, timeout: Duration) -> Result<()> {
        let payload = CommandCodec::encode_unit(envelope, MAX_MQTT_PAYLOAD)?;
        let client = self.client.as_ref().ok_or(QueryError::ConnectionClosed)?;
        let topic = self.publish_topic.clone();

        with_timeout(timeout, async {
            client.publish_bytes(topic, QOS, false, payload).await?;
            Ok(())
        })
        .await
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Envelope> {
        if self.client.is_none() {
            return Err(QueryError::ConnectionClosed);
        }
        let payload = with_timeout(timeout, async {
            self.inbox.recv().await.ok_or(QueryError::ConnectionClosed)
        })
        .await?;
        CommandCodec::decode(payload)
    }

    async fn close(&mut self) -> Result<()> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        if let Side::Client {
            driver,
            closed_topic,
        } = &mut self.side
        {
            // A clean disconnect suppresses the last will, so announce it first.
            let notice = client.try_publish(closed_topic.clone(), QOS, false, Vec::new());
            if let Err(e) = notice.and_then(|()| client.try_disconnect()) {
                tracing::debug!("MQTT disconnect failed: {}", e);
            } else if tokio::time::timeout(CLOSE_GRACE, driver).await.is_err() {
                tracing::debug!("MQTT session did not end within {:?}", CLOSE_GRACE);
            }
        }
        self.release();
        Ok(())
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.release();
    }
}

/// Server side of MQTT: one broker session shared by every client.
///
/// New clients announce themselves on `{base}/connect`. The acceptor
/// registers a route, answers on `{base}/{id}/accepted` and hands the new
/// [`MqttLink`] to [`accept`](Self::accept).
pub struct MqttAcceptor {
    client: AsyncClient,
    base: String,
    incoming: mpsc::Receiver<MqttLink>,
    routes: Routes,
    driver: JoinHandle<()>,
}

impl MqttAcceptor {
    /// Connects to the broker at `(host, port)` and subscribes to the
    /// server topics, failing with `BindFailed` if that does not complete
    /// within `timeout`.
    pub async fn bind(host: &str, port: u16, backlog: usize, timeout: Duration) -> Result<Self> {
        let base = base_topic(host, port);
        let server_id = format!("tensor_query_server_{}", uuid::Uuid::new_v4().simple());
        let (client, eventloop) =
            AsyncClient::new(options(&server_id, host, port), REQUEST_CAPACITY);

        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let (accept_tx, incoming) = mpsc::channel(backlog.max(1));
        let (signal_tx, mut signals) = mpsc::channel(8);

        let driver = tokio::spawn(drive_server(
            eventloop,
            client.clone(),
            base.clone(),
            routes.clone(),
            accept_tx,
            signal_tx,
        ));

        let acceptor = Self {
            client: client.clone(),
            base: base.clone(),
            incoming,
            routes,
            driver,
        };

        let subscribe = async {
            client.subscribe(format!("{}/connect", base), QOS).await?;
            client.subscribe(format!("{}/+/up", base), QOS).await?;
            client.subscribe(format!("{}/+/closed", base), QOS).await?;
            for _ in 0..3 {
                wait_for(&mut signals, |s| matches!(s, Signal::Subscribed)).await?;
            }
            Ok(())
        };

        match with_timeout(timeout, subscribe).await {
            Ok(()) => {
                tracing::debug!("MQTT acceptor listening on {}", base);
                Ok(acceptor)
            }
            Err(e) => Err(QueryError::BindFailed(format!("mqtt://{}:{}: {}", host, port, e))),
        }
    }

    pub fn base_topic(&self) -> &str {
        &self.base
    }

    /// Waits for the next announced client.
    pub async fn accept(&mut self) -> Result<MqttLink> {
        self.incoming.recv().await.ok_or(QueryError::ServerClosed)
    }

    /// Ends the broker session; every routed link then reports `ConnectionClosed`.
    pub fn shutdown(&mut self) {
        self.incoming.close();
        lock(&self.routes).clear();
        if let Err(e) = self.client.try_disconnect() {
            tracing::debug!("MQTT disconnect failed: {}", e);
        }
        self.driver.abort();
    }
}

impl Drop for MqttAcceptor {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

async fn wait_for(
    signals: &mut mpsc::Receiver<Signal>,
    wanted: impl Fn(&Signal) -> bool,
) -> Result<()> {
    loop {
        match signals.recv().await {
            Some(Signal::Failed(reason)) => return Err(QueryError::Refused(reason)),
            Some(signal) if wanted(&signal) => return Ok(()),
            Some(_) => continue,
            None => return Err(QueryError::Refused("broker session ended".to_string())),
        }
    }
}

async fn drive_client(
    mut eventloop: EventLoop,
    down_topic: String,
    accepted_topic: String,
    inbox: mpsc::Sender<Bytes>,
    signals: mpsc::Sender<Signal>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                let _ = signals.try_send(Signal::Subscribed);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if publish.topic == down_topic {
                    if inbox.send(publish.payload).await.is_err() {
                        break;
                    }
                } else if publish.topic == accepted_topic {
                    let _ = signals.try_send(Signal::Accepted);
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("MQTT client session ended: {}", e);
                let _ = signals.try_send(Signal::Failed(e.to_string()));
                break;
            }
        }
    }
}

async fn drive_server(
    mut eventloop: EventLoop,
    client: AsyncClient,
    base: String,
    routes: Routes,
    accept_tx: mpsc::Sender<MqttLink>,
    signals: mpsc::Sender<Signal>,
) {
    let connect_topic = format!("{}/connect", base);
    let prefix = format!("{}/", base);

    loop {
        let publish = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                let _ = signals.try_send(Signal::Subscribed);
                continue;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => publish,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("MQTT server session on {} ended: {}", base, e);
                let _ = signals.try_send(Signal::Failed(e.to_string()));
                break;
            }
        };

        if publish.topic == connect_topic {
            let client_id = match std::str::from_utf8(&publish.payload) {
                Ok(id) if !id.is_empty() && !id.contains('/') => id.to_string(),
                _ => {
                    tracing::warn!("Ignoring malformed MQTT connect request");
                    continue;
                }
            };

            let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
            lock(&routes).insert(client_id.clone(), tx);
            let link = MqttLink {
                client: Some(client.clone()),
                publish_topic: format!("{}{}/down", prefix, client_id),
                inbox: rx,
                side: Side::Server {
                    client_id: client_id.clone(),
                    routes: routes.clone(),
                },
            };

            match accept_tx.try_send(link) {
                Ok(()) => {
                    let accepted = format!("{}{}/accepted", prefix, client_id);
                    if let Err(e) = client.try_publish(accepted, QOS, false, Vec::new()) {
                        tracing::warn!("Failed to accept MQTT client {}: {}", client_id, e);
                    } else {
                        tracing::debug!("New MQTT client {}", client_id);
                    }
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("Accept backlog full, ignoring MQTT client {}", client_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
            continue;
        }

        let Some(rest) = publish.topic.strip_prefix(&prefix) else {
            continue;
        };
        if let Some(client_id) = rest.strip_suffix("/closed") {
            if lock(&routes).remove(client_id).is_some() {
                tracing::debug!("MQTT client {} left", client_id);
            }
            continue;
        }
        let Some(client_id) = rest.strip_suffix("/up") else {
            continue;
        };

        let route = lock(&routes).get(client_id).cloned();
        match route.map(|route| route.try_send(publish.payload)) {
            Some(Ok(())) => {}
            Some(Err(mpsc::error::TrySendError::Full(_))) => {
                tracing::warn!("Inbox for MQTT client {} full, dropping envelope", client_id);
            }
            Some(Err(mpsc::error::TrySendError::Closed(_))) => {
                lock(&routes).remove(client_id);
            }
            None => tracing::debug!("Envelope from unknown MQTT client {}", client_id),
        }
    }

    lock(&routes).clear();
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_topic() {
        assert_eq!(base_topic("localhost", 1883), "tensor_query/localhost/1883");
    }

    #[tokio::test]
    async fn test_connect_rejects_wrong_protocol() {
        let endpoint = Endpoint::tcp("127.0.0.1", 1883);
        let result = MqttLink::connect(&endpoint, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(QueryError::UnsupportedTransport(_))));
    }

    #[tokio::test]
    async fn test_connect_without_broker_fails_within_bound() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let started = std::time::Instant::now();
        let endpoint = Endpoint::mqtt("127.0.0.1", port);
        let result = MqttLink::connect(&endpoint, Duration::from_millis(500)).await;
        assert!(matches!(
            result,
            Err(QueryError::Refused(_)) | Err(QueryError::Timeout(500))
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_bind_without_broker_is_bind_failed() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = MqttAcceptor::bind("127.0.0.1", port, 1, Duration::from_millis(500)).await;
        assert!(matches!(result, Err(QueryError::BindFailed(_))));
    }

    fn broker() -> Option<(String, u16)> {
        let address = std::env::var("TENSOR_QUERY_MQTT_BROKER").ok()?;
        let (host, port) = address.rsplit_once(':')?;
        Some((host.to_string(), port.parse().ok()?))
    }

    #[tokio::test]
    #[ignore = "needs an MQTT broker in TENSOR_QUERY_MQTT_BROKER"]
    async fn test_round_trip_through_broker() {
        let (host, port) = broker().expect("TENSOR_QUERY_MQTT_BROKER=host:port");
        let timeout = Duration::from_secs(5);
        let mut acceptor = MqttAcceptor::bind(&host, port, 4, timeout).await.unwrap();

        let endpoint = Endpoint::mqtt(host.as_str(), port);
        let (client, server) =
            tokio::join!(MqttLink::connect(&endpoint, timeout), acceptor.accept());
        let (mut client, mut server) = (client.unwrap(), server.unwrap());

        client
            .send(&Envelope::data(Protocol::Mqtt, vec![7u8; 16]), timeout)
            .await
            .unwrap();
        let got = server.receive(timeout).await.unwrap();
        assert_eq!(got.chunk().unwrap().len(), 16);

        server
            .send(&Envelope::approve(Protocol::Mqtt), timeout)
            .await
            .unwrap();
        assert_eq!(client.receive(timeout).await.unwrap(), Envelope::approve(Protocol::Mqtt));

        client.close().await.unwrap();
        client.close().await.unwrap();
        server.close().await.unwrap();
        acceptor.shutdown();
    }

    #[tokio::test]
    #[ignore = "needs an MQTT broker in TENSOR_QUERY_MQTT_BROKER"]
    async fn test_client_close_reaches_server() {
        let (host, port) = broker().expect("TENSOR_QUERY_MQTT_BROKER=host:port");
        let timeout = Duration::from_secs(5);
        let mut acceptor = MqttAcceptor::bind(&host, port, 4, timeout).await.unwrap();

        let endpoint = Endpoint::mqtt(host.as_str(), port);
        let (client, server) =
            tokio::join!(MqttLink::connect(&endpoint, timeout), acceptor.accept());
        let (mut client, mut server) = (client.unwrap(), server.unwrap());
        let client_id = server.client_id().unwrap().to_string();
        assert!(lock(&acceptor.routes).contains_key(&client_id));

        client.close().await.unwrap();
        let result = server.receive(timeout).await;
        assert!(matches!(result, Err(QueryError::ConnectionClosed)));
        assert!(!lock(&acceptor.routes).contains_key(&client_id));
        acceptor.shutdown();
    }
}
