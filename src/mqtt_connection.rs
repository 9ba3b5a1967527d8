use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mqtt::control::variable_header::ConnectReturnCode;
use mqtt::packet::suback::SubscribeReturnCode;
use mqtt::packet::*;
use mqtt::{Encodable, QualityOfService, TopicFilter, TopicName};
use tokio::io::AsyncWriteExt;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_native_tls::{TlsConnector, TlsStream};

use crate::registration::X509Identity;
use crate::ProvisioningError;

const EVENT_BUFFER: usize = 16;

/// Parameters of an MQTT session
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    ///
    pub host: String,
    ///
    pub port: u16,
    ///
    pub client_id: String,
    ///
    pub username: String,
    /// Shared access signature, when authenticating with one
    pub password: Option<String>,
    /// TLS client certificate, when authenticating with one
    pub identity: Option<X509Identity>,
    ///
    pub clean_session: bool,
    ///
    pub keep_alive: Duration,
}

/// Something the broker sent outside of a request/ack exchange
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A PUBLISH on a subscribed topic
    Message {
        ///
        topic: String,
        ///
        payload: Vec<u8>,
    },
    /// The connection closed without `disconnect` being called
    Closed(String),
}

/// A single MQTT session
///
/// [`TlsMqttConnection`] is the network implementation; the provisioning transport only relies on
/// this trait so the protocol state machine can be driven without a broker.
#[async_trait]
pub trait MqttConnection: Send + 'static {
    /// Open the session; events for subscribed topics arrive on the returned channel
    async fn connect(&mut self, options: &ConnectOptions) -> crate::Result<Receiver<ConnectionEvent>>;
    /// Subscribe and wait for the broker to acknowledge
    async fn subscribe(&mut self, topic_filter: &str) -> crate::Result<()>;
    /// Unsubscribe and wait for the broker to acknowledge
    async fn unsubscribe(&mut self, topic_filter: &str) -> crate::Result<()>;
    ///
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> crate::Result<()>;
    /// Close the session
    async fn disconnect(&mut self) -> crate::Result<()>;
}

#[derive(Debug, PartialEq)]
enum Ack {
    Subscribe(u16, bool),
    Unsubscribe(u16),
}

type Writer = Arc<Mutex<WriteHalf<TlsStream<TcpStream>>>>;

/// MQTT 3.1.1 over TLS on port 8883
#[derive(Debug, Default)]
pub struct TlsMqttConnection {
    writer: Option<Writer>,
    acks: Option<Receiver<Ack>>,
    tasks: Vec<JoinHandle<()>>,
    next_packet_id: u16,
}

impl TlsMqttConnection {
    ///
    pub fn new() -> Self {
        Self::default()
    }

    fn packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        self.next_packet_id
    }

    async fn write<P: Encodable>(&self, packet: &P) -> crate::Result<()> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| ProvisioningError::Mqtt("not connected".to_string()))?;
        write_packet(writer, packet).await
    }

    async fn wait_for<F>(&mut self, mut matches: F) -> crate::Result<bool>
    where
        F: FnMut(&Ack) -> Option<bool> + Send,
    {
        let acks = self
            .acks
            .as_mut()
            .ok_or_else(|| ProvisioningError::Mqtt("not connected".to_string()))?;
        loop {
            match acks.recv().await {
                Some(ack) => {
                    if let Some(success) = matches(&ack) {
                        return Ok(success);
                    }
                    trace!("Ignoring unrelated ack {:?}", ack);
                }
                None => {
                    return Err(ProvisioningError::ConnectionLost(
                        "connection closed while waiting for an ack".to_string(),
                    ))
                }
            }
        }
    }
}

async fn write_packet<P: Encodable>(writer: &Writer, packet: &P) -> crate::Result<()> {
    let mut buf = Vec::new();
    packet
        .encode(&mut buf)
        .map_err(|e| ProvisioningError::Mqtt(format!("{:?}", e)))?;
    writer.lock().await.write_all(&buf[..]).await?;
    Ok(())
}

async fn tls_connect(options: &ConnectOptions) -> crate::Result<TlsStream<TcpStream>> {
    let socket = TcpStream::connect((options.host.as_str(), options.port)).await?;

    trace!("Connected to tcp socket {:?}", socket);

    let mut builder = native_tls::TlsConnector::builder();
    builder.min_protocol_version(Some(native_tls::Protocol::Tlsv12));
    if let Some(identity) = &options.identity {
        builder.identity(identity.tls_identity()?);
    }
    let cx = TlsConnector::from(builder.build()?);

    let socket = cx.connect(&options.host, socket).await?;

    trace!("Connected tls context {:?}", cx);

    Ok(socket)
}

/// The acknowledgement a SUBACK or UNSUBACK carries, if `packet` is one
fn ack_for(packet: &VariablePacket) -> Option<Ack> {
    match packet {
        VariablePacket::SubackPacket(ack) => {
            let accepted = !ack
                .payload_ref()
                .subscribes()
                .iter()
                .any(|code| matches!(code, SubscribeReturnCode::Failure));
            Some(Ack::Subscribe(ack.packet_identifier(), accepted))
        }
        VariablePacket::UnsubackPacket(ack) => Some(Ack::Unsubscribe(ack.packet_identifier())),
        _ => None,
    }
}

/// Check the broker's answer to CONNECT
fn accept_connack(packet: &VariablePacket) -> crate::Result<()> {
    match packet {
        VariablePacket::ConnackPacket(connack) => {
            if connack.connect_return_code() != ConnectReturnCode::ConnectionAccepted {
                return Err(ProvisioningError::ConnectionRefused(format!(
                    "return code {:?}",
                    connack.connect_return_code()
                )));
            }
            Ok(())
        }
        pck => Err(ProvisioningError::Mqtt(format!(
            "Unexpected packet received after connect {:?}",
            pck
        ))),
    }
}

async fn read_loop(
    mut socket: ReadHalf<TlsStream<TcpStream>>,
    events: Sender<ConnectionEvent>,
    acks: Sender<Ack>,
) {
    loop {
        let packet = match VariablePacket::parse(&mut socket).await {
            Ok(packet) => packet,
            Err(err) => {
                debug!("Receive loop stopped: {:?}", err);
                let _ = events
                    .send(ConnectionEvent::Closed(format!("{:?}", err)))
                    .await;
                break;
            }
        };

        trace!("Received PACKET {:?}", packet);
        match packet {
            VariablePacket::PublishPacket(ref publ) => {
                let event = ConnectionEvent::Message {
                    topic: publ.topic_name().to_string(),
                    payload: publ.payload_ref()[..].to_vec(),
                };
                if events.send(event).await.is_err() {
                    debug!("Dropping PUBLISH on {}, nobody is listening", publ.topic_name());
                }
            }
            VariablePacket::SubackPacket(..) | VariablePacket::UnsubackPacket(..) => {
                if let Some(ack) = ack_for(&packet) {
                    let _ = acks.send(ack).await;
                }
            }
            VariablePacket::PingrespPacket(..) => {
                trace!("Receiving PINGRESP from broker ..");
            }
            _ => {}
        }
    }
}

async fn ping_loop(writer: Writer, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        trace!("Sending PINGREQ to broker");
        if let Err(err) = write_packet(&writer, &PingreqPacket::new()).await {
            debug!("Ping loop stopped: {}", err);
            break;
        }
    }
}

#[async_trait]
impl MqttConnection for TlsMqttConnection {
    async fn connect(&mut self, options: &ConnectOptions) -> crate::Result<Receiver<ConnectionEvent>> {
        let mut socket = tls_connect(options).await?;

        let mut conn = ConnectPacket::new(options.client_id.as_str());
        conn.set_clean_session(options.clean_session);
        conn.set_keep_alive(options.keep_alive.as_secs().min(u16::MAX as u64) as u16);
        conn.set_user_name(Some(options.username.clone()));
        conn.set_password(options.password.clone());

        let mut buf = Vec::new();
        conn.encode(&mut buf)
            .map_err(|e| ProvisioningError::Mqtt(format!("{:?}", e)))?;
        socket.write_all(&buf[..]).await?;

        let packet = VariablePacket::parse(&mut socket).await;

        trace!("PACKET {:?}", packet);
        match packet {
            Ok(packet) => accept_connack(&packet)?,
            Err(err) => {
                return Err(ProvisioningError::Mqtt(format!(
                    "Error decoding connack packet {:?}",
                    err
                )))
            }
        }

        let (read_socket, write_socket) = tokio::io::split(socket);
        let writer = Arc::new(Mutex::new(write_socket));
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (ack_tx, ack_rx) = mpsc::channel(EVENT_BUFFER);

        self.tasks.push(tokio::spawn(read_loop(read_socket, event_tx, ack_tx)));
        if !options.keep_alive.is_zero() {
            self.tasks
                .push(tokio::spawn(ping_loop(Arc::clone(&writer), options.keep_alive)));
        }
        self.writer = Some(writer);
        self.acks = Some(ack_rx);

        Ok(event_rx)
    }

    async fn subscribe(&mut self, topic_filter: &str) -> crate::Result<()> {
        let packet_id = self.packet_id();
        let filter = TopicFilter::new(topic_filter)
            .map_err(|e| ProvisioningError::Mqtt(format!("{:?}", e)))?;
        trace!("Subscribing to {}", topic_filter);
        self.write(&SubscribePacket::new(
            packet_id,
            vec![(filter, QualityOfService::Level0)],
        ))
        .await?;

        let accepted = self
            .wait_for(|ack| match ack {
                Ack::Subscribe(id, accepted) if *id == packet_id => Some(*accepted),
                _ => None,
            })
            .await?;
        if accepted {
            Ok(())
        } else {
            Err(ProvisioningError::Mqtt(format!(
                "subscription to {} refused",
                topic_filter
            )))
        }
    }

    async fn unsubscribe(&mut self, topic_filter: &str) -> crate::Result<()> {
        let packet_id = self.packet_id();
        let filter = TopicFilter::new(topic_filter)
            .map_err(|e| ProvisioningError::Mqtt(format!("{:?}", e)))?;
        trace!("Unsubscribing from {}", topic_filter);
        self.write(&UnsubscribePacket::new(packet_id, vec![filter]))
            .await?;
        self.wait_for(|ack| match ack {
            Ack::Unsubscribe(id) if *id == packet_id => Some(true),
            _ => None,
        })
        .await
        .map(|_| ())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> crate::Result<()> {
        let topic_name =
            TopicName::new(topic).map_err(|e| ProvisioningError::Mqtt(format!("{:?}", e)))?;
        trace!("Publishing {} bytes to {}", payload.len(), topic);
        self.write(&PublishPacket::new(
            topic_name,
            QoSWithPacketIdentifier::Level0,
            payload,
        ))
        .await
    }

    async fn disconnect(&mut self) -> crate::Result<()> {
        let result = match self.writer.take() {
            Some(writer) => {
                let sent = write_packet(&writer, &DisconnectPacket::new()).await;
                let _ = writer.lock().await.shutdown().await;
                sent
            }
            None => Ok(()),
        };
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.acks = None;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_subscription_is_reported() {
        let packet = VariablePacket::SubackPacket(SubackPacket::new(
            1,
            vec![SubscribeReturnCode::Failure],
        ));
        assert_eq!(ack_for(&packet), Some(Ack::Subscribe(1, false)));
    }

    #[test]
    fn granted_subscription_is_accepted() {
        let packet = VariablePacket::SubackPacket(SubackPacket::new(
            7,
            vec![SubscribeReturnCode::MaximumQoSLevel0],
        ));
        assert_eq!(ack_for(&packet), Some(Ack::Subscribe(7, true)));
    }

    #[test]
    fn unsuback_is_matched_by_packet_id() {
        let packet = VariablePacket::UnsubackPacket(UnsubackPacket::new(3));
        assert_eq!(ack_for(&packet), Some(Ack::Unsubscribe(3)));
        assert_eq!(
            ack_for(&VariablePacket::PingrespPacket(PingrespPacket::new())),
            None
        );
    }

    #[test]
    fn connack_return_code_is_checked() {
        let accepted = VariablePacket::ConnackPacket(ConnackPacket::new(
            false,
            ConnectReturnCode::ConnectionAccepted,
        ));
        assert!(accept_connack(&accepted).is_ok());

        let refused = VariablePacket::ConnackPacket(ConnackPacket::new(
            false,
            ConnectReturnCode::NotAuthorized,
        ));
        assert!(matches!(
            accept_connack(&refused),
            Err(ProvisioningError::ConnectionRefused(_))
        ));

        let unexpected = VariablePacket::PingrespPacket(PingrespPacket::new());
        assert!(matches!(
            accept_connack(&unexpected),
            Err(ProvisioningError::Mqtt(_))
        ));
    }
}
