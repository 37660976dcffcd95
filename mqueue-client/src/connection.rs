//! Connection management for the MQueue client

use crate::config::ClientConfig;
use crate::error::MqClientError;
use crate::Result;
use mqueue::{Connection, DeliveryOutcome, Packet, Role, Welcome};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// One handshaken connection to a broker
#[derive(Debug)]
pub struct BrokerConnection {
    broker: String,
    conn: Connection<TcpStream>,
    welcome: Welcome,
    request_timeout: Duration,
}

impl BrokerConnection {
    /// Connect to the first broker that accepts, in configuration order
    pub async fn connect(config: &ClientConfig, role: Role) -> Result<Self> {
        let mut last_error = MqClientError::NoBrokersAvailable;
        for broker in &config.brokers {
            match Self::open(broker, config, role).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!("Failed to connect to broker {}: {}", broker, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// [`connect`](Self::connect) under the configured retry budget.
    pub async fn connect_with_retry(config: &ClientConfig, role: Role) -> Result<Self> {
        let policy = config.retry_config.policy();
        let outcome =
            mqueue::deliver_with_retry(&policy, |_| Self::connect(config, role)).await;
        match outcome {
            DeliveryOutcome::Delivered(conn) => Ok(conn),
            DeliveryOutcome::Rejected(e) => Err(e),
            DeliveryOutcome::Exhausted {
                attempts,
                last_error,
            } => Err(MqClientError::Exhausted {
                attempts,
                last_error: Box::new(last_error),
            }),
        }
    }

    async fn open(broker: &str, config: &ClientConfig, role: Role) -> Result<Self> {
        debug!("Creating connection to broker: {}", broker);

        let stream = timeout(config.connection_timeout, TcpStream::connect(broker))
            .await
            .map_err(|_| MqClientError::timeout(config.connection_timeout.as_millis() as u64))?
            .map_err(|source| MqClientError::Connect {
                broker: broker.to_string(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", broker, e);
        }

        let mut conn = Connection::new(0, broker, stream, config.max_message_size);
        let welcome = match conn
            .greet(role, config.client_id(), config.connection_timeout)
            .await
        {
            Ok(welcome) => welcome,
            Err(e) => {
                conn.close().await;
                return Err(e.into());
            }
        };
        conn.set_max_message_size(welcome.max_message_size as usize);

        info!(
            "Connected to broker {} as {} (connection {}, max message size {})",
            broker, role, welcome.connection_id, welcome.max_message_size
        );
        Ok(Self {
            broker: broker.to_string(),
            conn,
            welcome,
            request_timeout: config.request_timeout,
        })
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn id(&self) -> u64 {
        self.welcome.connection_id
    }

    /// Limits the broker announced in `Welcome`
    pub fn welcome(&self) -> Welcome {
        self.welcome
    }

    pub fn max_message_size(&self) -> usize {
        self.conn.max_message_size()
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    /// Send a request and wait for its reply within the request timeout.
    pub async fn request(&mut self, packet: Packet) -> Result<Packet> {
        self.request_within(packet, self.request_timeout).await
    }

    /// Like [`request`](Self::request) with an explicit reply deadline.
    /// `Error` replies are converted into [`MqClientError::Broker`].
    pub async fn request_within(&mut self, packet: Packet, limit: Duration) -> Result<Packet> {
        match self.conn.request(packet, limit).await? {
            Packet::Error { code, message } => Err(MqClientError::from_broker(code, message)),
            reply => Ok(reply),
        }
    }

    /// Say goodbye and close. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.conn.is_open() {
            if let Err(e) = self.conn.send(Packet::Goodbye).await {
                debug!("Goodbye to {} failed: {}", self.broker, e);
            }
        }
        self.conn.close().await;
    }
}

/// A lazily (re)connected broker connection for one role.
///
/// A request that fails with a retryable error drops the connection, so a
/// late reply can never be mistaken for the answer to the next request.
#[derive(Debug)]
pub(crate) struct Session {
    config: ClientConfig,
    role: Role,
    conn: Option<BrokerConnection>,
}

impl Session {
    pub(crate) async fn connect(config: ClientConfig, role: Role) -> Result<Self> {
        config.validate()?;
        let conn = BrokerConnection::connect_with_retry(&config, role).await?;
        Ok(Self {
            config,
            role,
            conn: Some(conn),
        })
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn connection(&self) -> Option<&BrokerConnection> {
        self.conn.as_ref()
    }

    async fn ensure_connected(&mut self) -> Result<&mut BrokerConnection> {
        let connected = matches!(&self.conn, Some(conn) if conn.is_open());
        if !connected {
            self.reset().await;
            let conn = BrokerConnection::connect(&self.config, self.role).await?;
            self.conn = Some(conn);
        }
        self.conn.as_mut().ok_or(MqClientError::NoBrokersAvailable)
    }

    pub(crate) async fn request(&mut self, packet: Packet) -> Result<Packet> {
        let limit = self.config.request_timeout;
        self.request_within(packet, limit).await
    }

    pub(crate) async fn request_within(&mut self, packet: Packet, limit: Duration) -> Result<Packet> {
        let conn = self.ensure_connected().await?;
        let result = conn.request_within(packet, limit).await;
        if let Err(e) = &result {
            if e.is_retryable() {
                self.reset().await;
            }
        }
        result
    }

    pub(crate) async fn reset(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
    }
}
