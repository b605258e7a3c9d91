//! Notification bus.
//!
//! Multiplexes many logical topics over one physical `LISTEN` connection.
//! A background task owns the connection and fans incoming notifications out
//! to every registered [`Listener`]. Publishing goes through `pg_notify`, so a
//! notification sent by one process reaches listeners in every process
//! connected to the same database.

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{DbError, DbResult};

/// Tuning for the bus connection and for subscribers that rely on it.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// First delay before retrying a failed connection.
    pub min_reconnect_interval: Duration,
    /// Upper bound for the exponential reconnect backoff.
    pub max_reconnect_interval: Duration,
    /// How often cursors re-check storage when no notification arrives.
    pub poll_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            min_reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// What the physical channel reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// A topic was notified.
    Notification(String),
    /// The connection dropped. Notifications may have been missed.
    ConnectionLost,
}

/// The receiving side of the store's change-notification primitive.
#[async_trait]
pub trait Channel: Send + 'static {
    async fn listen(&mut self, topic: &str) -> DbResult<()>;
    async fn unlisten(&mut self, topic: &str) -> DbResult<()>;

    /// Wait for the next signal. Must be cancel-safe.
    async fn recv(&mut self) -> DbResult<Signal>;

    /// Stop listening on every topic before the channel is dropped.
    async fn close(&mut self) -> DbResult<()> {
        Ok(())
    }
}

/// The publishing side of the store's change-notification primitive.
#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    async fn publish(&self, topic: &str) -> DbResult<()>;
}

/// `LISTEN`/`NOTIFY` channel on a dedicated PostgreSQL connection.
///
/// `PgListener` reconnects and re-issues `LISTEN` for every channel on its
/// own; it reports the gap as `Ok(None)` from `try_recv`.
pub struct PgChannel {
    listener: PgListener,
}

impl PgChannel {
    pub async fn connect(pool: &PgPool) -> DbResult<Self> {
        let listener = PgListener::connect_with(pool).await?;
        Ok(Self { listener })
    }
}

#[async_trait]
impl Channel for PgChannel {
    async fn listen(&mut self, topic: &str) -> DbResult<()> {
        self.listener.listen(topic).await?;
        Ok(())
    }

    async fn unlisten(&mut self, topic: &str) -> DbResult<()> {
        self.listener.unlisten(topic).await?;
        Ok(())
    }

    async fn recv(&mut self) -> DbResult<Signal> {
        match self.listener.try_recv().await? {
            Some(notification) => Ok(Signal::Notification(notification.channel().to_string())),
            None => Ok(Signal::ConnectionLost),
        }
    }

    async fn close(&mut self) -> DbResult<()> {
        self.listener.unlisten_all().await?;
        Ok(())
    }
}

#[async_trait]
impl Publisher for PgPool {
    async fn publish(&self, topic: &str) -> DbResult<()> {
        sqlx::query("SELECT pg_notify($1, '')")
            .bind(topic)
            .execute(self)
            .await?;
        Ok(())
    }
}

/// Queue a notification inside an open transaction.
///
/// PostgreSQL delivers it only if and when the transaction commits.
pub async fn notify_in(conn: &mut PgConnection, topic: &str) -> DbResult<()> {
    sqlx::query("SELECT pg_notify($1, '')")
        .bind(topic)
        .execute(conn)
        .await?;
    Ok(())
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    topics: HashMap<String, HashMap<u64, mpsc::Sender<()>>>,
}

impl Registry {
    fn wake(&self, topic: &str) -> usize {
        match self.topics.get(topic) {
            Some(waiters) => {
                for waiter in waiters.values() {
                    // Full means a wakeup is already pending.
                    let _ = waiter.try_send(());
                }
                waiters.len()
            }
            None => 0,
        }
    }

    fn wake_all(&self) {
        for topic in self.topics.keys() {
            self.wake(topic);
        }
    }
}

type SharedRegistry = Arc<Mutex<Registry>>;

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Command {
    Listen {
        topic: String,
        reply: oneshot::Sender<DbResult<()>>,
    },
    Unlisten {
        topic: String,
    },
}

/// Process-wide pub/sub over the store's notification channel.
///
/// Cheap to clone; clones share the same physical connection.
#[derive(Clone)]
pub struct NotificationBus {
    publisher: Arc<dyn Publisher>,
    registry: SharedRegistry,
    commands: mpsc::UnboundedSender<Command>,
    config: BusConfig,
    shutdown: CancellationToken,
    stopped: CancellationToken,
}

impl NotificationBus {
    /// Open a dedicated listening connection and start the bus.
    pub async fn connect(pool: &PgPool, config: BusConfig) -> DbResult<Self> {
        let channel = PgChannel::connect(pool).await?;
        info!("Notification bus connected");
        Ok(Self::start(channel, Arc::new(pool.clone()), config))
    }

    /// Start a bus over any channel. Must be called within a tokio runtime.
    pub fn start<C: Channel>(channel: C, publisher: Arc<dyn Publisher>, config: BusConfig) -> Self {
        let registry = SharedRegistry::default();
        let (commands, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let stopped = CancellationToken::new();

        tokio::spawn(run(
            channel,
            registry.clone(),
            rx,
            config.clone(),
            shutdown.clone(),
            stopped.clone(),
        ));

        Self {
            publisher,
            registry,
            commands,
            config,
            shutdown,
            stopped,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Best-effort broadcast to every listener of `topic`, in any process.
    pub async fn notify(&self, topic: &str) -> DbResult<()> {
        self.publisher.publish(topic).await
    }

    /// Register interest in `topic`.
    ///
    /// Returns once the physical channel is listening, so a notification sent
    /// after this call completes is guaranteed to wake the returned handle.
    pub async fn listen(&self, topic: &str) -> DbResult<Listener> {
        if self.is_closed() {
            return Err(DbError::BusClosed);
        }
        let (tx, rx) = mpsc::channel(1);

        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry
                .topics
                .entry(topic.to_string())
                .or_default()
                .insert(id, tx);
            id
        };

        // Dropping this on an early return unregisters it again.
        let listener = Listener {
            topic: topic.to_string(),
            id,
            rx,
            registry: self.registry.clone(),
            commands: self.commands.clone(),
        };

        let (reply, ack) = oneshot::channel();
        self.commands
            .send(Command::Listen {
                topic: topic.to_string(),
                reply,
            })
            .map_err(|_| DbError::BusClosed)?;
        ack.await.map_err(|_| DbError::BusClosed)??;

        Ok(listener)
    }

    /// Stop the bus for every clone and release its connection.
    ///
    /// Pending and future [`Listener::recv`] calls fail with `BusClosed`, as
    /// do later calls to [`NotificationBus::listen`]. Returns once the
    /// background task has dropped the channel. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.stopped.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of topics with at least one listener.
    pub fn topic_count(&self) -> usize {
        lock(&self.registry).topics.len()
    }
}

/// Interest in one topic. Dropping the handle releases it.
pub struct Listener {
    topic: String,
    id: u64,
    rx: mpsc::Receiver<()>,
    registry: SharedRegistry,
    commands: mpsc::UnboundedSender<Command>,
}

impl Listener {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait until the topic is notified.
    ///
    /// Notifications that arrive while nobody is waiting collapse into a
    /// single pending wakeup. Fails with `BusClosed` once the bus has stopped.
    pub async fn recv(&mut self) -> DbResult<()> {
        self.rx.recv().await.ok_or(DbError::BusClosed)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let mut registry = lock(&self.registry);

        let emptied = match registry.topics.get_mut(&self.topic) {
            Some(waiters) => {
                waiters.remove(&self.id);
                waiters.is_empty()
            }
            None => false,
        };

        if emptied {
            registry.topics.remove(&self.topic);
            let _ = self.commands.send(Command::Unlisten {
                topic: self.topic.clone(),
            });
        }
    }
}

/// Owns the physical channel until the bus is closed or every bus handle
/// and listener is gone.
async fn run<C: Channel>(
    mut channel: C,
    registry: SharedRegistry,
    mut commands: mpsc::UnboundedReceiver<Command>,
    config: BusConfig,
    shutdown: CancellationToken,
    stopped: CancellationToken,
) {
    let mut backoff = config.min_reconnect_interval;
    let mut recovering = false;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            command = commands.recv() => {
                let Some(command) = command else { break };

                match command {
                    Command::Listen { topic, reply } => {
                        let result = channel.listen(&topic).await;
                        if let Err(e) = &result {
                            warn!(topic = %topic, error = %e, "Failed to listen");
                        }
                        let _ = reply.send(result);
                    }
                    Command::Unlisten { topic } => {
                        // Someone may have listened again since the request was queued.
                        let relistened = lock(&registry).topics.contains_key(&topic);
                        if relistened {
                            continue;
                        }
                        if let Err(e) = channel.unlisten(&topic).await {
                            warn!(topic = %topic, error = %e, "Failed to unlisten");
                        }
                    }
                }
            }
            signal = channel.recv() => match signal {
                Ok(Signal::Notification(topic)) => {
                    backoff = config.min_reconnect_interval;
                    if recovering {
                        recovering = false;
                        info!("Notification connection restored");
                        lock(&registry).wake_all();
                    }
                    let woken = lock(&registry).wake(&topic);
                    debug!(topic = %topic, woken, "Notification received");
                }
                Ok(Signal::ConnectionLost) => {
                    warn!("Notification connection lost, waking all listeners");
                    recovering = true;
                    lock(&registry).wake_all();
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?backoff, "Notification connection failed");
                    recovering = true;
                    lock(&registry).wake_all();
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(config.max_reconnect_interval);
                }
            }
        }
    }

    // Dropping the senders fails every pending `Listener::recv` with `BusClosed`.
    lock(&registry).topics.clear();
    commands.close();

    if let Err(e) = channel.close().await {
        warn!(error = %e, "Failed to release notification connection");
    }
    drop(channel);
    stopped.cancel();
    debug!("Notification bus stopped");
}
