//! Build event store.
//!
//! Each build owns a gapless, append-only sequence of events numbered from 0.
//! Appends take the build's row lock to assign the next number, so sequence
//! order is commit order. Subscribers read through a [`BuildEvents`] cursor
//! that sleeps on the notification bus between reads.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use keel_core::event::EVENT_VERSION;
use keel_core::{BuildId, Event};
use sqlx::{PgConnection, PgPool};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{Listener, NotificationBus, notify_in};
use crate::{DbError, DbResult};

/// Events fetched per storage round trip.
const FETCH_BATCH: i64 = 100;

/// Bus topic signalled on every append to `build`.
pub fn build_events_topic(build: BuildId) -> String {
    format!("build_events_{}", build)
}

/// An event together with its position in the build's log.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildEvent {
    pub id: i64,
    pub event: Event,
}

#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: i64,
    #[sqlx(rename = "type")]
    kind: String,
    version: String,
    payload: serde_json::Value,
}

impl TryFrom<EventRow> for BuildEvent {
    type Error = DbError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(BuildEvent {
            id: row.event_id,
            event: Event::decode(&row.kind, &row.version, row.payload)?,
        })
    }
}

/// Append `event` to `build`'s log inside an open transaction.
///
/// Bumping `next_event_id` row-locks the build until the transaction ends,
/// which serializes concurrent appenders and keeps numbers gapless. The bus
/// notification is queued in the same transaction and fires on commit.
///
/// Fails with [`DbError::BuildCompleted`] once the build's log is closed.
pub(crate) async fn append_event(
    conn: &mut PgConnection,
    build: BuildId,
    event: &Event,
) -> DbResult<i64> {
    let (kind, payload) = event.encode()?;

    let event_id: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE builds SET next_event_id = next_event_id + 1
        WHERE id = $1 AND NOT completed
        RETURNING next_event_id - 1
        "#,
    )
    .bind(build.get())
    .fetch_optional(&mut *conn)
    .await?;

    let Some(event_id) = event_id else {
        let completed: Option<bool> =
            sqlx::query_scalar("SELECT completed FROM builds WHERE id = $1")
                .bind(build.get())
                .fetch_optional(&mut *conn)
                .await?;
        return Err(match completed {
            Some(_) => DbError::BuildCompleted(build),
            None => DbError::NotFound(format!("build {}", build)),
        });
    };

    sqlx::query(
        r#"
        INSERT INTO build_events (build_id, event_id, type, version, payload)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(build.get())
    .bind(event_id)
    .bind(kind)
    .bind(EVENT_VERSION)
    .bind(payload)
    .execute(&mut *conn)
    .await?;

    notify_in(conn, &build_events_topic(build)).await?;

    Ok(event_id)
}

/// Read access to stored build events.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Whether the build has reached a terminal status. `None` if there is no such build.
    async fn completed(&self, build: BuildId) -> DbResult<Option<bool>>;

    /// Up to `limit` events with `id >= from`, in order.
    async fn fetch(&self, build: BuildId, from: i64, limit: i64) -> DbResult<Vec<BuildEvent>>;
}

/// PostgreSQL implementation of EventLog.
pub struct PgEventLog {
    pool: PgPool,
}

impl PgEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn completed(&self, build: BuildId) -> DbResult<Option<bool>> {
        let completed: Option<bool> =
            sqlx::query_scalar("SELECT completed FROM builds WHERE id = $1")
                .bind(build.get())
                .fetch_optional(&self.pool)
                .await?;
        Ok(completed)
    }

    async fn fetch(&self, build: BuildId, from: i64, limit: i64) -> DbResult<Vec<BuildEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT event_id, type, version, payload
            FROM build_events
            WHERE build_id = $1 AND event_id >= $2
            ORDER BY event_id ASC
            LIMIT $3
            "#,
        )
        .bind(build.get())
        .bind(from)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BuildEvent::try_from).collect()
    }
}

struct CursorState {
    buffered: VecDeque<BuildEvent>,
    listener: Option<Listener>,
}

/// A subscriber's position in one build's event log.
///
/// `next` may be called from several tasks at once; each event is handed to
/// exactly one caller, in order. `close` wakes every waiting caller.
pub struct BuildEvents {
    build: BuildId,
    log: Arc<dyn EventLog>,
    poll_interval: Duration,
    position: AtomicI64,
    closed: CancellationToken,
    state: Mutex<CursorState>,
}

impl BuildEvents {
    /// Open a cursor on `build` positioned at event `from`.
    pub async fn subscribe(
        build: BuildId,
        from: i64,
        log: Arc<dyn EventLog>,
        bus: &NotificationBus,
    ) -> DbResult<Self> {
        // Listen before the first read so no append can slip between them.
        let listener = bus.listen(&build_events_topic(build)).await?;

        if log.completed(build).await?.is_none() {
            return Err(DbError::NotFound(format!("build {}", build)));
        }

        debug!(build_id = %build, from, "Subscribed to build events");

        Ok(Self {
            build,
            log,
            poll_interval: bus.config().poll_interval,
            position: AtomicI64::new(from.max(0)),
            closed: CancellationToken::new(),
            state: Mutex::new(CursorState {
                buffered: VecDeque::new(),
                listener: Some(listener),
            }),
        })
    }

    pub fn build_id(&self) -> BuildId {
        self.build
    }

    /// Sequence number of the next event to be delivered.
    pub fn position(&self) -> i64 {
        self.position.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Next event in sequence, waiting for it to be committed if necessary.
    ///
    /// Fails with `EndOfStream` once the build has finished and everything
    /// has been delivered, or with `StreamClosed` after `close`.
    pub async fn next(&self) -> DbResult<BuildEvent> {
        let mut state = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(DbError::StreamClosed),
            state = self.state.lock() => state,
        };

        loop {
            if self.closed.is_cancelled() {
                state.listener = None;
                return Err(DbError::StreamClosed);
            }

            if let Some(event) = state.buffered.pop_front() {
                self.position.store(event.id + 1, Ordering::SeqCst);
                return Ok(event);
            }

            // Read the flag first: the terminal status commits together with
            // the last event, so completed + nothing left means done.
            let completed = self
                .log
                .completed(self.build)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("build {}", self.build)))?;

            let events = self
                .log
                .fetch(self.build, self.position(), FETCH_BATCH)
                .await?;

            if !events.is_empty() {
                state.buffered.extend(events);
                continue;
            }

            if completed {
                return Err(DbError::EndOfStream);
            }

            tokio::select! {
                _ = self.closed.cancelled() => {
                    state.listener = None;
                    return Err(DbError::StreamClosed);
                }
                woken = wait_for_signal(state.listener.as_mut()) => {
                    if let Err(e) = woken {
                        warn!(build_id = %self.build, error = %e, "Lost build event notifications, polling");
                        state.listener = None;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Close the cursor. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
        if let Ok(mut state) = self.state.try_lock() {
            state.listener = None;
            state.buffered.clear();
        }
    }

    /// Consume the cursor as a stream that ends on end-of-stream or close.
    pub fn into_stream(self) -> BoxStream<'static, DbResult<BuildEvent>> {
        Box::pin(stream::unfold(Some(self), |cursor| async move {
            let cursor = cursor?;
            match cursor.next().await {
                Ok(event) => Some((Ok(event), Some(cursor))),
                Err(e) if e.is_stream_end() => None,
                Err(e) => Some((Err(e), None)),
            }
        }))
    }
}

impl Drop for BuildEvents {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn wait_for_signal(listener: Option<&mut Listener>) -> DbResult<()> {
    match listener {
        Some(listener) => listener.recv().await,
        None => std::future::pending().await,
    }
}
