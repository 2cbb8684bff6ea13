//! The thin client wrapping a connection pool: parameterized SQL execution
//! plus the long-lived LISTEN stream workers wake up on.

use std::collections::VecDeque;
use std::time::Duration;

use envconfig::Envconfig;
use futures::stream::{BoxStream, StreamExt};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use tokio::time::MissedTickBehavior;

use crate::error::{map_sqlx_error, JobManagerResult};

const DEFAULT_LISTEN_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Environment-driven configuration for a `Connector`, following the same
/// `envconfig::Envconfig` + `init_from_env` convenience the rest of the
/// workspace's binaries use for their own `Config` structs.
#[derive(Envconfig, Clone, Debug)]
pub struct ConnectorConfig {
    #[envconfig(from = "DATABASE_URL")]
    pub database_url: String,

    #[envconfig(from = "DATABASE_MAX_CONNECTIONS", default = "10")]
    pub max_connections: u32,

    #[envconfig(from = "DATABASE_APPLICATION_NAME", default = "job-manager")]
    pub application_name: String,

    /// How often `listen` re-announces every subscribed channel, covering
    /// a `NOTIFY` lost during a connection drop and resubscribe.
    #[envconfig(from = "DATABASE_LISTEN_POLL_INTERVAL_SECONDS", default = "10")]
    pub listen_poll_interval_seconds: u64,
}

/// A notification received on a subscribed channel. Payload is always
/// empty: the channel name alone tells the worker which queue to
/// re-attempt `fetch_job` against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
}

/// The connector: owns the pool used for procedure calls, and knows how to
/// open a LISTEN stream against the same database.
#[derive(Clone)]
pub struct Connector {
    pool: PgPool,
    listen_poll_interval: Duration,
}

impl Connector {
    /// Connect using an already-loaded configuration.
    pub async fn new(config: &ConnectorConfig) -> JobManagerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await
            .map_err(|error| {
                tracing::error!("failed to connect to {}: {error}", config.application_name);
                map_sqlx_error(error)
            })?;

        Ok(Self {
            pool,
            listen_poll_interval: Duration::from_secs(config.listen_poll_interval_seconds.max(1)),
        })
    }

    /// Wrap an already-constructed pool, e.g. one shared with other parts
    /// of an embedding application, or one built by `sqlx::test`. Uses the
    /// default listen-poll interval since there is no `ConnectorConfig` to
    /// read one from.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            listen_poll_interval: DEFAULT_LISTEN_POLL_INTERVAL,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Trivial connectivity probe backing `JobManager::check_connection`.
    pub async fn check_connection(&self) -> JobManagerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    /// Open a long-lived listener subscribed to `queue#<name>` for every
    /// name in `queue_names`. Returns a stream of `Notification`s combining
    /// two sources: real `NOTIFY` payloads delivered through
    /// `PgListener::recv()`, and a periodic re-announcement of every
    /// channel in `queue_names` (every `listen_poll_interval`), so a
    /// caller that retries `fetch_job` on each item from this stream is
    /// not left waiting forever on a `NOTIFY` lost during a connection
    /// drop and resubscribe. The underlying `PgListener` transparently
    /// reconnects and re-subscribes all of its channels if the connection
    /// drops, so callers never see that as a terminal stream error.
    pub async fn listen(&self, queue_names: &[String]) -> JobManagerResult<BoxStream<'static, JobManagerResult<Notification>>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        for queue_name in queue_names {
            listener
                .listen(&notify_channel(queue_name))
                .await
                .map_err(map_sqlx_error)?;
        }

        tracing::debug!("listening for notifications on {} queue(s)", queue_names.len());

        let mut interval = tokio::time::interval(self.listen_poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let queue_names = queue_names.to_vec();
        let pending: VecDeque<String> = VecDeque::new();

        let stream = futures::stream::unfold(
            (listener, interval, queue_names, pending),
            |(mut listener, mut interval, queue_names, mut pending)| async move {
                loop {
                    if let Some(channel) = pending.pop_front() {
                        return Some((
                            Ok(Notification { channel }),
                            (listener, interval, queue_names, pending),
                        ));
                    }

                    tokio::select! {
                        received = listener.recv() => {
                            return Some(match received {
                                Ok(notification) => (
                                    Ok(Notification { channel: notification.channel().to_owned() }),
                                    (listener, interval, queue_names, pending),
                                ),
                                Err(error) => {
                                    tracing::error!("notification stream error: {error}");
                                    (Err(map_sqlx_error(error)), (listener, interval, queue_names, pending))
                                }
                            });
                        }
                        _ = interval.tick() => {
                            tracing::trace!("periodic re-check tick for {} queue(s)", queue_names.len());
                            pending.extend(queue_names.iter().cloned());
                        }
                    }
                }
            },
        );

        Ok(stream.boxed())
    }
}

/// The channel name a given queue's notifications are posted to. Must be
/// quoted by `LISTEN`/`NOTIFY` callers since queue names are arbitrary
/// strings.
pub fn notify_channel(queue_name: &str) -> String {
    format!("queue#{queue_name}")
}
