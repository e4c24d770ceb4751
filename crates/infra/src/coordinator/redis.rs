//! Redis-backed coordinator.
//!
//! Uses a single multiplexed async connection, opened on first use and shared
//! by all callers. When a command fails at the connection level the handle is
//! dropped so the next call reconnects.
//!
//! Compound operations run as Lua scripts so they stay atomic across workers:
//! - `increment_counter`: `INCR` + `EXPIRE` on first increment
//! - `increment_if_below`: read, compare, `INCR`
//! - `replace_value`: compare-and-set
//! - `release_lock` / `extend_lock`: owner-token check, then `DEL` / `EXPIRE`

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;

use super::r#trait::{lock_key, ttl_secs, Coordinator, CoordinatorError};

const INCREMENT_WITH_TTL: &str = r#"
local v = redis.call('INCR', KEYS[1])
if v == 1 and tonumber(ARGV[1]) > 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return v
"#;

const INCREMENT_IF_BELOW: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
  return 0
end
redis.call('INCR', KEYS[1])
return 1
"#;

const COMPARE_AND_SET: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 0
end
if tonumber(ARGV[3]) > 0 then
  redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
else
  redis.call('SET', KEYS[1], ARGV[2])
end
return 1
"#;

const RELEASE_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

const EXTEND_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

struct Scripts {
    increment_with_ttl: redis::Script,
    increment_if_below: redis::Script,
    compare_and_set: redis::Script,
    release_if_owner: redis::Script,
    extend_if_owner: redis::Script,
}

pub struct RedisCoordinator {
    client: redis::Client,
    url: String,
    conn: Mutex<Option<MultiplexedConnection>>,
    scripts: Scripts,
}

impl fmt::Debug for RedisCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCoordinator")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl RedisCoordinator {
    /// Create a coordinator for `redis_url` (e.g. `redis://localhost:6379/0`).
    ///
    /// Only the URL is validated here; the connection is opened lazily.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, CoordinatorError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CoordinatorError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            url: redis_url.as_ref().to_string(),
            conn: Mutex::new(None),
            scripts: Scripts {
                increment_with_ttl: redis::Script::new(INCREMENT_WITH_TTL),
                increment_if_below: redis::Script::new(INCREMENT_IF_BELOW),
                compare_and_set: redis::Script::new(COMPARE_AND_SET),
                release_if_owner: redis::Script::new(RELEASE_IF_OWNER),
                extend_if_owner: redis::Script::new(EXTEND_IF_OWNER),
            },
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, CoordinatorError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CoordinatorError::Connection(e.to_string()))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn fail(&self, err: redis::RedisError) -> CoordinatorError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            tracing::warn!(error = %err, "redis connection lost; will reconnect on next call");
            *self.conn.lock().await = None;
            CoordinatorError::Connection(err.to_string())
        } else {
            CoordinatorError::Command(err.to_string())
        }
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, CoordinatorError> {
        let mut conn = self.connection().await?;
        match cmd.query_async(&mut conn).await {
            Ok(v) => Ok(v),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn invoke<T: redis::FromRedisValue>(
        &self,
        invocation: &redis::ScriptInvocation<'_>,
    ) -> Result<T, CoordinatorError> {
        let mut conn = self.connection().await?;
        match invocation.invoke_async(&mut conn).await {
            Ok(v) => Ok(v),
            Err(e) => Err(self.fail(e).await),
        }
    }
}

fn set_cmd(key: &str, value: &str, ttl: Option<Duration>, only_if_absent: bool) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    if only_if_absent {
        cmd.arg("NX");
    }
    if let Some(ttl) = ttl {
        cmd.arg("EX").arg(ttl_secs(ttl));
    }
    cmd
}

fn parse_counter(key: &str, raw: Option<String>) -> Result<i64, CoordinatorError> {
    match raw {
        None => Ok(0),
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| CoordinatorError::InvalidValue(format!("{key} is not an integer"))),
    }
}

#[async_trait]
impl Coordinator for RedisCoordinator {
    async fn ping(&self) -> Result<(), CoordinatorError> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>, CoordinatorError> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set_value(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CoordinatorError> {
        let _: Option<String> = self.query(&set_cmd(key, value, ttl, false)).await?;
        Ok(())
    }

    async fn set_value_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CoordinatorError> {
        // SET NX replies OK on success and nil when the key already exists.
        let reply: Option<String> = self.query(&set_cmd(key, value, ttl, true)).await?;
        Ok(reply.is_some())
    }

    async fn replace_value(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CoordinatorError> {
        let mut invocation = self.scripts.compare_and_set.prepare_invoke();
        invocation
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(ttl.map(ttl_secs).unwrap_or(0));
        let written: i64 = self.invoke(&invocation).await?;
        Ok(written == 1)
    }

    async fn delete_value(&self, key: &str) -> Result<(), CoordinatorError> {
        let _: i64 = self.query(redis::cmd("DEL").arg(key)).await?;
        Ok(())
    }

    async fn increment_counter(
        &self,
        key: &str,
        ttl: Option<Duration>,
    ) -> Result<i64, CoordinatorError> {
        let mut invocation = self.scripts.increment_with_ttl.prepare_invoke();
        invocation.key(key).arg(ttl.map(ttl_secs).unwrap_or(0));
        self.invoke(&invocation).await
    }

    async fn decrement_counter(&self, key: &str) -> Result<i64, CoordinatorError> {
        self.query(redis::cmd("DECR").arg(key)).await
    }

    async fn get_counter(&self, key: &str) -> Result<i64, CoordinatorError> {
        let raw: Option<String> = self.query(redis::cmd("GET").arg(key)).await?;
        parse_counter(key, raw)
    }

    async fn increment_if_below(&self, key: &str, ceiling: i64) -> Result<bool, CoordinatorError> {
        let mut invocation = self.scripts.increment_if_below.prepare_invoke();
        invocation.key(key).arg(ceiling);
        let admitted: i64 = self.invoke(&invocation).await?;
        Ok(admitted == 1)
    }

    async fn try_acquire_lock(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinatorError> {
        self.set_value_if_absent(&lock_key(name), token, Some(ttl)).await
    }

    async fn release_lock(&self, name: &str, token: &str) -> Result<bool, CoordinatorError> {
        let mut invocation = self.scripts.release_if_owner.prepare_invoke();
        invocation.key(lock_key(name)).arg(token);
        let deleted: i64 = self.invoke(&invocation).await?;
        Ok(deleted == 1)
    }

    async fn extend_lock(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinatorError> {
        let mut invocation = self.scripts.extend_if_owner.prepare_invoke();
        invocation.key(lock_key(name)).arg(token).arg(ttl_secs(ttl));
        let extended: i64 = self.invoke(&invocation).await?;
        Ok(extended == 1)
    }
}
