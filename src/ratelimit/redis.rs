//! Redis counter store.
//!
//! Every operation runs as a Lua script so that increment, first-time
//! expiry and the TTL read happen in one atomic step on the server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fred::prelude::*;
use fred::types::FromValue;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::store::{CounterStore, StoreError, WindowCounter};

/// INCR the counter; set the window expiry when the key is new, or when it
/// somehow lost its TTL. ARGV[1] is the window in milliseconds. Returns
/// `{count, ttl_millis}`.
const INCREMENT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
";

/// Read the counter and its TTL in milliseconds. Returns `{0, -2}` for a
/// missing key.
const PEEK_SCRIPT: &str = r"
local count = redis.call('GET', KEYS[1])
if not count then
    return {0, -2}
end
return {tonumber(count), redis.call('PTTL', KEYS[1])}
";

/// Delete every key matching the pattern in ARGV[1]. Returns the number removed.
const PURGE_SCRIPT: &str = r"
local cursor = '0'
local removed = 0
repeat
    local reply = redis.call('SCAN', cursor, 'MATCH', ARGV[1], 'COUNT', 500)
    cursor = reply[1]
    for _, key in ipairs(reply[2]) do
        removed = removed + redis.call('DEL', key)
    end
until cursor == '0'
return removed
";

/// Redis PTTL reply for a key that does not exist.
const TTL_KEY_NOT_FOUND: i64 = -2;

#[derive(Clone, Copy)]
enum Script {
    Increment,
    Peek,
    Purge,
}

impl Script {
    fn source(self) -> &'static str {
        match self {
            Script::Increment => INCREMENT_SCRIPT,
            Script::Peek => PEEK_SCRIPT,
            Script::Purge => PURGE_SCRIPT,
        }
    }
}

/// Script SHAs for Lua scripts loaded in Redis.
#[derive(Clone, Default)]
struct ScriptShas {
    increment: String,
    peek: String,
    purge: String,
}

impl ScriptShas {
    fn get(&self, script: Script) -> String {
        match script {
            Script::Increment => self.increment.clone(),
            Script::Peek => self.peek.clone(),
            Script::Purge => self.purge.clone(),
        }
    }
}

/// A counter store backed by Redis (or any server speaking its protocol).
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    scripts: Arc<RwLock<ScriptShas>>,
}

impl RedisStore {
    /// Connect to the server at `url` and load the scripts.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let config = Config::from_url(url).map_err(map_redis_error)?;
        let client = Client::new(config, None, None, None);
        client.connect();
        client.wait_for_connect().await.map_err(map_redis_error)?;

        info!(url = %url, "Connected to Redis");
        Self::from_client(client).await
    }

    /// Wrap an already connected client and load the scripts.
    pub async fn from_client(client: Client) -> Result<Self, StoreError> {
        let store = Self {
            client,
            scripts: Arc::new(RwLock::new(ScriptShas::default())),
        };
        store.load_scripts().await?;
        Ok(store)
    }

    /// The underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Loads or reloads Lua scripts into Redis.
    ///
    /// Called on construction and when NOSCRIPT errors are encountered.
    async fn load_scripts(&self) -> Result<(), StoreError> {
        let increment: String = self
            .client
            .script_load(INCREMENT_SCRIPT)
            .await
            .map_err(map_redis_error)?;
        let peek: String = self
            .client
            .script_load(PEEK_SCRIPT)
            .await
            .map_err(map_redis_error)?;
        let purge: String = self
            .client
            .script_load(PURGE_SCRIPT)
            .await
            .map_err(map_redis_error)?;

        info!(
            increment_sha = %increment,
            peek_sha = %peek,
            purge_sha = %purge,
            "Lua scripts loaded into Redis"
        );

        *self.scripts.write() = ScriptShas {
            increment,
            peek,
            purge,
        };
        Ok(())
    }

    /// Checks if an error is a NOSCRIPT error (script not found in Redis).
    fn is_noscript_error(error: &Error) -> bool {
        error.to_string().contains("NOSCRIPT")
    }

    /// Runs a loaded script, reloading the script cache once if the server
    /// forgot it (restart, SCRIPT FLUSH, failover).
    async fn run<R>(&self, script: Script, keys: Vec<String>, args: Vec<String>) -> Result<R, StoreError>
    where
        R: FromValue,
    {
        let sha = self.scripts.read().get(script);
        let result: Result<R, Error> = self.client.evalsha(&sha, keys.clone(), args.clone()).await;

        match result {
            Ok(value) => Ok(value),
            Err(e) if Self::is_noscript_error(&e) => {
                warn!("NOSCRIPT error, reloading Lua scripts");
                if let Err(e) = self.load_scripts().await {
                    warn!(error = %e, "Failed to reload scripts, falling back to EVAL");
                    return self
                        .client
                        .eval(script.source(), keys, args)
                        .await
                        .map_err(map_redis_error);
                }

                let new_sha = self.scripts.read().get(script);
                self.client
                    .evalsha(&new_sha, keys, args)
                    .await
                    .map_err(map_redis_error)
            }
            Err(e) => Err(map_redis_error(e)),
        }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCounter, StoreError> {
        let window_millis = window.as_millis().max(1);
        let reply: Vec<i64> = self
            .run(
                Script::Increment,
                vec![key.to_string()],
                vec![window_millis.to_string()],
            )
            .await?;

        let (count, ttl) = counter_pair(&reply)?;
        debug!(key = %key, count = count, ttl_ms = ttl, "Redis counter incremented");

        Ok(WindowCounter {
            count: count.max(0) as u64,
            ttl: Duration::from_millis(ttl.max(0) as u64),
        })
    }

    async fn peek(&self, key: &str) -> Result<Option<WindowCounter>, StoreError> {
        let reply: Vec<i64> = self
            .run(Script::Peek, vec![key.to_string()], Vec::new())
            .await?;

        let (count, ttl) = counter_pair(&reply)?;
        if ttl == TTL_KEY_NOT_FOUND {
            return Ok(None);
        }

        Ok(Some(WindowCounter {
            count: count.max(0) as u64,
            ttl: Duration::from_millis(ttl.max(0) as u64),
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .del::<i64, _>(key)
            .await
            .map(|_| ())
            .map_err(map_redis_error)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let pattern = format!("{}*", escape_glob(prefix));
        let removed: i64 = self.run(Script::Purge, Vec::new(), vec![pattern]).await?;
        Ok(removed.max(0) as u64)
    }
}

fn counter_pair(reply: &[i64]) -> Result<(i64, i64), StoreError> {
    match reply {
        [count, ttl] => Ok((*count, *ttl)),
        other => Err(StoreError::Protocol(format!(
            "expected {{count, ttl}} from script, got {} values",
            other.len()
        ))),
    }
}

/// Escape the glob characters SCAN MATCH understands.
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn map_redis_error(err: Error) -> StoreError {
    match err.kind() {
        ErrorKind::IO | ErrorKind::Canceled | ErrorKind::Timeout | ErrorKind::Backpressure => {
            StoreError::Unavailable(err.to_string())
        }
        _ => StoreError::Protocol(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Redis URL for the ignored tests, overridable through `REDIS_URL`.
    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn test_prefix() -> String {
        format!("test:ratekeeper:{}", uuid::Uuid::new_v4())
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("ratelimit:auth"), "ratelimit:auth");
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }

    #[test]
    fn test_counter_pair() {
        assert_eq!(counter_pair(&[3, 42]).unwrap(), (3, 42));
        assert!(matches!(counter_pair(&[3]), Err(StoreError::Protocol(_))));
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_increment_and_peek() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let prefix = test_prefix();
        let key = format!("{prefix}:ip:1.2.3.4");

        let first = store.increment(&key, Duration::from_secs(60)).await.unwrap();
        let second = store.increment(&key, Duration::from_secs(60)).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert!(second.ttl <= Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let peeked = store.peek(&key).await.unwrap().unwrap();
        assert_eq!(peeked.count, 2);
        // Millisecond precision, not whole seconds
        assert!(peeked.ttl > Duration::from_secs(59));
        assert!(peeked.ttl < Duration::from_secs(60));

        store.delete(&key).await.unwrap();
        assert_eq!(store.peek(&key).await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_window_expires() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let key = format!("{}:ip:5.6.7.8", test_prefix());

        store.increment(&key, Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2100)).await;

        let counter = store.increment(&key, Duration::from_secs(1)).await.unwrap();
        assert_eq!(counter.count, 1);
        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_reloads_flushed_scripts() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let key = format!("{}:ip:9.9.9.9", test_prefix());

        let _: () = store.client().script_flush(false).await.unwrap();

        let counter = store.increment(&key, Duration::from_secs(60)).await.unwrap();
        assert_eq!(counter.count, 1);
        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_delete_prefix() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let prefix = test_prefix();

        for ip in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
            store
                .increment(&format!("{prefix}:ip:{ip}"), Duration::from_secs(60))
                .await
                .unwrap();
        }

        assert_eq!(store.delete_prefix(&prefix).await.unwrap(), 3);
        assert_eq!(store.delete_prefix(&prefix).await.unwrap(), 0);
    }
}
