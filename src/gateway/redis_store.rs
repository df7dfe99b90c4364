use async_trait::async_trait;

use super::limits::{CounterStore, CounterStoreError, WindowCheck, WindowDecision};

// KEYS[i] pairs with ARGV[2i] (limit) and ARGV[2i+1] (amount); ARGV[1] is the TTL.
// Returns {0, 0} when allowed, {i, current} for the first counter that would overflow,
// {-1, 0} on malformed arguments.
const WINDOW_SCRIPT: &str = r#"
local ttl = tonumber(ARGV[1]) or 0
for i = 1, #KEYS do
  local limit = tonumber(ARGV[i * 2])
  local amount = tonumber(ARGV[i * 2 + 1])
  if limit == nil or amount == nil then
    return { -1, 0 }
  end
  local current = tonumber(redis.call("GET", KEYS[i]) or "0") or 0
  if limit <= 0 or current + amount > limit then
    return { i, current }
  end
end

for i = 1, #KEYS do
  local amount = tonumber(ARGV[i * 2 + 1])
  redis.call("INCRBY", KEYS[i], amount)
  if ttl > 0 then
    redis.call("EXPIRE", KEYS[i], ttl)
  end
end
return { 0, 0 }
"#;

#[derive(Clone, Debug)]
pub struct RedisCounterStore {
    client: redis::Client,
    prefix: String,
}

impl RedisCounterStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, CounterStoreError> {
        let client = redis::Client::open(url.as_ref())
            .map_err(|err| CounterStoreError::Unavailable(format!("redis error: {err}")))?;
        Ok(Self {
            client,
            prefix: "conduit".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    fn window_key(&self, key: &str, window_start: u64) -> String {
        format!("{}:rate_limit:{key}:{window_start}", self.prefix)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn check_and_increment(
        &self,
        window_start: u64,
        window_seconds: u64,
        checks: &[WindowCheck],
    ) -> Result<WindowDecision, CounterStoreError> {
        if checks.is_empty() {
            return Ok(WindowDecision::Allowed);
        }

        let mut conn = self
            .connection()
            .await
            .map_err(|err| CounterStoreError::Unavailable(format!("redis error: {err}")))?;

        // Keep the keys around for one extra window so late readers still see them.
        let ttl = window_seconds.saturating_mul(2).max(1);
        let script = redis::Script::new(WINDOW_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation.arg(ttl);
        for check in checks {
            invocation
                .key(self.window_key(&check.key, window_start))
                .arg(check.limit)
                .arg(check.amount);
        }

        let reply: Vec<i64> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|err| CounterStoreError::Unavailable(format!("redis error: {err}")))?;
        decode_reply(&reply, checks.len())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

fn decode_reply(reply: &[i64], checks: usize) -> Result<WindowDecision, CounterStoreError> {
    match reply {
        [0, _] => Ok(WindowDecision::Allowed),
        [index, current] if *index >= 1 && (*index as usize) <= checks && *current >= 0 => {
            Ok(WindowDecision::Limited {
                index: (*index as usize) - 1,
                current: *current as u64,
            })
        }
        other => Err(CounterStoreError::Malformed(format!("{other:?}"))),
    }
}
