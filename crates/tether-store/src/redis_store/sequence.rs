//! Redis per-stream sequence counters.

use async_trait::async_trait;
use redis::Script;

use super::RedisBackend;
use crate::error::StoreResult;
use crate::sequence::SequenceStore;

/// ARGV: expected current, next
const ADVANCE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1]) or '1'
if current ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

pub struct RedisSequenceStore {
    backend: RedisBackend,
    advance: Script,
}

impl RedisSequenceStore {
    pub fn new(backend: RedisBackend) -> Self {
        Self {
            backend,
            advance: Script::new(ADVANCE_SCRIPT),
        }
    }

    fn stream_key(&self, stream: &str) -> String {
        self.backend.key(&format!("seq:{}", stream))
    }
}

#[async_trait]
impl SequenceStore for RedisSequenceStore {
    async fn next_expected(&self, stream: &str) -> StoreResult<u64> {
        let raw: Option<u64> = self
            .backend
            .query("sequence.get", redis::cmd("GET").arg(self.stream_key(stream)))
            .await?;
        Ok(raw.unwrap_or(1))
    }

    async fn advance(&self, stream: &str, from: u64, to: u64) -> StoreResult<bool> {
        let advanced: i64 = self
            .backend
            .script(
                "sequence.advance",
                &self.advance,
                &[self.stream_key(stream)],
                &[from.to_string(), to.to_string()],
            )
            .await?;
        Ok(advanced == 1)
    }
}
