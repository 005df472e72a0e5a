//! Redis-backed status cache (feature `redis`).

use std::time::Duration;

use redis::Commands;

use super::{StatusCache, StatusSnapshot};
use crate::error::StoreError;

const KEY_PREFIX: &str = "bgrun:status:";

#[derive(Debug, Clone)]
pub struct RedisStatusCache {
    client: redis::Client,
}

impl RedisStatusCache {
    pub fn open(url: &str) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }
}

impl StatusCache for RedisStatusCache {
    fn put(&self, key: &str, snapshot: &StatusSnapshot, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.client.get_connection()?;
        let body = serde_json::to_string(snapshot)?;
        // Redis rejects a zero expiry; one second is the shortest it keeps.
        let seconds = ttl.as_secs().max(1);
        redis::cmd("SET")
            .arg(format!("{KEY_PREFIX}{key}"))
            .arg(body)
            .arg("EX")
            .arg(seconds)
            .query::<()>(&mut conn)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<StatusSnapshot>, StoreError> {
        let mut conn = self.client.get_connection()?;
        let body: Option<String> = conn.get(format!("{KEY_PREFIX}{key}"))?;
        Ok(body.map(|s| serde_json::from_str(&s)).transpose()?)
    }
}
