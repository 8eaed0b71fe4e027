//! Key/value store contract and the in-process implementation.
//!
//! The collaborator contract asks for hashes, sets, sorted sets, TTLs, and an
//! atomic sorted-set replacement (pipelined delete + zadd + expire) so readers
//! observe either the previous full set or the new one. [`MemoryKv`] provides
//! those semantics for single-process deployments and tests; all durable state
//! lives in the relational store.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::util::now_ms;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;

    async fn hset(&self, key: &str, fields: &[(String, String)], ttl: Option<Duration>)
        -> Result<()>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn sadd(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Atomically replace the whole sorted set and refresh its TTL.
    async fn replace_zset(
        &self,
        key: &str,
        members: &[(String, f64)],
        ttl: Option<Duration>,
    ) -> Result<()>;
    /// Members ordered by ascending score.
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    /// Members with scores, ordered by descending score.
    async fn zrevrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>>;
}

enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    Zset(HashMap<String, f64>),
}

struct Entry {
    value: Value,
    expires_at: Option<i64>,
}

impl Entry {
    fn expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-process store with lazy TTL expiry. A single mutex over the map makes
/// `replace_zset` naturally atomic for concurrent readers.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn expires_at(ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|d| now_ms() + d.as_millis() as i64)
    }

    fn live_entry<'a>(
        map: &'a mut HashMap<String, Entry>,
        key: &str,
        now: i64,
    ) -> Option<&'a Entry> {
        if map.get(key).is_some_and(|e| e.expired(now)) {
            map.remove(key);
            return None;
        }
        map.get(key)
    }

    /// Range endpoints follow sorted-set conventions: negative indexes count
    /// from the tail, `stop` is inclusive.
    fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
        if len == 0 {
            return None;
        }
        let n = len as isize;
        let start = if start < 0 { (n + start).max(0) } else { start };
        let stop = if stop < 0 { n + stop } else { stop.min(n - 1) };
        if start > stop || start >= n {
            return None;
        }
        Some((start as usize, stop as usize))
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = now_ms();
        let mut map = self.inner.lock();
        Ok(Self::live_entry(&mut map, key, now).and_then(|e| match &e.value {
            Value::Str(s) => Some(s.clone()),
            _ => None,
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut map = self.inner.lock();
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Self::expires_at(ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.inner.lock().remove(key);
        Ok(())
    }

    async fn hset(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<()> {
        let now = now_ms();
        let mut map = self.inner.lock();
        let stale = map.get(key).is_none_or(|e| e.expired(now))
            || !matches!(map.get(key).map(|e| &e.value), Some(Value::Hash(_)));
        if stale {
            map.insert(
                key.to_string(),
                Entry {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        if let Some(entry) = map.get_mut(key) {
            if let Value::Hash(hash) = &mut entry.value {
                for (k, v) in fields {
                    hash.insert(k.clone(), v.clone());
                }
            }
            if ttl.is_some() {
                entry.expires_at = Self::expires_at(ttl);
            }
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let now = now_ms();
        let mut map = self.inner.lock();
        Ok(Self::live_entry(&mut map, key, now)
            .and_then(|e| match &e.value {
                Value::Hash(h) => Some(h.clone()),
                _ => None,
            })
            .unwrap_or_default())
    }

    async fn sadd(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<()> {
        let now = now_ms();
        let mut map = self.inner.lock();
        let stale = map.get(key).is_none_or(|e| e.expired(now))
            || !matches!(map.get(key).map(|e| &e.value), Some(Value::Set(_)));
        if stale {
            map.insert(
                key.to_string(),
                Entry {
                    value: Value::Set(HashSet::new()),
                    expires_at: None,
                },
            );
        }
        if let Some(entry) = map.get_mut(key) {
            if let Value::Set(set) = &mut entry.value {
                for m in members {
                    set.insert(m.clone());
                }
            }
            if ttl.is_some() {
                entry.expires_at = Self::expires_at(ttl);
            }
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let now = now_ms();
        let mut map = self.inner.lock();
        let mut members: Vec<String> = Self::live_entry(&mut map, key, now)
            .and_then(|e| match &e.value {
                Value::Set(s) => Some(s.iter().cloned().collect()),
                _ => None,
            })
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn replace_zset(
        &self,
        key: &str,
        members: &[(String, f64)],
        ttl: Option<Duration>,
    ) -> Result<()> {
        let mut map = self.inner.lock();
        let zset: HashMap<String, f64> = members.iter().cloned().collect();
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Zset(zset),
                expires_at: Self::expires_at(ttl),
            },
        );
        Ok(())
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let now = now_ms();
        let mut map = self.inner.lock();
        let mut members: Vec<(String, f64)> = Self::live_entry(&mut map, key, now)
            .and_then(|e| match &e.value {
                Value::Zset(z) => Some(z.iter().map(|(m, s)| (m.clone(), *s)).collect()),
                _ => None,
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(match Self::resolve_range(members.len(), start, stop) {
            Some((lo, hi)) => members[lo..=hi].iter().map(|(m, _)| m.clone()).collect(),
            None => Vec::new(),
        })
    }

    async fn zrevrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        let now = now_ms();
        let mut map = self.inner.lock();
        let mut members: Vec<(String, f64)> = Self::live_entry(&mut map, key, now)
            .and_then(|e| match &e.value {
                Value::Zset(z) => Some(z.iter().map(|(m, s)| (m.clone(), *s)).collect()),
                _ => None,
            })
            .unwrap_or_default();
        members.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(match Self::resolve_range(members.len(), start, stop) {
            Some((lo, hi)) => members[lo..=hi].to_vec(),
            None => Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn string_ttl_expires() {
        let kv = MemoryKv::new();
        kv.set("k", "v", Some(Duration::from_millis(20))).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hash_merges_fields_and_refreshes_ttl() {
        let kv = MemoryKv::new();
        kv.hset("h", &[("a".into(), "1".into())], None).await.unwrap();
        kv.hset("h", &[("b".into(), "2".into())], None).await.unwrap();
        let all = kv.hgetall("h").await.unwrap();
        assert_eq!(all.get("a").map(String::as_str), Some("1"));
        assert_eq!(all.get("b").map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn zset_replace_is_total() {
        let kv = MemoryKv::new();
        kv.replace_zset("z", &[("old".into(), 1.0)], None).await.unwrap();
        kv.replace_zset("z", &[("a".into(), 0.5), ("b".into(), 2.0)], None)
            .await
            .unwrap();
        assert_eq!(kv.zrange("z", 0, -1).await.unwrap(), vec!["a", "b"]);
        let rev = kv.zrevrange_withscores("z", 0, -1).await.unwrap();
        assert_eq!(rev[0].0, "b");
        assert_eq!(rev[1].0, "a");
    }

    #[tokio::test]
    async fn zrange_negative_indexes_count_from_tail() {
        let kv = MemoryKv::new();
        kv.replace_zset(
            "z",
            &[("a".into(), 1.0), ("b".into(), 2.0), ("c".into(), 3.0)],
            None,
        )
        .await
        .unwrap();
        assert_eq!(kv.zrange("z", 0, 0).await.unwrap(), vec!["a"]);
        assert_eq!(kv.zrange("z", -1, -1).await.unwrap(), vec!["c"]);
        assert_eq!(kv.zrange("z", 0, 10).await.unwrap(), vec!["a", "b", "c"]);
        assert!(kv.zrange("missing", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_members_are_sorted_and_deduped() {
        let kv = MemoryKv::new();
        kv.sadd("s", &["b".into(), "a".into(), "a".into()], None)
            .await
            .unwrap();
        assert_eq!(kv.smembers("s").await.unwrap(), vec!["a", "b"]);
    }
}
