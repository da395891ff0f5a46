//! 测试用内存存储

use super::{ObjectInfo, ObjectStore};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, (Bytes, DateTime<Utc>)>>,
    fail_with: Mutex<Option<SyncError>>,
    /// 只对特定 key 的写入返回错误
    fail_keys: Mutex<HashMap<String, SyncError>>,
    /// put/create_folder 调用次数
    pub writes: AtomicU32,
    /// list 调用次数
    pub lists: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 所有操作都返回指定错误
    pub fn failing(err: SyncError) -> Self {
        let store = Self::default();
        *store.fail_with.lock().unwrap() = Some(err);
        store
    }

    pub fn set_failure(&self, err: Option<SyncError>) {
        *self.fail_with.lock().unwrap() = err;
    }

    pub fn fail_on_key(&self, key: &str, err: SyncError) {
        self.fail_keys.lock().unwrap().insert(key.to_string(), err);
    }

    pub fn insert(&self, key: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (Bytes::copy_from_slice(data), Utc::now()));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    fn check(&self) -> SyncResult<()> {
        match self.fail_with.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, prefix: &str, delimited: bool) -> SyncResult<Vec<ObjectInfo>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.check()?;

        let prefix = match prefix.trim_start_matches('/') {
            "" => String::new(),
            p if p.ends_with('/') => p.to_string(),
            p => format!("{}/", p),
        };

        let objects = self.objects.lock().unwrap();
        let mut seen_prefixes = BTreeSet::new();
        let mut result = Vec::new();

        for (key, (data, updated)) in objects.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            if *key == prefix {
                continue;
            }
            let rest = &key[prefix.len()..];
            if delimited {
                if let Some(idx) = rest.find('/') {
                    let common = format!("{}{}", prefix, &rest[..=idx]);
                    if seen_prefixes.insert(common.clone()) {
                        result.push(ObjectInfo {
                            key: common,
                            size: 0,
                            updated_at: None,
                            is_prefix: true,
                        });
                    }
                    continue;
                }
            }
            result.push(ObjectInfo {
                key: key.clone(),
                size: data.len() as u64,
                updated_at: Some(*updated),
                is_prefix: key.ends_with('/'),
            });
        }

        Ok(result)
    }

    async fn get(&self, key: &str) -> SyncResult<Bytes> {
        self.check()?;
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| SyncError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: Bytes) -> SyncResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        if let Some(err) = self.fail_keys.lock().unwrap().get(key) {
            return Err(err.clone());
        }
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (data, Utc::now()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        self.check()?;
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    fn bucket(&self) -> &str {
        "b1"
    }

    fn name(&self) -> &str {
        "memory://b1"
    }
}
