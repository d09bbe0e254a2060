//! In-memory storage driver for tests.
//!
//! Backs the fan-out, retry and ledger tests without a network: a shared
//! object store plus injectable upload failures, per-call latency, and a
//! gauge tracking how many uploads run concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{run_cancellable, DriverFactory, DriverKind, StorageDriver};
use crate::core::models::Target;
use crate::error::{Result, SyncError};

/// Shared object map; clones point at the same storage.
#[derive(Clone, Default)]
pub struct MemoryStore {
    objects: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.lock().unwrap().contains_key(path)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, path: String, data: Bytes) {
        self.objects.lock().unwrap().insert(path, data);
    }

    fn remove(&self, path: &str) {
        self.objects.lock().unwrap().remove(path);
    }
}

/// Tracks the current and peak number of concurrent uploads.
#[derive(Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

fn enter_gauge(gauge: &Arc<ConcurrencyGauge>) -> GaugeGuard {
    let current = gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
    gauge.peak.fetch_max(current, Ordering::SeqCst);
    GaugeGuard(gauge.clone())
}

struct GaugeGuard(Arc<ConcurrencyGauge>);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MemoryDriver {
    name: String,
    store: MemoryStore,
    upload_delay: Duration,
    fail_remaining: Arc<AtomicU32>,
    upload_calls: Arc<AtomicU32>,
    gauge: Option<Arc<ConcurrencyGauge>>,
}

impl MemoryDriver {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            store: MemoryStore::new(),
            upload_delay: Duration::ZERO,
            fail_remaining: Arc::new(AtomicU32::new(0)),
            upload_calls: Arc::new(AtomicU32::new(0)),
            gauge: None,
        }
    }

    pub fn with_store(mut self, store: MemoryStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = delay;
        self
    }

    /// Fail the next `n` uploads with a transient storage error.
    pub fn with_failures(self, n: u32) -> Self {
        self.fail_remaining.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_gauge(mut self, gauge: Arc<ConcurrencyGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    pub fn with_counters(
        mut self,
        fail_remaining: Arc<AtomicU32>,
        upload_calls: Arc<AtomicU32>,
    ) -> Self {
        self.fail_remaining = fail_remaining;
        self.upload_calls = upload_calls;
        self
    }

    pub fn store(&self) -> MemoryStore {
        self.store.clone()
    }

    pub fn upload_calls(&self) -> u32 {
        self.upload_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Memory
    }

    async fn upload(&self, path: &str, data: Bytes, cancel: &CancellationToken) -> Result<()> {
        run_cancellable(cancel, async {
            let _entered = self.gauge.as_ref().map(enter_gauge);
            self.upload_calls.fetch_add(1, Ordering::SeqCst);

            if !self.upload_delay.is_zero() {
                tokio::time::sleep(self.upload_delay).await;
            }

            let failed = self
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(SyncError::Storage(format!(
                    "simulated upload failure for {path}"
                )));
            }

            self.store.insert(path.to_string(), data);
            Ok(())
        })
        .await
    }

    async fn download(&self, path: &str, cancel: &CancellationToken) -> Result<Bytes> {
        run_cancellable(cancel, async {
            self.store
                .get(path)
                .ok_or_else(|| SyncError::NotFound(path.to_string()))
        })
        .await
    }

    async fn delete(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        run_cancellable(cancel, async {
            self.store.remove(path);
            Ok(())
        })
        .await
    }

    async fn list(&self, prefix: &str, cancel: &CancellationToken) -> Result<Vec<String>> {
        run_cancellable(cancel, async {
            Ok(self
                .store
                .keys()
                .into_iter()
                .filter(|k| k.starts_with(prefix))
                .collect())
        })
        .await
    }

    async fn exists(&self, path: &str, cancel: &CancellationToken) -> Result<bool> {
        run_cancellable(cancel, async { Ok(self.store.contains(path)) }).await
    }

    async fn size(&self, path: &str, cancel: &CancellationToken) -> Result<u64> {
        run_cancellable(cancel, async {
            Ok(self.store.get(path).map(|d| d.len() as u64).unwrap_or(0))
        })
        .await
    }

    async fn range_read(
        &self,
        path: &str,
        offset: u64,
        length: u64,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        run_cancellable(cancel, async {
            let data = self
                .store
                .get(path)
                .ok_or_else(|| SyncError::NotFound(path.to_string()))?;
            let start = (offset as usize).min(data.len());
            let stop = (offset.saturating_add(length) as usize).min(data.len());
            Ok(data.slice(start..stop))
        })
        .await
    }
}

/// Factory handing out memory drivers with per-target shared state, so a
/// retried upload and the assertions afterwards see the same store and
/// counters regardless of how many driver instances the syncer created.
#[derive(Default)]
pub struct MemoryDriverFactory {
    upload_delay: Duration,
    failures_per_target: u32,
    gauge: Arc<ConcurrencyGauge>,
    state: Mutex<HashMap<String, TargetState>>,
}

#[derive(Clone)]
struct TargetState {
    store: MemoryStore,
    fail_remaining: Arc<AtomicU32>,
    upload_calls: Arc<AtomicU32>,
}

impl MemoryDriverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = delay;
        self
    }

    /// Every target's first `n` uploads fail with a transient error.
    pub fn with_failures(mut self, n: u32) -> Self {
        self.failures_per_target = n;
        self
    }

    pub fn store_for(&self, target_name: &str) -> MemoryStore {
        self.target_state(target_name).store
    }

    pub fn upload_calls(&self, target_name: &str) -> u32 {
        self.target_state(target_name)
            .upload_calls
            .load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.gauge.peak()
    }

    fn target_state(&self, target_name: &str) -> TargetState {
        let mut state = self.state.lock().unwrap();
        state
            .entry(target_name.to_string())
            .or_insert_with(|| TargetState {
                store: MemoryStore::new(),
                fail_remaining: Arc::new(AtomicU32::new(self.failures_per_target)),
                upload_calls: Arc::new(AtomicU32::new(0)),
            })
            .clone()
    }
}

impl DriverFactory for MemoryDriverFactory {
    fn create(&self, target: &Target) -> Result<Box<dyn StorageDriver>> {
        let state = self.target_state(&target.name);
        Ok(Box::new(
            MemoryDriver::new(&target.name)
                .with_store(state.store)
                .with_upload_delay(self.upload_delay)
                .with_counters(state.fail_remaining, state.upload_calls)
                .with_gauge(self.gauge.clone()),
        ))
    }
}
