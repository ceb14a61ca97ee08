//! A metadata store wrapper that injects interleavings the scheduler would
//! otherwise make rare.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Barrier, Notify};
use uuid::Uuid;
use vault_metadata::{
    MetadataResult, MetadataStore, OwnerUsage, PayloadRepo, PayloadRow, PayloadStats,
    ReferenceRepo, ReferenceRow, UnlinkOutcome,
};

/// Delegates to an inner store, except that:
/// - the first `forced_misses` hash lookups report "not found", each waiting
///   on a shared barrier so that every racer has missed before any creates;
/// - a queued stale row is returned once from the next hash lookup.
pub struct RacingStore {
    inner: Arc<dyn MetadataStore>,
    forced_misses: AtomicUsize,
    barrier: Option<Barrier>,
    stale: Mutex<Option<PayloadRow>>,
}

#[allow(dead_code)]
impl RacingStore {
    pub fn new(inner: Arc<dyn MetadataStore>) -> Self {
        Self {
            inner,
            forced_misses: AtomicUsize::new(0),
            barrier: None,
            stale: Mutex::new(None),
        }
    }

    /// Make the first `racers` lookups miss and rendezvous.
    pub fn with_forced_misses(mut self, racers: usize) -> Self {
        self.forced_misses = AtomicUsize::new(racers);
        self.barrier = Some(Barrier::new(racers));
        self
    }

    /// Return `row` from the next hash lookup, as if read just before a
    /// concurrent delete.
    pub fn with_stale_payload(self, row: PayloadRow) -> Self {
        *self.stale.lock().unwrap() = Some(row);
        self
    }

    fn take_forced_miss(&self) -> bool {
        self.forced_misses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PayloadRepo for RacingStore {
    async fn get_by_hash(&self, content_hash: &str) -> MetadataResult<Option<PayloadRow>> {
        if self.take_forced_miss() {
            if let Some(barrier) = &self.barrier {
                barrier.wait().await;
            }
            return Ok(None);
        }
        if let Some(stale) = self.stale.lock().unwrap().take() {
            return Ok(Some(stale));
        }
        self.inner.get_by_hash(content_hash).await
    }

    async fn get_payload(&self, payload_id: Uuid) -> MetadataResult<Option<PayloadRow>> {
        self.inner.get_payload(payload_id).await
    }

    async fn create_unique_payload(
        &self,
        payload: &PayloadRow,
        first_reference: &ReferenceRow,
    ) -> MetadataResult<()> {
        self.inner
            .create_unique_payload(payload, first_reference)
            .await
    }

    async fn increment_and_link(&self, reference: &ReferenceRow) -> MetadataResult<i64> {
        self.inner.increment_and_link(reference).await
    }

    async fn get_stats(&self) -> MetadataResult<PayloadStats> {
        self.inner.get_stats().await
    }
}

#[async_trait]
impl ReferenceRepo for RacingStore {
    async fn get_reference(&self, reference_id: Uuid) -> MetadataResult<Option<ReferenceRow>> {
        self.inner.get_reference(reference_id).await
    }

    async fn get_reference_owner(&self, reference_id: Uuid) -> MetadataResult<Option<String>> {
        self.inner.get_reference_owner(reference_id).await
    }

    async fn list_references(&self, owner_id: &str) -> MetadataResult<Vec<ReferenceRow>> {
        self.inner.list_references(owner_id).await
    }

    async fn unlink_and_decrement(&self, reference_id: Uuid) -> MetadataResult<UnlinkOutcome> {
        self.inner.unlink_and_decrement(reference_id).await
    }

    async fn get_owner_usage(&self, owner_id: &str) -> MetadataResult<OwnerUsage> {
        self.inner.get_owner_usage(owner_id).await
    }
}

#[async_trait]
impl MetadataStore for RacingStore {
    async fn migrate(&self) -> MetadataResult<()> {
        self.inner.migrate().await
    }

    async fn health_check(&self) -> MetadataResult<()> {
        self.inner.health_check().await
    }

    fn backend_name(&self) -> &'static str {
        "racing"
    }
}

/// Pauses a deletion between its metadata commit and its blob cleanup.
///
/// Once armed, `unlink_and_decrement` commits, signals `wait_unlinked` and
/// then blocks until released. With `hold_create`, the next payload insert
/// releases the deletion itself and blocks until `release_create`, so the
/// whole cleanup runs between a re-upload's blob commit and its insert.
pub struct GatedStore {
    inner: Arc<dyn MetadataStore>,
    hold_create: bool,
    armed: AtomicBool,
    create_armed: AtomicBool,
    unlinked: Notify,
    unlink_release: Notify,
    create_release: Notify,
}

#[allow(dead_code)]
impl GatedStore {
    pub fn new(inner: Arc<dyn MetadataStore>, hold_create: bool) -> Self {
        Self {
            inner,
            hold_create,
            armed: AtomicBool::new(false),
            create_armed: AtomicBool::new(false),
            unlinked: Notify::new(),
            unlink_release: Notify::new(),
            create_release: Notify::new(),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
        self.create_armed.store(self.hold_create, Ordering::SeqCst);
    }

    pub async fn wait_unlinked(&self) {
        self.unlinked.notified().await;
    }

    pub fn release_unlink(&self) {
        self.unlink_release.notify_one();
    }

    pub fn release_create(&self) {
        self.create_release.notify_one();
    }
}

#[async_trait]
impl PayloadRepo for GatedStore {
    async fn get_by_hash(&self, content_hash: &str) -> MetadataResult<Option<PayloadRow>> {
        self.inner.get_by_hash(content_hash).await
    }

    async fn get_payload(&self, payload_id: Uuid) -> MetadataResult<Option<PayloadRow>> {
        self.inner.get_payload(payload_id).await
    }

    async fn create_unique_payload(
        &self,
        payload: &PayloadRow,
        first_reference: &ReferenceRow,
    ) -> MetadataResult<()> {
        if self.create_armed.swap(false, Ordering::SeqCst) {
            self.unlink_release.notify_one();
            self.create_release.notified().await;
        }
        self.inner
            .create_unique_payload(payload, first_reference)
            .await
    }

    async fn increment_and_link(&self, reference: &ReferenceRow) -> MetadataResult<i64> {
        self.inner.increment_and_link(reference).await
    }

    async fn get_stats(&self) -> MetadataResult<PayloadStats> {
        self.inner.get_stats().await
    }
}

#[async_trait]
impl ReferenceRepo for GatedStore {
    async fn get_reference(&self, reference_id: Uuid) -> MetadataResult<Option<ReferenceRow>> {
        self.inner.get_reference(reference_id).await
    }

    async fn get_reference_owner(&self, reference_id: Uuid) -> MetadataResult<Option<String>> {
        self.inner.get_reference_owner(reference_id).await
    }

    async fn list_references(&self, owner_id: &str) -> MetadataResult<Vec<ReferenceRow>> {
        self.inner.list_references(owner_id).await
    }

    async fn unlink_and_decrement(&self, reference_id: Uuid) -> MetadataResult<UnlinkOutcome> {
        let outcome = self.inner.unlink_and_decrement(reference_id).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.unlinked.notify_one();
            self.unlink_release.notified().await;
        }
        Ok(outcome)
    }

    async fn get_owner_usage(&self, owner_id: &str) -> MetadataResult<OwnerUsage> {
        self.inner.get_owner_usage(owner_id).await
    }
}

#[async_trait]
impl MetadataStore for GatedStore {
    async fn migrate(&self) -> MetadataResult<()> {
        self.inner.migrate().await
    }

    async fn health_check(&self) -> MetadataResult<()> {
        self.inner.health_check().await
    }

    fn backend_name(&self) -> &'static str {
        "gated"
    }
}
