//! In-memory mirror of one multiplex's services (spec §4.3, component C4).
//!
//! Grounded on `examples/original_source/include/cache.h`'s
//! `CacheWritesLock`/`CacheWritesUnlock` plus services-array lock pair; both
//! collapse onto one [`parking_lot::RwLock`] here; a read guard (taken by
//! `services_get`) already blocks a writer (`writeback`) the same way the
//! original's two hand-rolled locks did; a "lock-free swap" mutation path
//! for the reader thread was not needed to get that guarantee, since Rust's
//! `RwLock` gives it directly, and actual mutation calls are cheap enough
//! (field assignment, not I/O) that briefly contending on the write lock
//! does not violate the reader thread's no-unbounded-blocking contract.

use crate::error::{EngineError, Result};
use crate::model::{parse_fqid, ProgramInfo, Service};
use crate::store::Store;
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use std::collections::HashSet;
use std::sync::Arc;

struct CacheState {
    mux_uid: Option<u32>,
    services: Vec<Service>,
    program_info: Vec<(u16, ProgramInfo)>,
    loaded_service_ids: HashSet<u16>,
    dirty: HashSet<u16>,
}

impl Default for CacheState {
    fn default() -> Self {
        Self {
            mux_uid: None,
            services: Vec::new(),
            program_info: Vec::new(),
            loaded_service_ids: HashSet::new(),
            dirty: HashSet::new(),
        }
    }
}

impl CacheState {
    fn find_mut(&mut self, service_id: u16) -> Option<&mut Service> {
        self.services.iter_mut().find(|s| s.service_id == service_id)
    }

    fn find(&self, service_id: u16) -> Option<&Service> {
        self.services.iter().find(|s| s.service_id == service_id)
    }
}

/// Snapshot returned by [`Cache::services_get`]; holds the read lock for its
/// lifetime, matching spec §4.3's "scoped read-guard returning a borrowed
/// slice, no raw pointers escape the guard".
pub struct ServicesGuard<'a> {
    inner: MappedRwLockReadGuard<'a, [Service]>,
}

impl<'a> std::ops::Deref for ServicesGuard<'a> {
    type Target = [Service];
    fn deref(&self) -> &[Service] {
        &self.inner
    }
}

/// The cache's contract: exactly one multiplex loaded at a time (or none).
pub struct Cache {
    store: Arc<dyn Store>,
    state: RwLock<CacheState>,
}

impl Cache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn current_multiplex(&self) -> Option<u32> {
        self.state.read().mux_uid
    }

    /// Drops any current state and repopulates from the store.
    pub async fn load(&self, mux_uid: u32) -> Result<()> {
        let services = self.store.services_for_multiplex(mux_uid).await?;
        let mut program_info = Vec::with_capacity(services.len());
        for svc in &services {
            let info = self.store.program_info_for_service(mux_uid, svc.service_id).await?;
            program_info.push((svc.service_id, info));
        }
        let loaded_service_ids = services.iter().map(|s| s.service_id).collect();

        let mut state = self.state.write();
        state.mux_uid = Some(mux_uid);
        state.services = services;
        state.program_info = program_info;
        state.loaded_service_ids = loaded_service_ids;
        state.dirty.clear();
        Ok(())
    }

    /// Flushes accumulated mutations to the store in one pass: upserts every
    /// service still existing ([`Service::exists`]), deletes any loaded
    /// service that no longer exists, and persists dirty program-info.
    pub async fn writeback(&self) -> Result<()> {
        let Some(mux_uid) = self.state.read().mux_uid else {
            return Ok(());
        };

        let (to_upsert, to_delete, info_updates): (Vec<Service>, Vec<u16>, Vec<(u16, ProgramInfo)>) = {
            let state = self.state.read();
            let to_upsert: Vec<Service> = state.services.iter().filter(|s| s.exists()).cloned().collect();
            let to_delete: Vec<u16> = state
                .loaded_service_ids
                .iter()
                .copied()
                .filter(|id| state.find(*id).map(|s| !s.exists()).unwrap_or(true))
                .collect();
            let info_updates: Vec<(u16, ProgramInfo)> = state
                .program_info
                .iter()
                .filter(|(id, _)| state.dirty.contains(id))
                .cloned()
                .collect();
            (to_upsert, to_delete, info_updates)
        };

        for service in to_upsert {
            if let Err(err) = self.store.upsert_service(service).await {
                log::warn!("cache writeback: upsert failed, retrying next cycle: {err}");
            }
        }
        for service_id in to_delete {
            if let Err(err) = self.store.delete_service(mux_uid, service_id).await {
                log::warn!("cache writeback: delete failed, retrying next cycle: {err}");
            }
        }
        for (service_id, info) in info_updates {
            if let Err(err) = self.store.set_program_info(mux_uid, service_id, info).await {
                log::warn!("cache writeback: program info flush failed, retrying next cycle: {err}");
            }
        }

        let mut state = self.state.write();
        state.loaded_service_ids = state.services.iter().filter(|s| s.exists()).map(|s| s.service_id).collect();
        state.dirty.clear();
        Ok(())
    }

    /// Read-lock-guarded snapshot of the loaded services.
    pub fn services_get(&self) -> ServicesGuard<'_> {
        let guard = self.state.read();
        ServicesGuard {
            inner: RwLockReadGuard::map(guard, |s| s.services.as_slice()),
        }
    }

    /// Accepts either a bare service name or a `net.ts.svc` fully qualified id.
    pub fn service_find_by_name(&self, text: &str, network_id: u16, transport_stream_id: u16) -> Option<Service> {
        let state = self.state.read();
        if let Some((net, ts, svc_id)) = parse_fqid(text) {
            if net == network_id && ts == transport_stream_id {
                return state.find(svc_id).cloned();
            }
            return None;
        }
        state.services.iter().find(|s| s.name == text).cloned()
    }

    fn with_service_mut(&self, service_id: u16, f: impl FnOnce(&mut Service)) -> Result<()> {
        let mut state = self.state.write();
        let service = state
            .find_mut(service_id)
            .ok_or_else(|| EngineError::NotFound(format!("service {service_id}")))?;
        f(service);
        state.dirty.insert(service_id);
        Ok(())
    }

    /// Inserts a service if it is not already present in the loaded mux.
    pub fn ensure_service(&self, service_id: u16) {
        let mux_uid = match self.state.read().mux_uid {
            Some(uid) => uid,
            None => return,
        };
        let mut state = self.state.write();
        if state.find(service_id).is_none() {
            state.services.push(Service::new(mux_uid, service_id));
            state.program_info.push((service_id, ProgramInfo::default()));
        }
    }

    pub fn update_service_name(&self, service_id: u16, name: &str) -> Result<()> {
        self.with_service_mut(service_id, |s| s.set_name(name))
    }

    pub fn update_service_pmt_pid(&self, service_id: u16, pmt_pid: u16) -> Result<()> {
        self.with_service_mut(service_id, |s| s.pmt_pid = pmt_pid)
    }

    pub fn update_service_ca(&self, service_id: u16, ca: bool) -> Result<()> {
        self.with_service_mut(service_id, |s| s.conditional_access = ca)
    }

    pub fn update_service_pcr_pid(&self, service_id: u16, pcr_pid: u16) -> Result<()> {
        self.with_service_mut(service_id, |s| s.pcr_pid = pcr_pid)
    }

    pub fn update_service_pmt_version(&self, service_id: u16, version: u8) -> Result<()> {
        self.with_service_mut(service_id, |s| s.pmt_version = Some(version))
    }

    pub fn update_service_type(&self, service_id: u16, service_type: crate::model::ServiceType) -> Result<()> {
        self.with_service_mut(service_id, |s| s.service_type = service_type)
    }

    pub fn update_service_source_id(&self, service_id: u16, source_id: u16) -> Result<()> {
        self.with_service_mut(service_id, |s| s.source_id = source_id)
    }

    /// Sets the owning multiplex's `(network_id, transport_stream_id)` pair,
    /// learned from an SDT decode. Writes straight through to the store since
    /// the multiplex record itself isn't mirrored in cache state.
    pub async fn set_network_id(&self, network_id: u16, transport_stream_id: u16) -> Result<()> {
        let Some(mux_uid) = self.current_multiplex() else {
            return Ok(());
        };
        self.store.set_network_id(mux_uid, network_id, transport_stream_id).await
    }

    pub fn update_program_info(&self, service_id: u16, info: ProgramInfo) -> Result<()> {
        let mut state = self.state.write();
        if state.find(service_id).is_none() {
            return Err(EngineError::NotFound(format!("service {service_id}")));
        }
        if let Some(slot) = state.program_info.iter_mut().find(|(id, _)| *id == service_id) {
            slot.1 = info;
        } else {
            state.program_info.push((service_id, info));
        }
        state.dirty.insert(service_id);
        Ok(())
    }

    pub fn program_info(&self, service_id: u16) -> Option<ProgramInfo> {
        self.state
            .read()
            .program_info
            .iter()
            .find(|(id, _)| *id == service_id)
            .map(|(_, info)| info.clone())
    }

    /// Sets one of the two "seen" bits (spec §3's Service invariant). Returns
    /// whether the service still exists after the update.
    pub fn service_seen(&self, service_id: u16, seen: bool, from_pat: bool) -> bool {
        self.ensure_service(service_id);
        let mut state = self.state.write();
        let Some(service) = state.find_mut(service_id) else {
            return false;
        };
        if from_pat {
            service.seen_in_pat = seen;
        } else {
            service.seen_in_sdt = seen;
        }
        let exists = service.exists();
        state.dirty.insert(service_id);
        exists
    }

    /// Stages a service for removal at next writeback by clearing both seen
    /// bits; removal only happens once [`Cache::writeback`] runs.
    pub fn service_delete(&self, service_id: u16) {
        let mut state = self.state.write();
        if let Some(service) = state.find_mut(service_id) {
            service.seen_in_pat = false;
            service.seen_in_sdt = false;
        }
        state.dirty.insert(service_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeliverySystem;
    use crate::model::TuningParams;
    use crate::store::InMemoryStore;

    async fn cache_with_loaded_mux() -> (Cache, u32) {
        let store = Arc::new(InMemoryStore::new());
        let uid = store.add_multiplex(DeliverySystem::DvbT, TuningParams::new()).await.unwrap();
        store.upsert_service(Service::new(uid, 0x64)).await.unwrap();
        let cache = Cache::new(store);
        cache.load(uid).await.unwrap();
        (cache, uid)
    }

    #[tokio::test]
    async fn load_then_writeback_then_load_is_stable() {
        let (cache, uid) = cache_with_loaded_mux().await;
        cache.update_service_name(0x64, "BBC ONE").unwrap();
        cache.service_seen(0x64, true, true);
        cache.writeback().await.unwrap();
        cache.load(uid).await.unwrap();
        let services = cache.services_get();
        assert_eq!(services[0].name, "BBC ONE");
    }

    #[tokio::test]
    async fn service_with_no_seen_bits_is_removed_on_writeback() {
        let (cache, uid) = cache_with_loaded_mux().await;
        cache.service_seen(0x64, true, true);
        cache.writeback().await.unwrap();
        cache.service_delete(0x64);
        cache.writeback().await.unwrap();
        cache.load(uid).await.unwrap();
        assert!(cache.services_get().is_empty());
    }

    #[tokio::test]
    async fn find_by_name_and_by_fqid() {
        let (cache, _uid) = cache_with_loaded_mux().await;
        cache.update_service_name(0x64, "BBC ONE").unwrap();
        assert!(cache.service_find_by_name("BBC ONE", 1, 2).is_some());
        assert!(cache.service_find_by_name("1.2.64", 1, 2).is_some());
        assert!(cache.service_find_by_name("1.2.65", 1, 2).is_none());
    }
}
