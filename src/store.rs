//! Persisted multiplex/service/PID store (spec §4.2, §6 abstract schema).
//!
//! The core treats the on-disk database as an opaque key-value store (spec
//! §1's "out of scope" list); this module defines the trait seam the cache
//! (C4) writes through and ships an in-memory implementation so the engine
//! is runnable and testable without a concrete database backend wired in.

use crate::error::{EngineError, Result};
use crate::model::{DeliverySystem, Multiplex, ProgramInfo, Service, TuningParams};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Persistence seam for multiplexes, services, and per-service PID lists.
/// All mutators are idempotent on equal input (spec §4.2).
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_multiplex_by_uid(&self, uid: u32) -> Result<Option<Multiplex>>;
    async fn find_multiplex_by_ids(&self, network_id: u16, transport_stream_id: u16) -> Result<Option<Multiplex>>;
    async fn add_multiplex(&self, delivery_system: DeliverySystem, params: TuningParams) -> Result<u32>;
    async fn set_pat_version(&self, uid: u32, version: u8) -> Result<()>;
    async fn set_network_id(&self, uid: u32, network_id: u16, transport_stream_id: u16) -> Result<()>;
    async fn enumerate_multiplexes(&self) -> Result<Vec<Multiplex>>;
    async fn delete_multiplex(&self, uid: u32) -> Result<()>;

    async fn find_service_by_name(&self, name: &str) -> Result<Option<Service>>;
    async fn find_service_by_fqid(&self, network_id: u16, transport_stream_id: u16, service_id: u16) -> Result<Option<Service>>;
    async fn services_for_multiplex(&self, mux_uid: u32) -> Result<Vec<Service>>;
    async fn upsert_service(&self, service: Service) -> Result<()>;
    async fn delete_service(&self, mux_uid: u32, service_id: u16) -> Result<()>;

    async fn program_info_for_service(&self, mux_uid: u32, service_id: u16) -> Result<ProgramInfo>;
    async fn set_program_info(&self, mux_uid: u32, service_id: u16, info: ProgramInfo) -> Result<()>;
}

#[derive(Default)]
struct State {
    multiplexes: HashMap<u32, Multiplex>,
    services: HashMap<(u32, u16), Service>,
    program_info: HashMap<(u32, u16), ProgramInfo>,
}

/// A process-local in-memory store, useful for tests and as a default when
/// no durable backend is configured.
pub struct InMemoryStore {
    state: Mutex<State>,
    next_uid: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            next_uid: AtomicU32::new(1),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn find_multiplex_by_uid(&self, uid: u32) -> Result<Option<Multiplex>> {
        Ok(self.state.lock().multiplexes.get(&uid).cloned())
    }

    async fn find_multiplex_by_ids(&self, network_id: u16, transport_stream_id: u16) -> Result<Option<Multiplex>> {
        Ok(self
            .state
            .lock()
            .multiplexes
            .values()
            .find(|m| m.ids() == Some((network_id, transport_stream_id)))
            .cloned())
    }

    async fn add_multiplex(&self, delivery_system: DeliverySystem, params: TuningParams) -> Result<u32> {
        let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
        let mux = Multiplex::new(uid, delivery_system, params);
        self.state.lock().multiplexes.insert(uid, mux);
        Ok(uid)
    }

    async fn set_pat_version(&self, uid: u32, version: u8) -> Result<()> {
        let mut state = self.state.lock();
        let mux = state
            .multiplexes
            .get_mut(&uid)
            .ok_or_else(|| EngineError::NotFound(format!("multiplex {uid}")))?;
        mux.pat_version = Some(version);
        Ok(())
    }

    async fn set_network_id(&self, uid: u32, network_id: u16, transport_stream_id: u16) -> Result<()> {
        let mut state = self.state.lock();
        let mux = state
            .multiplexes
            .get_mut(&uid)
            .ok_or_else(|| EngineError::NotFound(format!("multiplex {uid}")))?;
        mux.network_id = Some(network_id);
        mux.transport_stream_id = Some(transport_stream_id);
        Ok(())
    }

    async fn enumerate_multiplexes(&self) -> Result<Vec<Multiplex>> {
        Ok(self.state.lock().multiplexes.values().cloned().collect())
    }

    async fn delete_multiplex(&self, uid: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.multiplexes.remove(&uid);
        state.services.retain(|(mux_uid, _), _| *mux_uid != uid);
        state.program_info.retain(|(mux_uid, _), _| *mux_uid != uid);
        Ok(())
    }

    async fn find_service_by_name(&self, name: &str) -> Result<Option<Service>> {
        Ok(self.state.lock().services.values().find(|s| s.name == name).cloned())
    }

    async fn find_service_by_fqid(&self, network_id: u16, transport_stream_id: u16, service_id: u16) -> Result<Option<Service>> {
        let state = self.state.lock();
        let mux_uid = state
            .multiplexes
            .values()
            .find(|m| m.ids() == Some((network_id, transport_stream_id)))
            .map(|m| m.uid);
        Ok(mux_uid.and_then(|uid| state.services.get(&(uid, service_id)).cloned()))
    }

    async fn services_for_multiplex(&self, mux_uid: u32) -> Result<Vec<Service>> {
        Ok(self
            .state
            .lock()
            .services
            .values()
            .filter(|s| s.mux_uid == mux_uid)
            .cloned()
            .collect())
    }

    async fn upsert_service(&self, service: Service) -> Result<()> {
        let key = (service.mux_uid, service.service_id);
        self.state.lock().services.insert(key, service);
        Ok(())
    }

    async fn delete_service(&self, mux_uid: u32, service_id: u16) -> Result<()> {
        let mut state = self.state.lock();
        state.services.remove(&(mux_uid, service_id));
        state.program_info.remove(&(mux_uid, service_id));
        Ok(())
    }

    async fn program_info_for_service(&self, mux_uid: u32, service_id: u16) -> Result<ProgramInfo> {
        Ok(self
            .state
            .lock()
            .program_info
            .get(&(mux_uid, service_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn set_program_info(&self, mux_uid: u32, service_id: u16, info: ProgramInfo) -> Result<()> {
        self.state.lock().program_info.insert((mux_uid, service_id), info);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_and_find_multiplex_round_trips() {
        let store = InMemoryStore::new();
        let uid = store
            .add_multiplex(DeliverySystem::DvbT, TuningParams::new())
            .await
            .unwrap();
        store.set_network_id(uid, 1, 2).await.unwrap();
        let found = store.find_multiplex_by_ids(1, 2).await.unwrap().unwrap();
        assert_eq!(found.uid, uid);
    }

    #[tokio::test]
    async fn deleting_multiplex_cascades_to_services() {
        let store = InMemoryStore::new();
        let uid = store
            .add_multiplex(DeliverySystem::DvbC, TuningParams::new())
            .await
            .unwrap();
        store.upsert_service(Service::new(uid, 1)).await.unwrap();
        store.delete_multiplex(uid).await.unwrap();
        assert!(store.services_for_multiplex(uid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_multiplex_uid_is_not_found() {
        let store = InMemoryStore::new();
        let err = store.set_pat_version(99, 1).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
