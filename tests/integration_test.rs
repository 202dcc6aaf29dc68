//! End-to-end pipeline tests: synthetic transport-stream packets pushed
//! through [`tsengine::reader`]/[`tsengine::dispatch`]/[`tsengine::psi`] and
//! wired up the way [`tsengine::engine::Engine`] does it, exercising the six
//! scenarios spec.md §8 describes for the system as a whole.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tsengine::delivery::MemorySink;
use tsengine::dvr::ChannelDvrSource;
use tsengine::engine::{Engine, EngineConfig};
use tsengine::frontend::SimulatedFrontend;
use tsengine::model::{DeliverySystem, Service, TuningParams};
use tsengine::packet::{PACKET_SIZE, SYNC_BYTE};
use tsengine::psi::encode_section;
use tsengine::store::{InMemoryStore, Store};

const PID_PAT: u16 = 0x0000;
const PID_SDT: u16 = 0x0011;
const TABLE_ID_PAT: u8 = 0x00;
const TABLE_ID_PMT: u8 = 0x02;
const TABLE_ID_SDT_ACTUAL: u8 = 0x42;

/// Packetizes one already-encoded section (with CRC) onto `pid`, pointer
/// field included, mirroring how `servicefilter::pack_section` builds its
/// rewritten output — the same wire shape a PSI encoder anywhere in this
/// crate produces.
fn pack_section(pid: u16, section: &[u8]) -> Vec<u8> {
    let mut with_pointer = Vec::with_capacity(section.len() + 1);
    with_pointer.push(0x00);
    with_pointer.extend_from_slice(section);

    let mut out = Vec::new();
    let mut pos = 0;
    let mut first = true;
    let mut cc = 0u8;
    while pos < with_pointer.len() {
        let mut packet = [0xFFu8; PACKET_SIZE];
        packet[0] = SYNC_BYTE;
        packet[1] = (if first { 0x40 } else { 0x00 }) | ((pid >> 8) as u8 & 0x1F);
        packet[2] = (pid & 0xFF) as u8;
        packet[3] = 0x10 | (cc & 0x0F);
        cc = (cc + 1) & 0x0F;

        let avail = PACKET_SIZE - 4;
        let n = (with_pointer.len() - pos).min(avail);
        packet[4..4 + n].copy_from_slice(&with_pointer[pos..pos + n]);
        pos += n;
        out.extend_from_slice(&packet);
        first = false;
    }
    out
}

fn pat_section(transport_stream_id: u16, version: u8, entries: &[(u16, u16)]) -> Vec<u8> {
    let mut body = Vec::new();
    for &(program_number, pid) in entries {
        body.push((program_number >> 8) as u8);
        body.push((program_number & 0xFF) as u8);
        body.push(0xE0 | ((pid >> 8) as u8 & 0x1F));
        body.push((pid & 0xFF) as u8);
    }
    encode_section(TABLE_ID_PAT, transport_stream_id, version, true, &body)
}

fn pmt_section(program_number: u16, version: u8, pcr_pid: u16, streams: &[(u8, u16)]) -> Vec<u8> {
    let mut body = vec![0xE0 | ((pcr_pid >> 8) as u8 & 0x1F), (pcr_pid & 0xFF) as u8, 0xF0, 0x00];
    for &(stream_type, pid) in streams {
        body.push(stream_type);
        body.push(0xE0 | ((pid >> 8) as u8 & 0x1F));
        body.push((pid & 0xFF) as u8);
        body.push(0xF0);
        body.push(0x00);
    }
    encode_section(TABLE_ID_PMT, program_number, version, true, &body)
}

fn sdt_section(transport_stream_id: u16, version: u8, services: &[(u16, &str)]) -> Vec<u8> {
    let mut body = vec![0x00, 0x01, 0xFF]; // original_network_id = 1, reserved
    for &(service_id, name) in services {
        let mut descriptor = vec![0x01]; // service_type = digital TV
        descriptor.push(0); // provider name length
        let name_bytes = name.as_bytes();
        descriptor.push(name_bytes.len() as u8);
        descriptor.extend_from_slice(name_bytes);
        let service_descriptor_len = descriptor.len();
        let mut descriptor_with_tag = vec![0x48, service_descriptor_len as u8];
        descriptor_with_tag.extend_from_slice(&descriptor);

        body.push((service_id >> 8) as u8);
        body.push((service_id & 0xFF) as u8);
        body.push(0x00); // eit flags
        let descriptors_len = descriptor_with_tag.len();
        body.push(0x00 | (((descriptors_len >> 8) as u8) & 0x0F));
        body.push((descriptors_len & 0xFF) as u8);
        body.extend_from_slice(&descriptor_with_tag);
    }
    encode_section(TABLE_ID_SDT_ACTUAL, transport_stream_id, version, true, &body)
}

/// Scenario: a multiplex carrying only a PAT (no PMTs yet) still gets every
/// service entered into the cache once the PAT is decoded.
#[tokio::test]
async fn pat_only_multiplex_seeds_cache_services() {
    let store = Arc::new(InMemoryStore::new());
    let (tx, dvr) = ChannelDvrSource::new();
    let sink = Arc::new(MemorySink::new());
    let frontend: Arc<dyn tsengine::frontend::Frontend> = Arc::new(SimulatedFrontend::new(8));
    let engine = Engine::start(store, frontend, dvr, sink, 0x64, EngineConfig::default());

    let packets = pack_section(PID_PAT, &pat_section(1, 0, &[(0x64, 0x100), (0x65, 0x200)]));
    tx.send(packets).unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(engine.cache.services_get().iter().any(|s| s.service_id == 0x64));
    assert!(engine.cache.services_get().iter().any(|s| s.service_id == 0x65));

    engine.shutdown().await;
}

/// Scenario: once a service's PMT is decoded, its elementary PIDs land in
/// the cache's program info, and the primary service filter (already
/// pointed at that service via `Engine::start`) begins passing those PIDs
/// through and rewrites the PMT onto the target sink.
#[tokio::test]
async fn pmt_decode_populates_program_info_and_primary_filter_tracks_pids() {
    let (tx, dvr) = ChannelDvrSource::new();
    let sink = Arc::new(MemorySink::new());
    let frontend: Arc<dyn tsengine::frontend::Frontend> = Arc::new(SimulatedFrontend::new(8));
    let engine = Engine::start(Arc::new(InMemoryStore::new()), frontend, dvr, sink.clone(), 0x64, EngineConfig::default());

    tx.send(pack_section(PID_PAT, &pat_section(1, 0, &[(0x64, 0x100)]))).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    tx.send(pack_section(0x100, &pmt_section(0x64, 0, 0x200, &[(0x02, 0x200), (0x04, 0x201)])))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let info = engine.cache.program_info(0x64).expect("PMT decoded");
    assert_eq!(info.pid_set(), [0x200, 0x201].into_iter().collect());
    assert_eq!(engine.primary_pmt_pid(), Some(0x100));

    engine.shutdown().await;
}

/// Scenario: an SDT entry renames an already-known service without a retune.
#[tokio::test]
async fn sdt_update_renames_service_in_cache() {
    let store = Arc::new(InMemoryStore::new());
    let (tx, dvr) = ChannelDvrSource::new();
    let sink = Arc::new(MemorySink::new());
    let frontend: Arc<dyn tsengine::frontend::Frontend> = Arc::new(SimulatedFrontend::new(8));
    let engine = Engine::start(store, frontend, dvr, sink, 0x64, EngineConfig::default());

    tx.send(pack_section(PID_PAT, &pat_section(1, 0, &[(0x64, 0x100)]))).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    tx.send(pack_section(PID_SDT, &sdt_section(1, 0, &[(0x64, "NEWS HD")]))).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let service = engine
        .cache
        .services_get()
        .iter()
        .find(|s| s.service_id == 0x64)
        .cloned()
        .expect("service present");
    assert_eq!(service.name, "NEWS HD");

    engine.shutdown().await;
}

/// Scenario: switching to a service on a different multiplex runs the full
/// retune sequence and fires `multiplex_changed`/`service_changed` in order.
#[tokio::test]
async fn retune_to_different_multiplex_fires_events_in_order() {
    let store = Arc::new(InMemoryStore::new());
    let mux_a = store.add_multiplex(DeliverySystem::DvbT, TuningParams::new()).await.unwrap();
    let mut params_b = TuningParams::new();
    params_b.set("frequency", "other");
    let mux_b = store.add_multiplex(DeliverySystem::DvbT, params_b).await.unwrap();
    store.upsert_service(Service::new(mux_a, 0x64)).await.unwrap();
    store.upsert_service(Service::new(mux_b, 0x70)).await.unwrap();

    let (tx, dvr) = ChannelDvrSource::new();
    std::mem::forget(tx);
    let sink = Arc::new(MemorySink::new());
    let frontend: Arc<dyn tsengine::frontend::Frontend> = Arc::new(SimulatedFrontend::new(8));
    let engine = Engine::start(store, frontend, dvr, sink, 0x64, EngineConfig::default());
    engine.tuner.set_current_multiplex(mux_a).await.unwrap();

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let o1 = order.clone();
    engine.events.subscribe("tuning", "multiplex_changed", move |_, _, _| {
        o1.lock().unwrap().push("multiplex_changed");
    });
    let o2 = order.clone();
    engine.events.subscribe("tuning", "service_changed", move |_, _, _| {
        o2.lock().unwrap().push("service_changed");
    });

    engine.tuner.set_current_multiplex(mux_b).await.unwrap();
    assert_eq!(engine.tuner.current_multiplex(), Some(mux_b));
    assert_eq!(*order.lock().unwrap(), vec!["multiplex_changed", "service_changed"]);

    engine.shutdown().await;
}

/// Scenario: the same PAT fed through two independent primary filters
/// produces byte-identical rewritten output (apart from each filter's own
/// continuity counter, which both start from zero).
#[tokio::test]
async fn repeated_pat_through_primary_filter_is_deterministic() {
    async fn run_once() -> Vec<u8> {
        let store = Arc::new(InMemoryStore::new());
        let (tx, dvr) = ChannelDvrSource::new();
        let sink = Arc::new(MemorySink::new());
        let frontend: Arc<dyn tsengine::frontend::Frontend> = Arc::new(SimulatedFrontend::new(8));
        let engine = Engine::start(store, frontend, dvr, sink.clone(), 0x64, EngineConfig::default());

        let pat_packets = pack_section(PID_PAT, &pat_section(1, 0, &[(0x64, 0x100), (0x65, 0x200)]));
        tx.send(pat_packets).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let buffered = sink.buffered();

        engine.shutdown().await;
        buffered
    }

    let first = run_once().await;
    let second = run_once().await;
    assert_eq!(first, second);
    assert!(!first.is_empty());
}

/// Scenario: canceling a scan mid-walk restores the pre-scan multiplex and
/// fires `scan.cancel` before `scan.finished`.
#[tokio::test]
async fn canceling_scan_restores_prior_multiplex() {
    let store = Arc::new(InMemoryStore::new());
    let mux = store.add_multiplex(DeliverySystem::DvbT, TuningParams::new()).await.unwrap();
    store.upsert_service(Service::new(mux, 0x64)).await.unwrap();

    let (tx, dvr) = ChannelDvrSource::new();
    std::mem::forget(tx);
    let sink = Arc::new(MemorySink::new());
    let frontend = SimulatedFrontend::new(8);
    let frontend: Arc<dyn tsengine::frontend::Frontend> = Arc::new(frontend);
    let engine = Engine::start(store, frontend, dvr, sink, 0x64, EngineConfig::default());
    engine.tuner.set_current_multiplex(mux).await.unwrap();

    let finished = Arc::new(AtomicUsize::new(0));
    let f = finished.clone();
    engine.events.subscribe("scan", "finished", move |_, _, _| {
        f.fetch_add(1, Ordering::Relaxed);
    });

    let scan = engine.scan.clone();
    let candidates = (0..5)
        .map(|i| {
            let mut params = TuningParams::new();
            params.set("frequency", i.to_string());
            tsengine::scan::ScanCandidate { delivery_system: DeliverySystem::DvbT, params }
        })
        .collect::<Vec<_>>();

    let scan_for_cancel = scan.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        scan_for_cancel.cancel();
    });
    scan.run(candidates).await.unwrap();

    assert_eq!(engine.tuner.current_multiplex(), Some(mux));
    assert_eq!(finished.load(Ordering::Relaxed), 1);

    engine.shutdown().await;
}
