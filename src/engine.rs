//! The explicit engine context (spec §9's design note: "global singletons
//! become an explicit context object"). Wires the cache, store, event bus,
//! reader/dispatcher, tuner and scan state machine into one value the caller
//! owns, instead of each module reaching for ambient statics.
//!
//! PAT→PMT wiring mirrors the reader's self-registration idiom
//! ([`crate::dispatch::MutationQueue`]): the PAT handler discovers each
//! service's PMT PID and queues both a new section filter and a PMT decoder
//! for it, rather than the engine needing to know PMT locations up front.
//! SDT/NIT (DVB, well-known PID 0x11/0x10) and MGT/VCT/STT (ATSC, well-known
//! PID 0x1FFB) need no such discovery step and are attached directly at
//! startup.

use crate::cache::Cache;
use crate::delivery::DeliverySink;
use crate::dispatch::{Dispatcher, GroupId};
use crate::dvr::DvrSource;
use crate::events::EventBus;
use crate::frontend::Frontend;
use crate::model::{PidInfo, ProgramInfo};
use crate::psi::atsc::{MgtAssembler, VctAssembler};
use crate::psi::nit::NitAssembler;
use crate::psi::pat::{PatAssembler, TABLE_ID_PAT};
use crate::psi::pmt::{PmtAssembler, TABLE_ID_PMT};
use crate::psi::sdt::{SdtAssembler, TABLE_ID_SDT_ACTUAL, TABLE_ID_SDT_OTHER};
use crate::psi::atsc::{TABLE_ID_CVCT, TABLE_ID_MGT, TABLE_ID_STT, TABLE_ID_TVCT};
use crate::psi::nit::{TABLE_ID_NIT_ACTUAL, TABLE_ID_NIT_OTHER};
use crate::psi::Section;
use crate::reader::{self, ReaderHandle};
use crate::scan::{Scan, ScanCandidate, ScanConfig};
use crate::servicefilter::ServiceFilter;
use crate::store::Store;
use crate::tuner::{Tuner, TunerConfig};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// DVB PAT PID; fixed by ISO/IEC 13818-1.
const PID_PAT: u16 = 0x0000;
/// DVB NIT PID.
const PID_NIT: u16 = 0x0010;
/// DVB SDT/BAT PID.
const PID_SDT: u16 = 0x0011;
/// ATSC PSIP base PID carrying MGT, TVCT/CVCT, and STT.
const PID_ATSC_PSIP: u16 = 0x1FFB;

/// Tracks, per service, the PMT PID last seen in the PAT and whether a PMT
/// has been decoded from it at least once — the basis for [`Engine::tables_ready`].
#[derive(Default)]
struct TableTracker {
    known_pmts: HashMap<u16, u16>,
    decoded_pmts: HashSet<u16>,
    pat_seen: bool,
    sdt_or_vct_seen: bool,
    known_vct_services: HashSet<u16>,
    pat_version: Option<u8>,
}

/// Everything one tuned adapter needs at runtime, built once by the caller
/// and shared with whatever talks to it (a CLI front-end, an RPC server, a
/// test harness).
pub struct Engine {
    pub store: Arc<dyn Store>,
    pub cache: Arc<Cache>,
    pub events: Arc<EventBus>,
    pub frontend: Arc<dyn Frontend>,
    pub tuner: Arc<Tuner>,
    pub scan: Arc<Scan>,
    reader: ReaderHandle,
    primary_filter: Arc<Mutex<Option<Arc<ServiceFilter>>>>,
    tracker: Arc<Mutex<TableTracker>>,
    nit_candidates: Arc<Mutex<Option<Vec<ScanCandidate>>>>,
}

pub struct EngineConfig {
    pub batch_size: usize,
    pub avs_only: bool,
    pub tuner: TunerConfig,
    pub scan: ScanConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            avs_only: false,
            tuner: TunerConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl Engine {
    /// Spawns the reader over `dvr`, wires PSI decoding into its dispatcher,
    /// and builds the tuner and scan controllers around it. `sink` receives
    /// the primary service filter's rewritten output; `primary_service_id`
    /// selects the service it targets initially.
    pub fn start<D: DvrSource + Send + 'static>(
        store: Arc<dyn Store>,
        frontend: Arc<dyn Frontend>,
        dvr: D,
        sink: Arc<dyn DeliverySink>,
        primary_service_id: u16,
        config: EngineConfig,
    ) -> Self {
        let cache = Arc::new(Cache::new(store.clone()));
        let events = Arc::new(EventBus::new());

        let mut dispatcher = Dispatcher::new();
        let group = dispatcher.create_group("psi");
        let mutation_queue = dispatcher.mutation_queue();

        let primary_filter = Arc::new(Mutex::new(Some(Arc::new(ServiceFilter::new(
            sink.clone(),
            primary_service_id,
            config.avs_only,
        )))));
        let tracker = Arc::new(Mutex::new(TableTracker::default()));
        let nit_candidates: Arc<Mutex<Option<Vec<ScanCandidate>>>> = Arc::new(Mutex::new(None));

        attach_pat(&mut dispatcher, group, mutation_queue.clone(), cache.clone(), events.clone(), tracker.clone(), primary_filter.clone());
        attach_sdt(&mut dispatcher, group, cache.clone(), events.clone(), tracker.clone());
        attach_nit(&mut dispatcher, group, events.clone(), nit_candidates.clone());
        attach_atsc(&mut dispatcher, group, cache.clone(), events.clone(), tracker.clone());

        dispatcher.add_section_filter(group, PID_PAT);
        dispatcher.add_section_filter(group, PID_SDT);
        dispatcher.add_section_filter(group, PID_NIT);
        dispatcher.add_section_filter(group, PID_ATSC_PSIP);

        {
            let filter = primary_filter.lock().clone().expect("primary filter just constructed");
            dispatcher.add_packet_filter(group, None, filter);
        }

        let reader = reader::spawn(dvr, dispatcher, config.batch_size);
        let control = reader.control();

        let retarget_filter = primary_filter.clone();
        let sink_for_retarget = sink.clone();
        let avs_only = config.avs_only;
        let on_service_retarget: Arc<dyn Fn(u16) + Send + Sync> = Arc::new(move |service_id| {
            *retarget_filter.lock() = Some(Arc::new(ServiceFilter::new(sink_for_retarget.clone(), service_id, avs_only)));
        });

        let tuner = Arc::new(Tuner::new(
            store.clone(),
            cache.clone(),
            frontend.clone(),
            events.clone(),
            control,
            on_service_retarget,
            config.tuner,
        ));

        let tables_ready: Arc<dyn Fn() -> bool + Send + Sync> = {
            let tracker = tracker.clone();
            Arc::new(move || {
                let t = tracker.lock();
                t.pat_seen && t.sdt_or_vct_seen && t.known_pmts.keys().all(|id| t.decoded_pmts.contains(id))
            })
        };
        let nit_candidates_reader: Arc<dyn Fn() -> Option<Vec<ScanCandidate>> + Send + Sync> = {
            let nit_candidates = nit_candidates.clone();
            Arc::new(move || nit_candidates.lock().clone())
        };

        let scan = Arc::new(Scan::new(
            frontend.clone(),
            events.clone(),
            tuner.clone(),
            tables_ready,
            nit_candidates_reader,
            config.scan,
        ));

        Self {
            store,
            cache,
            events,
            frontend,
            tuner,
            scan,
            reader,
            primary_filter,
            tracker,
            nit_candidates,
        }
    }

    pub fn total_packets(&self) -> u64 {
        self.reader.total_packets()
    }

    pub fn bitrate_bps(&self) -> u64 {
        self.reader.bitrate_bps()
    }

    /// The PID currently carrying the primary service's rewritten PMT, if any.
    pub fn primary_pmt_pid(&self) -> Option<u16> {
        self.primary_filter.lock().as_ref().and_then(|f| f.pmt_pid())
    }

    pub async fn shutdown(self) {
        self.reader.shutdown().await;
    }
}

fn attach_pat(
    dispatcher: &mut Dispatcher,
    group: GroupId,
    mutation_queue: crate::dispatch::MutationQueue,
    cache: Arc<Cache>,
    events: Arc<EventBus>,
    tracker: Arc<Mutex<TableTracker>>,
    primary_filter: Arc<Mutex<Option<Arc<ServiceFilter>>>>,
) {
    let demux = dispatcher.demultiplexer_mut(group).expect("group just created");
    let pat_asm = Mutex::new(PatAssembler::new());
    demux.attach(TABLE_ID_PAT, None, move |section: &Section| {
        let Some(pat) = pat_asm.lock().accept(section) else { return };

        let version_bumped = {
            let mut t = tracker.lock();
            t.pat_seen = true;
            let bumped = t.pat_version.is_some() && t.pat_version != Some(pat.version);
            t.pat_version = Some(pat.version);
            bumped
        };
        if version_bumped {
            mutation_queue.notify_ts_structure_changed();
        }

        for entry in pat.services() {
            cache.ensure_service(entry.program_number);
            let _ = cache.update_service_pmt_pid(entry.program_number, entry.pid);
            cache.service_seen(entry.program_number, true, true);

            let newly_seen = {
                let mut t = tracker.lock();
                let changed = t.known_pmts.get(&entry.program_number) != Some(&entry.pid);
                if changed {
                    t.known_pmts.insert(entry.program_number, entry.pid);
                }
                changed
            };
            if !newly_seen {
                continue;
            }

            mutation_queue.add_section_filter(group, entry.pid);

            let pmt_asm = Mutex::new(PmtAssembler::new());
            let cache = cache.clone();
            let events = events.clone();
            let tracker = tracker.clone();
            let primary_filter = primary_filter.clone();
            mutation_queue.attach_section_handler(
                group,
                TABLE_ID_PMT,
                Some(entry.program_number),
                Arc::new(move |section: &Section| {
                    let Some(pmt) = pmt_asm.lock().accept(section) else { return };
                    tracker.lock().decoded_pmts.insert(pmt.program_number);

                    let _ = cache.update_service_ca(pmt.program_number, pmt.conditional_access());
                    let _ = cache.update_service_pcr_pid(pmt.program_number, pmt.pcr_pid);
                    let _ = cache.update_service_pmt_version(pmt.program_number, pmt.version);
                    let info = ProgramInfo {
                        pids: pmt
                            .streams
                            .iter()
                            .map(|s| PidInfo {
                                pid: s.elementary_pid,
                                stream_type: s.stream_type,
                                subtype: None,
                                pmt_version: pmt.version,
                                descriptors: s.descriptors.clone(),
                            })
                            .collect(),
                    };
                    let _ = cache.update_program_info(pmt.program_number, info);

                    if let Some(filter) = primary_filter.lock().as_ref() {
                        filter.on_pmt(&pmt);
                    }
                    events.fire("mpeg2", "pmt", Arc::new(pmt));
                }),
            );
        }

        if let Some(filter) = primary_filter.lock().as_ref() {
            filter.on_pat(&pat);
        }
        events.fire("mpeg2", "pat", Arc::new(pat));
    });
}

fn attach_sdt(
    dispatcher: &mut Dispatcher,
    group: GroupId,
    cache: Arc<Cache>,
    events: Arc<EventBus>,
    tracker: Arc<Mutex<TableTracker>>,
) {
    let demux = dispatcher.demultiplexer_mut(group).expect("group just created");
    for table_id in [TABLE_ID_SDT_ACTUAL, TABLE_ID_SDT_OTHER] {
        let cache = cache.clone();
        let events = events.clone();
        let tracker = tracker.clone();
        let sdt_asm = Mutex::new(SdtAssembler::new());
        demux.attach(table_id, None, move |section: &Section| {
            let Some(sdt) = sdt_asm.lock().accept(section) else { return };
            tracker.lock().sdt_or_vct_seen = true;
            for service in &sdt.services {
                cache.ensure_service(service.service_id);
                let _ = cache.update_service_name(service.service_id, &service.name);
                let _ = cache.update_service_type(service.service_id, service.service_type);
                let _ = cache.update_service_ca(service.service_id, service.conditional_access);
            }

            let cache_for_onid = cache.clone();
            let original_network_id = sdt.original_network_id;
            let transport_stream_id = sdt.transport_stream_id;
            tokio::spawn(async move {
                if let Err(err) = cache_for_onid.set_network_id(original_network_id, transport_stream_id).await {
                    log::warn!("sdt: failed to set multiplex network id: {err}");
                }
            });

            events.fire("dvb", "sdt", Arc::new(sdt));
        });
    }
}

fn attach_nit(
    dispatcher: &mut Dispatcher,
    group: GroupId,
    events: Arc<EventBus>,
    nit_candidates: Arc<Mutex<Option<Vec<ScanCandidate>>>>,
) {
    let demux = dispatcher.demultiplexer_mut(group).expect("group just created");
    for table_id in [TABLE_ID_NIT_ACTUAL, TABLE_ID_NIT_OTHER] {
        let events = events.clone();
        let nit_candidates = nit_candidates.clone();
        let nit_asm = Mutex::new(NitAssembler::new());
        demux.attach(table_id, None, move |section: &Section| {
            let Some(nit) = nit_asm.lock().accept(section) else { return };
            let candidates: Vec<ScanCandidate> = nit
                .transports
                .iter()
                .filter_map(|t| {
                    let params = t.candidate.clone()?;
                    let delivery_system = match params.get("DeliverySystem") {
                        Some("DVB-S") => crate::model::DeliverySystem::DvbS,
                        Some("DVB-C") => crate::model::DeliverySystem::DvbC,
                        _ => crate::model::DeliverySystem::DvbT,
                    };
                    Some(ScanCandidate { delivery_system, params })
                })
                .collect();
            *nit_candidates.lock() = Some(candidates);
            events.fire("dvb", "nit", Arc::new(nit));
        });
    }
}

fn attach_atsc(
    dispatcher: &mut Dispatcher,
    group: GroupId,
    cache: Arc<Cache>,
    events: Arc<EventBus>,
    tracker: Arc<Mutex<TableTracker>>,
) {
    let demux = dispatcher.demultiplexer_mut(group).expect("group just created");

    let events_mgt = events.clone();
    let mgt_asm = Mutex::new(MgtAssembler::new());
    demux.attach(TABLE_ID_MGT, None, move |section: &Section| {
        let Some(mgt) = mgt_asm.lock().accept(section) else { return };
        events_mgt.fire("atsc", "mgt", Arc::new(mgt));
    });

    for table_id in [TABLE_ID_TVCT, TABLE_ID_CVCT] {
        let cache = cache.clone();
        let events = events.clone();
        let tracker = tracker.clone();
        let vct_asm = Mutex::new(VctAssembler::new());
        demux.attach(table_id, None, move |section: &Section| {
            let Some(vct) = vct_asm.lock().accept(section) else { return };

            let current_ids: HashSet<u16> = vct.channels.iter().map(|c| c.program_number).collect();
            let previous_ids = {
                let mut t = tracker.lock();
                t.sdt_or_vct_seen = true;
                std::mem::replace(&mut t.known_vct_services, current_ids.clone())
            };
            for missing in previous_ids.difference(&current_ids) {
                cache.service_seen(*missing, false, false);
            }

            for channel in &vct.channels {
                cache.ensure_service(channel.program_number);
                let _ = cache.update_service_name(channel.program_number, &channel.short_name);
                let _ = cache.update_service_type(channel.program_number, channel.service_type);
                let _ = cache.update_service_source_id(channel.program_number, channel.source_id);
                cache.service_seen(channel.program_number, true, false);
            }
            events.fire("atsc", "vct", Arc::new(vct));
        });
    }

    let events_stt = events.clone();
    demux.attach(TABLE_ID_STT, None, move |section: &Section| {
        let Some(stt) = crate::psi::atsc::decode_stt(section) else { return };
        events_stt.fire("atsc", "stt", Arc::new(stt));
    });
}
