//! PID filter group dispatch (spec §4.6, component C7).
//!
//! The reader thread owns one [`Dispatcher`] and calls [`Dispatcher::dispatch`]
//! once per packet. A flat 8192-entry index maps PID to the ordered list of
//! groups registered for it; section filters run before packet filters for a
//! given packet, and groups registered for `ALL` run after PID-specific ones,
//! matching §4.6's ordering rule. Mutations a handler issues while running
//! inside `dispatch` are queued and applied at the start of the next call —
//! mutating `self` mid-iteration is impossible in safe Rust anyway, so the
//! deferred-apply behavior §4.6 asks for falls out of the borrow checker
//! rather than needing an explicit "is dispatching" flag.

use crate::packet::Packet;
use crate::psi::{Demultiplexer, Section};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Total PID space; PID 8191 ([`crate::packet::PID_NULL`]) is a valid index
/// here even though it never carries real payload.
pub const PID_COUNT: usize = 8192;

/// Implemented by packet-filter owners (chiefly [`crate::servicefilter::ServiceFilter`]).
pub trait PacketHandler: Send + Sync {
    fn on_packet(&self, group: &str, packet: &Packet<'_>);

    /// Called once per group when [`Dispatcher::notify_ts_structure_changed`]
    /// runs. Most handlers don't care about TS-structure changes directly
    /// (they react to the table decodes that follow instead), so this
    /// defaults to a no-op.
    fn on_group_event(&self, _group: &str, _event: GroupEvent) {}
}

/// Handle identifying a registered filter group; opaque outside this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(u64);

/// A queue a [`PacketHandler`] can capture to mutate the dispatcher from
/// inside its own `on_packet` callback without re-entering `&mut self`.
#[derive(Clone)]
pub struct MutationQueue(Arc<Mutex<VecDeque<Mutation>>>);

impl MutationQueue {
    pub fn add_packet_filter(&self, group: GroupId, pid: Option<u16>, handler: Arc<dyn PacketHandler>) {
        self.0.lock().push_back(Mutation::AddPacketFilter(group, pid, handler));
    }

    pub fn remove_packet_filter(&self, group: GroupId, pid: Option<u16>) {
        self.0.lock().push_back(Mutation::RemovePacketFilter(group, pid));
    }

    /// Queues `pid` to start reaching `group`'s demultiplexer, installed at
    /// the start of the next `dispatch` call. Paired with
    /// [`MutationQueue::attach_section_handler`] when a handler discovers a
    /// new table's PID at runtime: the PID must be routed to the group's
    /// demux before a handler attached for it can ever see a packet.
    pub fn add_section_filter(&self, group: GroupId, pid: u16) {
        self.0.lock().push_back(Mutation::AddSectionFilter(group, pid));
    }

    /// Queues a new section-table handler for `group`'s demultiplexer,
    /// installed at the start of the next `dispatch` call. Lets a handler
    /// (e.g. a PAT decoder) discover a new PID at runtime — a PMT's location
    /// — and attach a decoder for it without needing `&mut Dispatcher` itself.
    pub fn attach_section_handler(
        &self,
        group: GroupId,
        table_id: u8,
        extension: Option<u16>,
        handler: Arc<dyn Fn(&Section) + Send + Sync>,
    ) {
        self.0
            .lock()
            .push_back(Mutation::AttachSectionHandler(group, table_id, extension, handler));
    }

    /// Queues a TS-structure-change notification (§4.6), applied at the start
    /// of the next `dispatch` call — used by a PAT handler (which only has
    /// `&self`) noticing its table's version bump.
    pub fn notify_ts_structure_changed(&self) {
        self.0.lock().push_back(Mutation::NotifyTsStructureChanged);
    }
}

enum Mutation {
    AddPacketFilter(GroupId, Option<u16>, Arc<dyn PacketHandler>),
    RemovePacketFilter(GroupId, Option<u16>),
    AttachSectionHandler(GroupId, u8, Option<u16>, Arc<dyn Fn(&Section) + Send + Sync>),
    AddSectionFilter(GroupId, u16),
    NotifyTsStructureChanged,
}

struct GroupState {
    name: String,
    demux: Demultiplexer,
}

/// Events a group observes, fired once per group when the corresponding
/// dispatcher-level transition happens.
#[derive(Debug, Clone, Copy)]
pub enum GroupEvent {
    MuxChanged(Option<u32>),
    TsStructureChanged,
}

pub struct Dispatcher {
    groups: std::collections::HashMap<u64, GroupState>,
    pid_section_index: Vec<Vec<u64>>,
    pid_packet_index: Vec<Vec<(u64, Arc<dyn PacketHandler>)>>,
    all_packet_filters: Vec<(u64, Arc<dyn PacketHandler>)>,
    next_id: AtomicU64,
    pending: Arc<Mutex<VecDeque<Mutation>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            groups: std::collections::HashMap::new(),
            pid_section_index: vec![Vec::new(); PID_COUNT],
            pid_packet_index: (0..PID_COUNT).map(|_| Vec::new()).collect(),
            all_packet_filters: Vec::new(),
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn mutation_queue(&self) -> MutationQueue {
        MutationQueue(self.pending.clone())
    }

    /// Registers a new, initially empty filter group.
    pub fn create_group(&mut self, name: impl Into<String>) -> GroupId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.groups.insert(
            id,
            GroupState {
                name: name.into(),
                demux: Demultiplexer::new(),
            },
        );
        GroupId(id)
    }

    pub fn remove_group(&mut self, group: GroupId) {
        self.groups.remove(&group.0);
        for pids in self.pid_section_index.iter_mut() {
            pids.retain(|id| *id != group.0);
        }
        for pids in self.pid_packet_index.iter_mut() {
            pids.retain(|(id, _)| *id != group.0);
        }
        self.all_packet_filters.retain(|(id, _)| *id != group.0);
    }

    /// Access to a group's section demultiplexer, e.g. to `attach` a table decoder.
    pub fn demultiplexer_mut(&mut self, group: GroupId) -> Option<&mut Demultiplexer> {
        self.groups.get_mut(&group.0).map(|g| &mut g.demux)
    }

    pub fn add_section_filter(&mut self, group: GroupId, pid: u16) {
        let entries = &mut self.pid_section_index[pid as usize];
        if !entries.contains(&group.0) {
            entries.push(group.0);
        }
    }

    pub fn remove_section_filter(&mut self, group: GroupId, pid: u16) {
        self.pid_section_index[pid as usize].retain(|id| *id != group.0);
    }

    pub fn add_packet_filter(&mut self, group: GroupId, pid: Option<u16>, handler: Arc<dyn PacketHandler>) {
        match pid {
            Some(pid) => self.pid_packet_index[pid as usize].push((group.0, handler)),
            None => self.all_packet_filters.push((group.0, handler)),
        }
    }

    pub fn remove_packet_filter(&mut self, group: GroupId, pid: Option<u16>) {
        match pid {
            Some(pid) => self.pid_packet_index[pid as usize].retain(|(id, _)| *id != group.0),
            None => self.all_packet_filters.retain(|(id, _)| *id != group.0),
        }
    }

    fn apply_pending(&mut self) {
        let mutations: Vec<Mutation> = self.pending.lock().drain(..).collect();
        for mutation in mutations {
            match mutation {
                Mutation::AddPacketFilter(group, pid, handler) => self.add_packet_filter(group, pid, handler),
                Mutation::RemovePacketFilter(group, pid) => self.remove_packet_filter(group, pid),
                Mutation::AttachSectionHandler(group, table_id, extension, handler) => {
                    if let Some(g) = self.groups.get_mut(&group.0) {
                        g.demux.attach(table_id, extension, move |s| handler(s));
                    }
                }
                Mutation::AddSectionFilter(group, pid) => self.add_section_filter(group, pid),
                Mutation::NotifyTsStructureChanged => self.notify_ts_structure_changed(),
            }
        }
    }

    /// Resets every group's section assembly state so duplicates of
    /// unchanged tables re-flow to their handlers, and notifies every
    /// registered packet filter of the change exactly once (§4.6).
    pub fn notify_ts_structure_changed(&mut self) {
        for pid in 0..PID_COUNT {
            for group in self.groups.values_mut() {
                group.demux.reset_pid(pid as u16);
            }
        }
        for (group_id, handler) in self.all_packet_filters.iter() {
            if let Some(group) = self.groups.get(group_id) {
                handler.on_group_event(&group.name, GroupEvent::TsStructureChanged);
            }
        }
        for pid_filters in self.pid_packet_index.iter() {
            for (group_id, handler) in pid_filters.iter() {
                if let Some(group) = self.groups.get(group_id) {
                    handler.on_group_event(&group.name, GroupEvent::TsStructureChanged);
                }
            }
        }
    }

    /// Dispatches one packet: pending mutations from the previous call are
    /// applied first, then section filters for this PID run (in insertion
    /// order), then PID-specific packet filters, then `ALL` packet filters.
    pub fn dispatch(&mut self, packet: &Packet<'_>) {
        self.apply_pending();

        let pid = packet.pid();
        let group_ids = self.pid_section_index[pid as usize].clone();
        for group_id in group_ids {
            if let Some(group) = self.groups.get_mut(&group_id) {
                group.demux.push_packet(pid, packet);
            }
        }

        for (group_id, handler) in self.pid_packet_index[pid as usize].clone() {
            let name = self.groups.get(&group_id).map(|g| g.name.clone()).unwrap_or_default();
            handler.on_packet(&name, packet);
        }
        for (group_id, handler) in self.all_packet_filters.clone() {
            let name = self.groups.get(&group_id).map(|g| g.name.clone()).unwrap_or_default();
            handler.on_packet(&name, packet);
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
