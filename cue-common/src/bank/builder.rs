//! In-memory bank writer
//!
//! Produces buffers in the exact layout [`Bank`](super::Bank) reads. Used by
//! tests and by tooling that needs small hand-built banks; node references
//! are builder handles and are resolved to byte offsets in [`BankBuilder::build`].

use super::format::*;

/// Builder-side reference to a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef {
    kind: NodeKind,
    index: usize,
}

#[derive(Debug, Clone)]
struct FileNodeSpec {
    file_index: u32,
    looping: bool,
    next: Option<NodeRef>,
    filter: Option<usize>,
}

#[derive(Debug, Clone)]
struct GroupSpec {
    name: String,
    volume: f32,
    cross_fade_ms: u32,
    bus_index: u32,
    first_node: Option<NodeRef>,
}

#[derive(Debug, Clone)]
struct EventSpec {
    name: String,
    actions: Vec<Action>,
}

/// Writes event banks
#[derive(Debug, Clone)]
pub struct BankBuilder {
    version: u32,
    files: Vec<FileInfo>,
    file_nodes: Vec<FileNodeSpec>,
    random_nodes: Vec<Vec<NodeRef>>,
    sequence_nodes: Vec<Vec<NodeRef>>,
    repeat_nodes: Vec<(u32, NodeRef)>,
    delay_nodes: Vec<(u32, Option<NodeRef>)>,
    fade_filters: Vec<FadeFilterNode>,
    groups: Vec<GroupSpec>,
    events: Vec<EventSpec>,
    buses: Vec<(String, f32)>,
    stream_sources: Vec<String>,
}

impl Default for BankBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BankBuilder {
    pub fn new() -> Self {
        Self {
            version: BANK_VERSION,
            files: Vec::new(),
            file_nodes: Vec::new(),
            random_nodes: Vec::new(),
            sequence_nodes: Vec::new(),
            repeat_nodes: Vec::new(),
            delay_nodes: Vec::new(),
            fade_filters: Vec::new(),
            groups: Vec::new(),
            events: Vec::new(),
            buses: Vec::new(),
            stream_sources: Vec::new(),
        }
    }

    /// Override the header version (for exercising version checks)
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn add_file(&mut self, info: FileInfo) -> u32 {
        self.files.push(info);
        (self.files.len() - 1) as u32
    }

    pub fn add_bus(&mut self, name: &str, volume: f32) -> u32 {
        self.buses.push((name.to_string(), volume));
        (self.buses.len() - 1) as u32
    }

    pub fn add_stream_source(&mut self, path: &str) -> u32 {
        self.stream_sources.push(path.to_string());
        (self.stream_sources.len() - 1) as u32
    }

    pub fn file_node(&mut self, file_index: u32, looping: bool) -> NodeRef {
        self.file_node_full(file_index, looping, None, None)
    }

    /// File node with an optional successor and optional fade filter
    /// `(start_ms, end_ms)`
    pub fn file_node_full(
        &mut self,
        file_index: u32,
        looping: bool,
        next: Option<NodeRef>,
        filter: Option<(u32, u32)>,
    ) -> NodeRef {
        let filter = filter.map(|(start_ms, end_ms)| {
            self.fade_filters.push(FadeFilterNode { start_ms, end_ms });
            self.fade_filters.len() - 1
        });
        self.file_nodes.push(FileNodeSpec {
            file_index,
            looping,
            next,
            filter,
        });
        NodeRef {
            kind: NodeKind::File,
            index: self.file_nodes.len() - 1,
        }
    }

    /// Point an existing file or delay node at a successor
    pub fn set_next(&mut self, node: NodeRef, next: NodeRef) {
        match node.kind {
            NodeKind::File => self.file_nodes[node.index].next = Some(next),
            NodeKind::Delay => self.delay_nodes[node.index].1 = Some(next),
            _ => {}
        }
    }

    pub fn random(&mut self, children: Vec<NodeRef>) -> NodeRef {
        self.random_nodes.push(children);
        NodeRef {
            kind: NodeKind::Random,
            index: self.random_nodes.len() - 1,
        }
    }

    pub fn sequence(&mut self, children: Vec<NodeRef>) -> NodeRef {
        self.sequence_nodes.push(children);
        NodeRef {
            kind: NodeKind::Sequence,
            index: self.sequence_nodes.len() - 1,
        }
    }

    pub fn repeat(&mut self, repeat_count: u32, child: NodeRef) -> NodeRef {
        self.repeat_nodes.push((repeat_count, child));
        NodeRef {
            kind: NodeKind::Repeat,
            index: self.repeat_nodes.len() - 1,
        }
    }

    pub fn delay(&mut self, time_ms: u32, next: Option<NodeRef>) -> NodeRef {
        self.delay_nodes.push((time_ms, next));
        NodeRef {
            kind: NodeKind::Delay,
            index: self.delay_nodes.len() - 1,
        }
    }

    pub fn add_group(
        &mut self,
        name: &str,
        volume: f32,
        cross_fade_ms: u32,
        bus_index: u32,
        first_node: Option<NodeRef>,
    ) -> u32 {
        self.groups.push(GroupSpec {
            name: name.to_string(),
            volume,
            cross_fade_ms,
            bus_index,
            first_node,
        });
        (self.groups.len() - 1) as u32
    }

    pub fn add_event(&mut self, name: &str, actions: Vec<Action>) {
        self.events.push(EventSpec {
            name: name.to_string(),
            actions,
        });
    }

    /// Lay out and serialize the bank
    pub fn build(&self) -> Vec<u8> {
        let mut events = self.events.clone();
        events.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));

        // Fixed-size tables, in store order
        let mut cursor = (HEADER_SIZE + STORE_SIZE) as u32;
        let mut place = |count: usize, size: usize| {
            let offset = cursor;
            cursor += (count * size) as u32;
            offset
        };
        let files_at = place(self.files.len(), FILE_INFO_SIZE);
        let file_nodes_at = place(self.file_nodes.len(), FILE_NODE_SIZE);
        let random_at = place(self.random_nodes.len(), LIST_NODE_SIZE);
        let sequence_at = place(self.sequence_nodes.len(), LIST_NODE_SIZE);
        let repeat_at = place(self.repeat_nodes.len(), REPEAT_NODE_SIZE);
        let delay_at = place(self.delay_nodes.len(), DELAY_NODE_SIZE);
        let filters_at = place(self.fade_filters.len(), FADE_FILTER_SIZE);
        let groups_at = place(self.groups.len(), GROUP_SIZE);
        let events_at = place(events.len(), EVENT_SIZE);
        let buses_at = place(self.buses.len(), BUS_SIZE);
        let sources_at = place(self.stream_sources.len(), STREAM_SOURCE_SIZE);

        let mut out = Vec::with_capacity(cursor as usize * 2);
        let mut tail = Vec::new();
        let tail_base = cursor;

        // Variable-length data goes after the tables
        let push_tail = |tail: &mut Vec<u8>, data: &[u8]| -> u32 {
            let offset = tail_base + tail.len() as u32;
            tail.extend_from_slice(data);
            offset
        };

        let desc = |node: Option<NodeRef>| -> (u32, u32) {
            match node {
                None => (NodeKind::None as u32, 0),
                Some(n) => {
                    let (base, size) = match n.kind {
                        NodeKind::File => (file_nodes_at, FILE_NODE_SIZE),
                        NodeKind::Random => (random_at, LIST_NODE_SIZE),
                        NodeKind::Sequence => (sequence_at, LIST_NODE_SIZE),
                        NodeKind::Repeat => (repeat_at, REPEAT_NODE_SIZE),
                        NodeKind::Delay => (delay_at, DELAY_NODE_SIZE),
                        NodeKind::None => return (0, 0),
                    };
                    (n.kind as u32, base + (n.index * size) as u32)
                }
            }
        };

        // Header + store
        put_u32(&mut out, self.version);
        put_u32(&mut out, HEADER_SIZE as u32);
        for (count, offset) in [
            (self.files.len(), files_at),
            (self.file_nodes.len(), file_nodes_at),
            (self.random_nodes.len(), random_at),
            (self.sequence_nodes.len(), sequence_at),
            (self.repeat_nodes.len(), repeat_at),
            (self.delay_nodes.len(), delay_at),
            (self.fade_filters.len(), filters_at),
            (self.groups.len(), groups_at),
            (events.len(), events_at),
            (self.buses.len(), buses_at),
            (self.stream_sources.len(), sources_at),
        ] {
            put_u32(&mut out, count as u32);
            put_u32(&mut out, offset);
        }

        for f in &self.files {
            for v in [
                f.coding_format,
                f.sample_rate,
                f.channels,
                f.flags,
                f.frame_count,
                f.loop_start,
                f.loop_end,
                f.source_index,
                f.data_offset,
                f.data_size,
            ] {
                put_u32(&mut out, v);
            }
        }

        for n in &self.file_nodes {
            put_u32(&mut out, n.file_index);
            put_u32(&mut out, if n.looping { FILE_NODE_FLAG_LOOP } else { 0 });
            let (k, o) = desc(n.next);
            put_u32(&mut out, k);
            put_u32(&mut out, o);
            let filter = n
                .filter
                .map(|i| filters_at + (i * FADE_FILTER_SIZE) as u32)
                .unwrap_or(0);
            put_u32(&mut out, filter);
        }

        for children in self.random_nodes.iter().chain(self.sequence_nodes.iter()) {
            let mut list = Vec::with_capacity(children.len() * NODE_DESC_SIZE);
            for child in children {
                let (k, o) = desc(Some(*child));
                put_u32(&mut list, k);
                put_u32(&mut list, o);
            }
            let at = push_tail(&mut tail, &list);
            put_u32(&mut out, children.len() as u32);
            put_u32(&mut out, at);
        }

        for (count, child) in &self.repeat_nodes {
            put_u32(&mut out, *count);
            let (k, o) = desc(Some(*child));
            put_u32(&mut out, k);
            put_u32(&mut out, o);
        }

        for (time_ms, next) in &self.delay_nodes {
            put_u32(&mut out, *time_ms);
            let (k, o) = desc(*next);
            put_u32(&mut out, k);
            put_u32(&mut out, o);
        }

        for f in &self.fade_filters {
            put_u32(&mut out, f.start_ms);
            put_u32(&mut out, f.end_ms);
        }

        for g in &self.groups {
            let name_at = push_tail(&mut tail, g.name.as_bytes());
            put_u32(&mut out, g.name.len() as u32);
            put_u32(&mut out, name_at);
            put_u32(&mut out, g.volume.to_bits());
            put_u32(&mut out, g.cross_fade_ms);
            put_u32(&mut out, g.bus_index);
            let (k, o) = desc(g.first_node);
            put_u32(&mut out, k);
            put_u32(&mut out, o);
        }

        for e in &events {
            let name_at = push_tail(&mut tail, e.name.as_bytes());
            let mut actions = Vec::with_capacity(e.actions.len() * ACTION_SIZE);
            for a in &e.actions {
                put_u32(&mut actions, a.kind as u32);
                put_u32(&mut actions, a.target_index);
                put_u32(&mut actions, a.fade_ms);
            }
            let actions_at = push_tail(&mut tail, &actions);
            put_u32(&mut out, e.name.len() as u32);
            put_u32(&mut out, name_at);
            put_u32(&mut out, e.actions.len() as u32);
            put_u32(&mut out, actions_at);
        }

        for (name, volume) in &self.buses {
            let name_at = push_tail(&mut tail, name.as_bytes());
            put_u32(&mut out, name.len() as u32);
            put_u32(&mut out, name_at);
            put_u32(&mut out, volume.to_bits());
        }

        for path in &self.stream_sources {
            let path_at = push_tail(&mut tail, path.as_bytes());
            put_u32(&mut out, path.len() as u32);
            put_u32(&mut out, path_at);
        }

        debug_assert_eq!(out.len() as u32, tail_base);
        out.extend_from_slice(&tail);
        out
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}
