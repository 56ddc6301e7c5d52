//! Validated, zero-copy view over an event bank buffer
//!
//! The whole bank is validated once in [`Bank::from_bytes`]: header, every
//! typed array, every node descriptor and every string reference. After
//! that, accessors resolve offsets against the typed tables and hand back
//! plain record values; a descriptor that does not land on a record of the
//! right table resolves to `None`.

use super::format::*;
use crate::{Error, Result};
use std::cmp::Ordering;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ArrayRef {
    count: u32,
    offset: u32,
}

impl ArrayRef {
    fn contains_record(&self, offset: u32, record_size: usize) -> bool {
        if offset < self.offset {
            return false;
        }
        let rel = (offset - self.offset) as usize;
        rel % record_size == 0 && rel / record_size < self.count as usize
    }

    fn record_offset(&self, index: u32, record_size: usize) -> Option<usize> {
        if index < self.count {
            Some(self.offset as usize + index as usize * record_size)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Store {
    files: ArrayRef,
    file_nodes: ArrayRef,
    random_nodes: ArrayRef,
    sequence_nodes: ArrayRef,
    repeat_nodes: ArrayRef,
    delay_nodes: ArrayRef,
    fade_filters: ArrayRef,
    groups: ArrayRef,
    events: ArrayRef,
    buses: ArrayRef,
    stream_sources: ArrayRef,
}

/// An immutable, validated event bank
#[derive(Debug)]
pub struct Bank {
    bytes: Box<[u8]>,
    store: Store,
}

impl Bank {
    /// Validate `bytes` and take ownership of it.
    ///
    /// # Errors
    /// - [`Error::VersionMismatch`] when the header version differs from [`BANK_VERSION`]
    /// - [`Error::BankFormat`] for any truncated array, dangling offset, unknown
    ///   tag or unsorted event table
    pub fn from_bytes(bytes: impl Into<Box<[u8]>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() < HEADER_SIZE {
            return Err(Error::BankFormat(format!(
                "buffer too small for header: {} bytes",
                bytes.len()
            )));
        }

        let version = le_u32(&bytes, 0);
        if version != BANK_VERSION {
            return Err(Error::VersionMismatch {
                expected: BANK_VERSION,
                found: version,
            });
        }

        let store_offset = le_u32(&bytes, 4) as usize;
        check_range(&bytes, store_offset, STORE_SIZE, "store")?;

        let array_at = |i: usize| ArrayRef {
            count: le_u32(&bytes, store_offset + i * ARRAY_REF_SIZE),
            offset: le_u32(&bytes, store_offset + i * ARRAY_REF_SIZE + 4),
        };
        let store = Store {
            files: array_at(0),
            file_nodes: array_at(1),
            random_nodes: array_at(2),
            sequence_nodes: array_at(3),
            repeat_nodes: array_at(4),
            delay_nodes: array_at(5),
            fade_filters: array_at(6),
            groups: array_at(7),
            events: array_at(8),
            buses: array_at(9),
            stream_sources: array_at(10),
        };

        let bank = Bank { bytes, store };
        bank.validate()?;

        debug!(
            "Bank loaded: {} files, {} groups, {} events, {} buses, {} stream sources",
            bank.store.files.count,
            bank.store.groups.count,
            bank.store.events.count,
            bank.store.buses.count,
            bank.store.stream_sources.count
        );

        Ok(bank)
    }

    /// Raw bank bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn validate(&self) -> Result<()> {
        let s = &self.store;
        let tables = [
            (s.files, FILE_INFO_SIZE, "files"),
            (s.file_nodes, FILE_NODE_SIZE, "file nodes"),
            (s.random_nodes, LIST_NODE_SIZE, "random nodes"),
            (s.sequence_nodes, LIST_NODE_SIZE, "sequence nodes"),
            (s.repeat_nodes, REPEAT_NODE_SIZE, "repeat nodes"),
            (s.delay_nodes, DELAY_NODE_SIZE, "delay nodes"),
            (s.fade_filters, FADE_FILTER_SIZE, "fade filters"),
            (s.groups, GROUP_SIZE, "groups"),
            (s.events, EVENT_SIZE, "events"),
            (s.buses, BUS_SIZE, "buses"),
            (s.stream_sources, STREAM_SOURCE_SIZE, "stream sources"),
        ];
        for (array, size, what) in tables {
            let len = (array.count as usize)
                .checked_mul(size)
                .ok_or_else(|| Error::BankFormat(format!("{} table overflows", what)))?;
            check_range(&self.bytes, array.offset as usize, len, what)?;
        }

        for i in 0..s.file_nodes.count {
            let base = s.file_nodes.offset as usize + i as usize * FILE_NODE_SIZE;
            let file_index = le_u32(&self.bytes, base);
            if file_index >= s.files.count {
                return Err(Error::BankFormat(format!(
                    "file node {} references missing file {}",
                    i, file_index
                )));
            }
            self.validate_desc(self.raw_desc(base + 8), "file node next")?;
            let filter = le_u32(&self.bytes, base + 16);
            if filter != 0 && !s.fade_filters.contains_record(filter, FADE_FILTER_SIZE) {
                return Err(Error::BankFormat(format!(
                    "file node {} has dangling filter offset {}",
                    i, filter
                )));
            }
        }

        for (table, what) in [
            (s.random_nodes, "random node"),
            (s.sequence_nodes, "sequence node"),
        ] {
            for i in 0..table.count {
                let base = table.offset as usize + i as usize * LIST_NODE_SIZE;
                let children = self.raw_array(base);
                let len = children.count as usize * NODE_DESC_SIZE;
                check_range(&self.bytes, children.offset as usize, len, what)?;
                for c in 0..children.count as usize {
                    let desc = self.raw_desc(children.offset as usize + c * NODE_DESC_SIZE);
                    self.validate_desc(desc, what)?;
                }
            }
        }

        for i in 0..s.repeat_nodes.count {
            let base = s.repeat_nodes.offset as usize + i as usize * REPEAT_NODE_SIZE;
            self.validate_desc(self.raw_desc(base + 4), "repeat node child")?;
        }

        for i in 0..s.delay_nodes.count {
            let base = s.delay_nodes.offset as usize + i as usize * DELAY_NODE_SIZE;
            self.validate_desc(self.raw_desc(base + 4), "delay node next")?;
        }

        for i in 0..s.groups.count {
            let base = s.groups.offset as usize + i as usize * GROUP_SIZE;
            self.validate_str(base, "group name")?;
            let bus_index = le_u32(&self.bytes, base + 16);
            if bus_index >= s.buses.count {
                return Err(Error::BankFormat(format!(
                    "group {} outputs to missing bus {}",
                    i, bus_index
                )));
            }
            self.validate_desc(self.raw_desc(base + 20), "group first node")?;
        }

        for i in 0..s.buses.count {
            let base = s.buses.offset as usize + i as usize * BUS_SIZE;
            self.validate_str(base, "bus name")?;
        }

        for i in 0..s.stream_sources.count {
            let base = s.stream_sources.offset as usize + i as usize * STREAM_SOURCE_SIZE;
            self.validate_str(base, "stream source path")?;
        }

        for i in 0..s.files.count {
            let base = s.files.offset as usize + i as usize * FILE_INFO_SIZE;
            let flags = le_u32(&self.bytes, base + 12);
            let source_index = le_u32(&self.bytes, base + 28);
            if flags & FILE_FLAG_STREAM != 0
                && s.stream_sources.count > 0
                && source_index >= s.stream_sources.count
            {
                return Err(Error::BankFormat(format!(
                    "file {} references missing stream source {}",
                    i, source_index
                )));
            }
        }

        let mut previous: Option<&[u8]> = None;
        for i in 0..s.events.count {
            let base = s.events.offset as usize + i as usize * EVENT_SIZE;
            let name = self.validate_str(base, "event name")?;
            if let Some(prev) = previous {
                if prev >= name {
                    return Err(Error::BankFormat(format!(
                        "event table not sorted at index {}",
                        i
                    )));
                }
            }
            previous = Some(name);

            let actions = self.raw_array(base + 8);
            check_range(
                &self.bytes,
                actions.offset as usize,
                actions.count as usize * ACTION_SIZE,
                "event actions",
            )?;
            for a in 0..actions.count as usize {
                let kind = le_u32(&self.bytes, actions.offset as usize + a * ACTION_SIZE);
                if ActionKind::from_u32(kind).is_none() {
                    return Err(Error::BankFormat(format!(
                        "event {} has unknown action kind {}",
                        i, kind
                    )));
                }
            }
        }

        Ok(())
    }

    fn validate_desc(&self, desc: (u32, u32), what: &str) -> Result<()> {
        let (kind, offset) = desc;
        let kind = NodeKind::from_u32(kind)
            .ok_or_else(|| Error::BankFormat(format!("{}: unknown node kind {}", what, kind)))?;
        let ok = match kind {
            NodeKind::None => true,
            NodeKind::File => self.store.file_nodes.contains_record(offset, FILE_NODE_SIZE),
            NodeKind::Random => self.store.random_nodes.contains_record(offset, LIST_NODE_SIZE),
            NodeKind::Sequence => self
                .store
                .sequence_nodes
                .contains_record(offset, LIST_NODE_SIZE),
            NodeKind::Repeat => self.store.repeat_nodes.contains_record(offset, REPEAT_NODE_SIZE),
            NodeKind::Delay => self.store.delay_nodes.contains_record(offset, DELAY_NODE_SIZE),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::BankFormat(format!(
                "{}: {:?} node offset {} outside its table",
                what, kind, offset
            )))
        }
    }

    fn validate_str(&self, at: usize, what: &str) -> Result<&[u8]> {
        let len = le_u32(&self.bytes, at) as usize;
        let offset = le_u32(&self.bytes, at + 4) as usize;
        check_range(&self.bytes, offset, len, what)?;
        let raw = &self.bytes[offset..offset + len];
        std::str::from_utf8(raw)
            .map_err(|_| Error::BankFormat(format!("{} is not valid UTF-8", what)))?;
        Ok(raw)
    }

    fn raw_desc(&self, at: usize) -> (u32, u32) {
        (le_u32(&self.bytes, at), le_u32(&self.bytes, at + 4))
    }

    fn raw_array(&self, at: usize) -> ArrayRef {
        ArrayRef {
            count: le_u32(&self.bytes, at),
            offset: le_u32(&self.bytes, at + 4),
        }
    }

    fn desc_at(&self, at: usize) -> NodeDesc {
        let (kind, offset) = self.raw_desc(at);
        NodeDesc {
            kind: NodeKind::from_u32(kind).unwrap_or(NodeKind::None),
            offset,
        }
    }

    fn str_at(&self, at: usize) -> &str {
        let len = le_u32(&self.bytes, at) as usize;
        let offset = le_u32(&self.bytes, at + 4) as usize;
        std::str::from_utf8(&self.bytes[offset..offset + len]).unwrap_or("")
    }

    // ------------------------------------------------------------------
    // Counts
    // ------------------------------------------------------------------

    pub fn file_count(&self) -> u32 {
        self.store.files.count
    }

    pub fn group_count(&self) -> u32 {
        self.store.groups.count
    }

    pub fn event_count(&self) -> u32 {
        self.store.events.count
    }

    pub fn bus_count(&self) -> u32 {
        self.store.buses.count
    }

    pub fn stream_source_count(&self) -> u32 {
        self.store.stream_sources.count
    }

    // ------------------------------------------------------------------
    // Records by index
    // ------------------------------------------------------------------

    pub fn file(&self, index: u32) -> Option<FileInfo> {
        let at = self.store.files.record_offset(index, FILE_INFO_SIZE)?;
        let f = |i: usize| le_u32(&self.bytes, at + i * 4);
        Some(FileInfo {
            coding_format: f(0),
            sample_rate: f(1),
            channels: f(2),
            flags: f(3),
            frame_count: f(4),
            loop_start: f(5),
            loop_end: f(6),
            source_index: f(7),
            data_offset: f(8),
            data_size: f(9),
        })
    }

    pub fn group(&self, index: u32) -> Option<Group> {
        let at = self.store.groups.record_offset(index, GROUP_SIZE)?;
        Some(Group {
            volume: le_f32(&self.bytes, at + 8),
            cross_fade_ms: le_u32(&self.bytes, at + 12),
            bus_index: le_u32(&self.bytes, at + 16),
            first_node: self.desc_at(at + 20),
        })
    }

    pub fn group_name(&self, index: u32) -> Option<&str> {
        let at = self.store.groups.record_offset(index, GROUP_SIZE)?;
        Some(self.str_at(at))
    }

    pub fn bus(&self, index: u32) -> Option<Bus> {
        let at = self.store.buses.record_offset(index, BUS_SIZE)?;
        Some(Bus {
            volume: le_f32(&self.bytes, at + 8),
        })
    }

    pub fn bus_name(&self, index: u32) -> Option<&str> {
        let at = self.store.buses.record_offset(index, BUS_SIZE)?;
        Some(self.str_at(at))
    }

    pub fn stream_source_path(&self, index: u32) -> Option<&str> {
        let at = self
            .store
            .stream_sources
            .record_offset(index, STREAM_SOURCE_SIZE)?;
        Some(self.str_at(at))
    }

    pub fn event_name(&self, index: u32) -> Option<&str> {
        let at = self.store.events.record_offset(index, EVENT_SIZE)?;
        Some(self.str_at(at))
    }

    /// Actions of the event at `index`
    pub fn event_actions(&self, index: u32) -> Vec<Action> {
        let Some(at) = self.store.events.record_offset(index, EVENT_SIZE) else {
            return Vec::new();
        };
        let actions = self.raw_array(at + 8);
        (0..actions.count as usize)
            .filter_map(|a| {
                let base = actions.offset as usize + a * ACTION_SIZE;
                Some(Action {
                    kind: ActionKind::from_u32(le_u32(&self.bytes, base))?,
                    target_index: le_u32(&self.bytes, base + 4),
                    fade_ms: le_u32(&self.bytes, base + 8),
                })
            })
            .collect()
    }

    /// Binary search the sorted event table by name
    pub fn find_event(&self, name: &str) -> Option<u32> {
        let needle = name.as_bytes();
        let (mut lo, mut hi) = (0u32, self.store.events.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let at = self.store.events.offset as usize + mid as usize * EVENT_SIZE;
            match self.str_at(at).as_bytes().cmp(needle) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Some(mid),
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Nodes by offset
    // ------------------------------------------------------------------

    pub fn file_node(&self, offset: u32) -> Option<FileNode> {
        if !self.store.file_nodes.contains_record(offset, FILE_NODE_SIZE) {
            return None;
        }
        let at = offset as usize;
        Some(FileNode {
            file_index: le_u32(&self.bytes, at),
            flags: le_u32(&self.bytes, at + 4),
            next: self.desc_at(at + 8),
            filter_offset: le_u32(&self.bytes, at + 16),
        })
    }

    /// Children of a random or sequence node
    pub fn list_children(&self, desc: NodeDesc) -> Option<NodeList<'_>> {
        let table = match desc.kind {
            NodeKind::Random => self.store.random_nodes,
            NodeKind::Sequence => self.store.sequence_nodes,
            _ => return None,
        };
        if !table.contains_record(desc.offset, LIST_NODE_SIZE) {
            return None;
        }
        let children = self.raw_array(desc.offset as usize);
        Some(NodeList {
            bank: self,
            offset: children.offset as usize,
            len: children.count,
        })
    }

    pub fn repeat_node(&self, offset: u32) -> Option<RepeatNode> {
        if !self.store.repeat_nodes.contains_record(offset, REPEAT_NODE_SIZE) {
            return None;
        }
        let at = offset as usize;
        Some(RepeatNode {
            repeat_count: le_u32(&self.bytes, at),
            child: self.desc_at(at + 4),
        })
    }

    pub fn delay_node(&self, offset: u32) -> Option<DelayNode> {
        if !self.store.delay_nodes.contains_record(offset, DELAY_NODE_SIZE) {
            return None;
        }
        let at = offset as usize;
        Some(DelayNode {
            time_ms: le_u32(&self.bytes, at),
            next: self.desc_at(at + 4),
        })
    }

    pub fn fade_filter(&self, offset: u32) -> Option<FadeFilterNode> {
        if !self.store.fade_filters.contains_record(offset, FADE_FILTER_SIZE) {
            return None;
        }
        let at = offset as usize;
        Some(FadeFilterNode {
            start_ms: le_u32(&self.bytes, at),
            end_ms: le_u32(&self.bytes, at + 4),
        })
    }
}

/// Borrowed list of child node descriptors
#[derive(Clone, Copy)]
pub struct NodeList<'a> {
    bank: &'a Bank,
    offset: usize,
    len: u32,
}

impl<'a> NodeList<'a> {
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: u32) -> Option<NodeDesc> {
        if index < self.len {
            Some(self.bank.desc_at(self.offset + index as usize * NODE_DESC_SIZE))
        } else {
            None
        }
    }
}

fn check_range(bytes: &[u8], offset: usize, len: usize, what: &str) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= bytes.len() => Ok(()),
        _ => Err(Error::BankFormat(format!(
            "{} out of range: offset {} + {} > {}",
            what,
            offset,
            len,
            bytes.len()
        ))),
    }
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn le_f32(bytes: &[u8], at: usize) -> f32 {
    f32::from_bits(le_u32(bytes, at))
}
