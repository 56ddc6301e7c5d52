//! Bank binary layout: constants, tags and decoded record types
//!
//! All integers are little-endian `u32` (volumes are `f32`), and every
//! internal reference is a byte offset from the start of the bank buffer.

/// Bank layout version understood by this runtime
pub const BANK_VERSION: u32 = 3;

/// `{version, store_offset}`
pub const HEADER_SIZE: usize = 8;
/// `{count, offset}`
pub const ARRAY_REF_SIZE: usize = 8;
/// Eleven typed arrays
pub const STORE_SIZE: usize = 11 * ARRAY_REF_SIZE;

pub const NODE_DESC_SIZE: usize = 8;
pub const FILE_INFO_SIZE: usize = 40;
pub const FILE_NODE_SIZE: usize = 20;
pub const LIST_NODE_SIZE: usize = 8;
pub const REPEAT_NODE_SIZE: usize = 12;
pub const DELAY_NODE_SIZE: usize = 12;
pub const FADE_FILTER_SIZE: usize = 8;
pub const GROUP_SIZE: usize = 28;
pub const EVENT_SIZE: usize = 16;
pub const ACTION_SIZE: usize = 12;
pub const BUS_SIZE: usize = 12;
pub const STREAM_SOURCE_SIZE: usize = 8;

/// `FileInfo.flags`: data is streamed from disk rather than held resident
pub const FILE_FLAG_STREAM: u32 = 1;
/// `FileNode.flags`: sound loops until a break-loop action
pub const FILE_NODE_FLAG_LOOP: u32 = 1;

/// Node type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    None = 0,
    File = 1,
    Random = 2,
    Sequence = 3,
    Repeat = 4,
    Delay = 5,
}

impl NodeKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(NodeKind::None),
            1 => Some(NodeKind::File),
            2 => Some(NodeKind::Random),
            3 => Some(NodeKind::Sequence),
            4 => Some(NodeKind::Repeat),
            5 => Some(NodeKind::Delay),
            _ => None,
        }
    }
}

/// Typed reference to a node record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeDesc {
    pub kind: NodeKind,
    pub offset: u32,
}

impl NodeDesc {
    pub const NONE: NodeDesc = NodeDesc {
        kind: NodeKind::None,
        offset: 0,
    };

    pub fn new(kind: NodeKind, offset: u32) -> Self {
        Self { kind, offset }
    }

    pub fn is_none(&self) -> bool {
        self.kind == NodeKind::None
    }

    /// `None` for the empty descriptor, `Some(self)` otherwise
    pub fn some(self) -> Option<NodeDesc> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }
}

/// How a file's audio bytes are encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodingFormat {
    /// Interleaved signed 16-bit little-endian PCM
    PcmS16 = 1,
    /// Interleaved 32-bit float little-endian PCM
    PcmF32 = 2,
    /// MPEG-1/2 Layer III
    Mp3 = 3,
}

impl CodingFormat {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(CodingFormat::PcmS16),
            2 => Some(CodingFormat::PcmF32),
            3 => Some(CodingFormat::Mp3),
            _ => None,
        }
    }

    /// Bytes per sample for PCM formats
    pub fn bytes_per_sample(&self) -> Option<usize> {
        match self {
            CodingFormat::PcmS16 => Some(2),
            CodingFormat::PcmF32 => Some(4),
            CodingFormat::Mp3 => None,
        }
    }
}

/// Action type carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    None = 0,
    Play = 1,
    PlaySingle = 2,
    Stop = 3,
    BreakLoop = 4,
    Pause = 5,
    Resume = 6,
    PauseBus = 7,
    ResumeBus = 8,
    StopBus = 9,
    StopAll = 10,
}

impl ActionKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(ActionKind::None),
            1 => Some(ActionKind::Play),
            2 => Some(ActionKind::PlaySingle),
            3 => Some(ActionKind::Stop),
            4 => Some(ActionKind::BreakLoop),
            5 => Some(ActionKind::Pause),
            6 => Some(ActionKind::Resume),
            7 => Some(ActionKind::PauseBus),
            8 => Some(ActionKind::ResumeBus),
            9 => Some(ActionKind::StopBus),
            10 => Some(ActionKind::StopAll),
            _ => None,
        }
    }

    /// Target index refers to a group
    pub fn targets_group(&self) -> bool {
        matches!(
            self,
            ActionKind::Play
                | ActionKind::PlaySingle
                | ActionKind::Stop
                | ActionKind::BreakLoop
                | ActionKind::Pause
                | ActionKind::Resume
        )
    }

    /// Target index refers to a bus
    pub fn targets_bus(&self) -> bool {
        matches!(
            self,
            ActionKind::PauseBus | ActionKind::ResumeBus | ActionKind::StopBus
        )
    }
}

/// Per-file metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    /// Raw coding format tag; unknown tags load fine but fail sound creation
    pub coding_format: u32,
    pub sample_rate: u32,
    pub channels: u32,
    pub flags: u32,
    /// Length in source frames
    pub frame_count: u32,
    pub loop_start: u32,
    /// 0 = loop at end of data
    pub loop_end: u32,
    pub source_index: u32,
    pub data_offset: u32,
    pub data_size: u32,
}

impl FileInfo {
    pub fn format(&self) -> Option<CodingFormat> {
        CodingFormat::from_u32(self.coding_format)
    }

    pub fn is_streamed(&self) -> bool {
        self.flags & FILE_FLAG_STREAM != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileNode {
    pub file_index: u32,
    pub flags: u32,
    pub next: NodeDesc,
    /// Offset of a fade filter record, 0 when absent
    pub filter_offset: u32,
}

impl FileNode {
    pub fn is_looping(&self) -> bool {
        self.flags & FILE_NODE_FLAG_LOOP != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatNode {
    /// 0 repeats forever
    pub repeat_count: u32,
    pub child: NodeDesc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayNode {
    pub time_ms: u32,
    pub next: NodeDesc,
}

/// Fade envelope attached to a file node
///
/// `start_ms` is the fade-in length from the start of the file, `end_ms`
/// the fade-out length ending at the end of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FadeFilterNode {
    pub start_ms: u32,
    pub end_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Group {
    pub volume: f32,
    pub cross_fade_ms: u32,
    pub bus_index: u32,
    pub first_node: NodeDesc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionKind,
    pub target_index: u32,
    pub fade_ms: u32,
}

impl Action {
    pub fn new(kind: ActionKind, target_index: u32, fade_ms: u32) -> Self {
        Self {
            kind,
            target_index,
            fade_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bus {
    pub volume: f32,
}
