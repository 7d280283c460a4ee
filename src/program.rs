//! # Program types, context layouts, and map descriptors
//!
//! A [`ProgramInfo`] fixes, for the duration of one verification, the
//! program type (which determines the layout of the context region) and
//! the shapes of the maps available to the program.

use std::fmt;

/// The declared type of an eBPF program.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BpfProgType {
    Unspec,
    SocketFilter,
    Kprobe,
    SchedCls,
    SchedAct,
    Tracepoint,
    Xdp,
    PerfEvent,
    CgroupSkb,
    CgroupSock,
    LwtIn,
    LwtOut,
    LwtXmit,
    SockOps,
    SkSkb,
    CgroupDevice,
    SkMsg,
    RawTracepoint,
    CgroupSockAddr,
    LwtSeg6local,
    LircMode2,
}

impl BpfProgType {
    pub fn from_index(n: u32) -> Option<Self> {
        use BpfProgType::*;
        Some(match n {
            0 => Unspec,
            1 => SocketFilter,
            2 => Kprobe,
            3 => SchedCls,
            4 => SchedAct,
            5 => Tracepoint,
            6 => Xdp,
            7 => PerfEvent,
            8 => CgroupSkb,
            9 => CgroupSock,
            10 => LwtIn,
            11 => LwtOut,
            12 => LwtXmit,
            13 => SockOps,
            14 => SkSkb,
            15 => CgroupDevice,
            16 => SkMsg,
            17 => RawTracepoint,
            18 => CgroupSockAddr,
            19 => LwtSeg6local,
            20 => LircMode2,
            _ => return None,
        })
    }

    /// Privileged program types skip the pointer-leakage assertions.
    pub fn is_privileged(self) -> bool {
        self == BpfProgType::Kprobe
    }
}

impl fmt::Display for BpfProgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Byte layout of the context region. Offsets are `-1` when the slot is
/// not present for the program type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ContextDescriptor {
    pub size: i32,
    pub data: i32,
    pub end: i32,
    pub meta: i32,
}

impl ContextDescriptor {
    const fn sized(size: i32) -> Self {
        Self {
            size,
            data: -1,
            end: -1,
            meta: -1,
        }
    }
}

// Rough estimates of the kernel context struct sizes.
const PERF_MAX_TRACE_SIZE: i32 = 2048;
const PTREGS_SIZE: i32 = (3 + 63 + 8 + 2) * 8;

const SK_BUFF: ContextDescriptor = ContextDescriptor {
    size: 36 * 4,
    data: 19 * 4,
    end: 20 * 4,
    meta: 35 * 4,
};

const XDP_MD: ContextDescriptor = ContextDescriptor {
    size: 5 * 4,
    data: 0,
    end: 4,
    meta: 8,
};

const SK_MSG_MD: ContextDescriptor = ContextDescriptor {
    size: 17 * 4,
    data: 0,
    end: 8,
    meta: -1,
};

/// Context layout for a program type.
pub fn context_descriptor(t: BpfProgType) -> ContextDescriptor {
    use BpfProgType::*;
    match t {
        Unspec => ContextDescriptor::sized(0),
        CgroupDevice => ContextDescriptor::sized(3 * 4),
        CgroupSock | CgroupSockAddr => ContextDescriptor::sized(12 * 4),
        Kprobe | PerfEvent => ContextDescriptor::sized(3 * 8 + PTREGS_SIZE),
        Tracepoint | RawTracepoint => ContextDescriptor::sized(PERF_MAX_TRACE_SIZE),
        SocketFilter | CgroupSkb | SchedCls | SchedAct | LwtIn | LwtOut | LwtXmit
        | LwtSeg6local | SkSkb => SK_BUFF,
        Xdp => XDP_MD,
        SockOps => ContextDescriptor::sized(42 * 4 + 2 * 8),
        SkMsg | LircMode2 => SK_MSG_MD,
    }
}

/// Map container kinds, in kernel numbering order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MapType {
    Unspec,
    Hash,
    Array,
    ProgArray,
    PerfEventArray,
    PercpuHash,
    PercpuArray,
    StackTrace,
    CgroupArray,
    LruHash,
    LruPercpuHash,
    LpmTrie,
    ArrayOfMaps,
    HashOfMaps,
}

/// Shape of one map available to the program. Only the shape is modeled;
/// map contents are outside the analysis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapDescriptor {
    pub map_type: MapType,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub inner_idx: Option<usize>,
}

impl MapDescriptor {
    /// An array map holding values of `value_size` bytes, as declared by
    /// the `map<N>` command-line arguments.
    pub fn array_of(value_size: u32) -> Self {
        Self {
            map_type: MapType::Array,
            key_size: 4,
            value_size,
            max_entries: 1,
            inner_idx: None,
        }
    }
}

/// Immutable per-verification input: program type, context layout, and
/// the table of map shapes. Threaded through the transfer functions as a
/// shared handle.
#[derive(Clone, Debug)]
pub struct ProgramInfo {
    pub prog_type: BpfProgType,
    pub ctx: ContextDescriptor,
    pub maps: Vec<MapDescriptor>,
}

impl ProgramInfo {
    pub fn new(prog_type: BpfProgType, maps: Vec<MapDescriptor>) -> Self {
        Self {
            prog_type,
            ctx: context_descriptor(prog_type),
            maps,
        }
    }
}

/// A program as handed over by the loader: raw bytes plus the map-fd
/// relocations recorded as `(pc, map index)` pairs.
#[derive(Clone, Debug)]
pub struct RawProgram {
    pub filename: String,
    pub section: String,
    pub bytes: Vec<u8>,
    pub relocations: Vec<(crate::insn::Pc, usize)>,
    pub info: ProgramInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_types_expose_data_slots() {
        let d = context_descriptor(BpfProgType::Xdp);
        assert!(d.data >= 0 && d.end > d.data && d.meta >= 0);

        let d = context_descriptor(BpfProgType::SocketFilter);
        assert_eq!((d.data, d.end), (76, 80));
    }

    #[test]
    fn tracing_types_have_no_packet() {
        let d = context_descriptor(BpfProgType::Kprobe);
        assert_eq!((d.data, d.end, d.meta), (-1, -1, -1));
    }
}
