//! # Helper-call prototypes
//!
//! Kernel helpers are called by numeric id; each id has a fixed
//! prototype describing how the five argument registers `r1..r5` are
//! interpreted. The decoder classifies call arguments against this table
//! so that later passes see [`crate::insn::ArgSingle`] /
//! [`crate::insn::ArgPair`] lists instead of raw ids.

use crate::insn::{ArgPair, ArgPairKind, ArgSingle, ArgSingleKind, Call, Reg};

/// Interpretation of one helper argument slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArgType {
    DontCare,
    Anything,
    ConstSize,
    ConstSizeOrZero,
    ConstMapPtr,
    PtrToCtx,
    PtrToMapKey,
    PtrToMapValue,
    PtrToMem,
    PtrToMemOrNull,
    PtrToUninitMem,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RetType {
    Integer,
    PtrToMapValueOrNull,
    Void,
}

#[derive(Clone, Debug)]
pub struct HelperProto {
    pub id: i32,
    pub name: &'static str,
    pub ret: RetType,
    pub args: [ArgType; 5],
}

use ArgType::*;
use RetType::*;

macro_rules! proto {
    ($id:expr, $name:expr, $ret:expr, [$($arg:expr),*]) => {{
        let mut args = [DontCare; 5];
        let given: &[ArgType] = &[$($arg),*];
        let mut i = 0;
        while i < given.len() {
            args[i] = given[i];
            i += 1;
        }
        HelperProto { id: $id, name: $name, ret: $ret, args }
    }};
}

/// The classic Linux helper ids.
static PROTOTYPES: &[HelperProto] = &[
    proto!(1, "bpf_map_lookup_elem", PtrToMapValueOrNull, [ConstMapPtr, PtrToMapKey]),
    proto!(2, "bpf_map_update_elem", Integer, [ConstMapPtr, PtrToMapKey, PtrToMapValue, Anything]),
    proto!(3, "bpf_map_delete_elem", Integer, [ConstMapPtr, PtrToMapKey]),
    proto!(4, "bpf_probe_read", Integer, [PtrToUninitMem, ConstSize, Anything]),
    proto!(5, "bpf_ktime_get_ns", Integer, []),
    proto!(6, "bpf_trace_printk", Integer, [PtrToMem, ConstSize, Anything, Anything, Anything]),
    proto!(7, "bpf_get_prandom_u32", Integer, []),
    proto!(8, "bpf_get_smp_processor_id", Integer, []),
    proto!(9, "bpf_skb_store_bytes", Integer, [PtrToCtx, Anything, PtrToMem, ConstSize, Anything]),
    proto!(10, "bpf_l3_csum_replace", Integer, [PtrToCtx, Anything, Anything, Anything, Anything]),
    proto!(11, "bpf_l4_csum_replace", Integer, [PtrToCtx, Anything, Anything, Anything, Anything]),
    proto!(12, "bpf_tail_call", Integer, [PtrToCtx, ConstMapPtr, Anything]),
    proto!(13, "bpf_clone_redirect", Integer, [PtrToCtx, Anything, Anything]),
    proto!(14, "bpf_get_current_pid_tgid", Integer, []),
    proto!(15, "bpf_get_current_uid_gid", Integer, []),
    proto!(16, "bpf_get_current_comm", Integer, [PtrToUninitMem, ConstSize]),
    proto!(17, "bpf_get_cgroup_classid", Integer, [PtrToCtx]),
    proto!(18, "bpf_skb_vlan_push", Integer, [PtrToCtx, Anything, Anything]),
    proto!(19, "bpf_skb_vlan_pop", Integer, [PtrToCtx]),
    proto!(20, "bpf_skb_get_tunnel_key", Integer, [PtrToCtx, PtrToUninitMem, ConstSize, Anything]),
    proto!(21, "bpf_skb_set_tunnel_key", Integer, [PtrToCtx, PtrToMem, ConstSize, Anything]),
    proto!(22, "bpf_perf_event_read", Integer, [ConstMapPtr, Anything]),
    proto!(23, "bpf_redirect", Integer, [Anything, Anything]),
    proto!(24, "bpf_get_route_realm", Integer, [PtrToCtx]),
    proto!(25, "bpf_perf_event_output", Integer, [PtrToCtx, ConstMapPtr, Anything, PtrToMem, ConstSize]),
    proto!(26, "bpf_skb_load_bytes", Integer, [PtrToCtx, Anything, PtrToUninitMem, ConstSize]),
    proto!(27, "bpf_get_stackid", Integer, [PtrToCtx, ConstMapPtr, Anything]),
    proto!(28, "bpf_csum_diff", Integer, [PtrToMemOrNull, ConstSizeOrZero, PtrToMemOrNull, ConstSizeOrZero, Anything]),
    proto!(35, "bpf_get_current_task", Integer, []),
    proto!(36, "bpf_probe_write_user", Integer, [Anything, PtrToMem, ConstSize]),
    proto!(43, "bpf_skb_change_proto", Integer, [PtrToCtx, Anything, Anything]),
    proto!(44, "bpf_skb_change_type", Integer, [PtrToCtx, Anything]),
    proto!(51, "bpf_xdp_adjust_head", Integer, [PtrToCtx, Anything]),
];

pub fn lookup(id: i32) -> Option<&'static HelperProto> {
    PROTOTYPES.iter().find(|p| p.id == id)
}

/// Classify the argument registers of a call against the helper's
/// prototype. Returns `None` for an unknown helper id or a prototype
/// that pairs a pointer with a missing size argument.
pub fn classify_call(id: i32) -> Option<Call> {
    let proto = lookup(id)?;

    let mut singles = Vec::new();
    let mut pairs = Vec::new();

    let mut i = 0;
    while i < proto.args.len() {
        let reg = Reg(i as u8 + 1);
        match proto.args[i] {
            DontCare => break,
            Anything | ConstSize | ConstSizeOrZero => singles.push(ArgSingle {
                kind: ArgSingleKind::Anything,
                reg,
            }),
            ConstMapPtr => singles.push(ArgSingle {
                kind: ArgSingleKind::MapFd,
                reg,
            }),
            PtrToCtx => singles.push(ArgSingle {
                kind: ArgSingleKind::PtrToCtx,
                reg,
            }),
            PtrToMapKey => singles.push(ArgSingle {
                kind: ArgSingleKind::PtrToMapKey,
                reg,
            }),
            PtrToMapValue => singles.push(ArgSingle {
                kind: ArgSingleKind::PtrToMapValue,
                reg,
            }),
            PtrToMem | PtrToMemOrNull | PtrToUninitMem => {
                let kind = match proto.args[i] {
                    PtrToMem => ArgPairKind::Mem,
                    PtrToMemOrNull => ArgPairKind::MemOrNull,
                    _ => ArgPairKind::UninitMem,
                };
                let size_slot = proto.args.get(i + 1)?;
                let can_be_zero = match size_slot {
                    ConstSize => false,
                    ConstSizeOrZero => true,
                    _ => return None,
                };
                pairs.push(ArgPair {
                    kind,
                    mem: reg,
                    size: Reg(i as u8 + 2),
                    can_be_zero,
                });
                i += 1;
            }
        }
        i += 1;
    }

    Some(Call {
        func: id,
        name: proto.name,
        singles,
        pairs,
        returns_map: proto.ret == PtrToMapValueOrNull,
    })
}
