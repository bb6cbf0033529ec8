//! sk_lookup program for socket dispatch.
//!
//! Attached to a network namespace's socket-lookup hook. For every
//! inbound TCP connection or UDP datagram the kernel asks this program to
//! pick a socket: we match (protocol, local address, local port) against
//! the bindings trie, then hand the packet to the socket registered under
//! the binding's label id.
//!
//! The control plane pins all three maps and keeps them authoritative;
//! this program only reads.

#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::{bpf_map_def, BPF_F_NO_PREALLOC},
    macros::{map, sk_lookup},
    maps::{HashMap, LpmTrie},
    programs::SkLookupContext,
};

use sk_dispatch_common::*;

mod dispatch;

// From the kernel's bpf.h.
const BPF_MAP_TYPE_SOCKHASH: u32 = 18;

// ---------------------------------------------------------------------------
// eBPF Maps
// ---------------------------------------------------------------------------

/// (protocol, prefix, port) -> label id. Written by the control plane.
#[map(name = "bindings")]
static BINDINGS: LpmTrie<BindingKey, u32> =
    LpmTrie::with_max_entries(MAX_BINDINGS, BPF_F_NO_PREALLOC);

/// (family, protocol, label id) -> socket.
///
/// Declared by hand instead of through `aya_ebpf::maps::SockHash`: the
/// value must be 8 bytes so the kernel answers userspace lookups with the
/// stored socket's cookie, and the SockHash wrapper fixes the value at 4.
#[link_section = "maps"]
#[export_name = "destinations"]
static DESTINATIONS: bpf_map_def = bpf_map_def {
    type_: BPF_MAP_TYPE_SOCKHASH,
    key_size: core::mem::size_of::<DestinationKey>() as u32,
    value_size: 8,
    max_entries: MAX_DESTINATIONS,
    map_flags: 0,
    id: 0,
    pinning: 0,
};

/// Label allocator state. The data plane never reads this; it lives here
/// so allocator state persists in the kernel alongside the maps whose ids
/// it guards.
#[map(name = "labels")]
static LABELS: HashMap<u32, LabelValue> = HashMap::with_max_entries(MAX_LABELS, 0);

// ---------------------------------------------------------------------------
// sk_lookup Entry Point
// ---------------------------------------------------------------------------

/// Returns SK_PASS with a socket assigned, or without one to fall back to
/// the regular lookup. Traffic matching a binding with no registered
/// destination is dropped.
#[sk_lookup]
pub fn sk_dispatch(ctx: SkLookupContext) -> u32 {
    dispatch::dispatch(&ctx)
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
