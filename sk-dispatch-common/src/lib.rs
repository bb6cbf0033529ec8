//! Shared types between the skdispatch control plane and the sk_lookup
//! eBPF program.
//!
//! This crate is `no_std` compatible so it can be used in eBPF programs.
//! All map key/value types are `repr(C)` with explicit padding: the byte
//! layout is part of the kernel ABI and must match on both sides.

#![no_std]

/// Number of usable label ids. Id 0 is reserved as the "absent" sentinel,
/// so valid ids are 1..=MAX_LABEL_ID.
pub const MAX_LABEL_ID: u32 = 65535;

/// Capacity of the labels map (one slot per usable id plus the sentinel).
pub const MAX_LABELS: u32 = MAX_LABEL_ID + 1;

/// Capacity of the bindings LPM trie.
pub const MAX_BINDINGS: u32 = 4096;

/// Capacity of the destinations sockhash.
pub const MAX_DESTINATIONS: u32 = 512;

/// Fixed storage for a label name, NUL padded. Names are at most
/// `MAX_LABEL_LEN` bytes so the array always holds a terminator.
pub const LABEL_NAME_SIZE: usize = 64;

/// Maximum length of a label name in bytes.
pub const MAX_LABEL_LEN: usize = LABEL_NAME_SIZE - 1;

/// Bits of the binding key that precede the address: protocol, padding and
/// port. The LPM prefix length always covers these in full.
pub const BINDING_HEADER_BITS: u32 = 32;

/// Prefix length offset for IPv4 prefixes stored in IPv4-mapped form.
pub const IPV4_PREFIX_OFFSET: u32 = 96;

// Address families and L4 protocols as the kernel numbers them.
pub const AF_INET: u8 = 2;
pub const AF_INET6: u8 = 10;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

// ---------------------------------------------------------------------------
// eBPF Map Key/Value Types
// ---------------------------------------------------------------------------

/// Data part of the bindings LPM key. The kernel prepends a `u32` prefix
/// length (see `aya::maps::lpm_trie::Key`), giving the full wire layout:
/// `prefix_len: u32, protocol: u8, _pad: u8, port: u16be, addr: [u8; 16]`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingKey {
    /// IPPROTO_TCP or IPPROTO_UDP.
    pub protocol: u8,
    pub _pad: u8,
    /// Destination port in network byte order. 0 matches any port.
    pub port: u16,
    /// Destination address. IPv4 is stored IPv4-mapped (::ffff:a.b.c.d).
    pub addr: [u8; 16],
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for BindingKey {}

/// Key of the destinations sockhash.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DestinationKey {
    /// AF_INET or AF_INET6.
    pub family: u8,
    /// IPPROTO_TCP or IPPROTO_UDP.
    pub protocol: u8,
    pub _pad: [u8; 2],
    /// Id assigned by the label allocator. Never 0.
    pub label_id: u32,
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for DestinationKey {}

/// Value of the labels map: the name owning the id and how many bindings
/// and destinations currently reference it. The data plane never reads
/// this map; it lives in the kernel only so allocator state survives
/// process exits alongside the maps it guards.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct LabelValue {
    /// NUL-padded label name.
    pub name: [u8; LABEL_NAME_SIZE],
    /// Reference count. Wide enough to exceed the binding table capacity.
    pub count: u32,
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for LabelValue {}

// Layout checks. These sizes are kernel ABI; a padding or field-order
// mistake must fail the build, not corrupt a map.
const _: () = assert!(core::mem::size_of::<BindingKey>() == 20);
const _: () = assert!(core::mem::size_of::<DestinationKey>() == 8);
const _: () = assert!(core::mem::size_of::<LabelValue>() == 68);

// ---------------------------------------------------------------------------
// eBPF Map Names (must match between eBPF program and userspace loader)
// ---------------------------------------------------------------------------

/// Map name: LpmTrie<BindingKey, u32>, (protocol, prefix, port) to label id.
pub const MAP_BINDINGS: &str = "bindings";

/// Map name: sockhash keyed by DestinationKey, label id to socket.
pub const MAP_DESTINATIONS: &str = "destinations";

/// Map name: HashMap<u32, LabelValue>, persistent label allocator state.
pub const MAP_LABELS: &str = "labels";

/// Pin name of the sk_lookup link inside the state directory.
pub const LINK_NAME: &str = "link";

/// Name of the sk_lookup program in the eBPF object.
pub const PROG_DISPATCH: &str = "sk_dispatch";
