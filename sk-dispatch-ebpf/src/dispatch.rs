//! Socket selection: bindings trie lookup, then sockhash assignment.

use aya_ebpf::{
    bindings::{bpf_sock, sk_action},
    cty::c_void,
    helpers::{bpf_map_lookup_elem, bpf_sk_assign, bpf_sk_release},
    maps::lpm_trie::Key,
    programs::SkLookupContext,
};

use sk_dispatch_common::*;

use crate::{BINDINGS, DESTINATIONS};

pub fn dispatch(ctx: &SkLookupContext) -> u32 {
    let lookup = unsafe { &*ctx.lookup };

    let protocol = lookup.protocol as u8;
    if protocol != IPPROTO_TCP && protocol != IPPROTO_UDP {
        return sk_action::SK_PASS;
    }

    // Addresses in the context are network byte order; the port is host
    // byte order and the bindings key wants it big-endian.
    let addr: [u8; 16] = match lookup.family as u8 {
        AF_INET => {
            let ip = lookup.local_ip4.to_ne_bytes();
            let mut mapped = [0u8; 16];
            mapped[10] = 0xff;
            mapped[11] = 0xff;
            mapped[12..].copy_from_slice(&ip);
            mapped
        }
        AF_INET6 => {
            let mut v6 = [0u8; 16];
            for (i, word) in lookup.local_ip6.iter().enumerate() {
                v6[i * 4..(i + 1) * 4].copy_from_slice(&word.to_ne_bytes());
            }
            v6
        }
        _ => return sk_action::SK_PASS,
    };
    let port = (lookup.local_port as u16).to_be();

    // Specific port first, then the port 0 wildcard.
    let label_id = match binding_lookup(protocol, port, addr) {
        Some(id) => id,
        None => match binding_lookup(protocol, 0, addr) {
            Some(id) => id,
            None => return sk_action::SK_PASS,
        },
    };

    let dkey = DestinationKey {
        family: lookup.family as u8,
        protocol,
        _pad: [0; 2],
        label_id,
    };

    let sk = unsafe {
        bpf_map_lookup_elem(
            core::ptr::addr_of!(DESTINATIONS) as *mut c_void,
            &dkey as *const DestinationKey as *const c_void,
        )
    };
    if sk.is_null() {
        // Bound but nothing registered: the binding claims the traffic.
        return sk_action::SK_DROP;
    }
    let sk = sk as *mut bpf_sock;

    let assigned = unsafe { bpf_sk_assign(ctx.lookup as *mut c_void, sk, 0) };
    unsafe { bpf_sk_release(sk) };

    if assigned == 0 {
        sk_action::SK_PASS
    } else {
        sk_action::SK_DROP
    }
}

fn binding_lookup(protocol: u8, port: u16, addr: [u8; 16]) -> Option<u32> {
    let key = Key::new(
        BINDING_HEADER_BITS + 128,
        BindingKey {
            protocol,
            _pad: 0,
            port,
            addr,
        },
    );
    BINDINGS.get(&key).copied()
}
