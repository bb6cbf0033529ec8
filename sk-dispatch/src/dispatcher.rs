//! Dispatcher façade.
//!
//! Owns the per-namespace state: the locked state directory, the pinned
//! kernel maps, the label allocator and the sk_lookup attachment. Mutating
//! operations follow acquire-then-mutate with a compensating release on
//! error, so kernel entries never reference unallocated ids.

use std::collections::HashSet;
use std::os::fd::BorrowedFd;
use std::path::Path;

use aya::maps::lpm_trie::{Key, LpmTrie};
use aya::maps::{HashMap as BpfHashMap, Map, MapData, MapError};
use aya::programs::links::{FdLink, PinnedLink};
use aya::programs::SkLookup;
use aya::Ebpf;
use tracing::debug;

use sk_dispatch_common::{
    BindingKey, LINK_NAME, MAP_BINDINGS, MAP_DESTINATIONS, MAP_LABELS, PROG_DISPATCH,
};

use crate::binding::Binding;
use crate::destination::{
    destination_key, inspect_socket, validate_socket, Destinations, Family, Registration,
    SocketCookie,
};
use crate::errors::{DispatchError, Result};
use crate::labels::{LabelId, Labels};
use crate::netns::NetNs;
use crate::state::{RemoveOnError, StateDir};

// Map update flag: fail with EEXIST instead of overwriting. Exact-match
// insertion is how we detect an already-bound key, since a plain LPM
// lookup answers with the longest matching prefix, not the exact entry.
const BPF_NOEXIST: u64 = 1;

/// A registered destination joined against the label allocator.
#[derive(Debug, Clone)]
pub struct DestinationEntry {
    pub family: Family,
    pub protocol: crate::binding::Protocol,
    pub label: String,
    pub cookie: SocketCookie,
}

pub struct Dispatcher {
    // Field order is drop order: link first, directory lock last.
    _link: PinnedLink,
    labels: Labels,
    bindings: LpmTrie<MapData, BindingKey, u32>,
    destinations: Destinations,
    _netns: NetNs,
    state: StateDir,
}

impl Dispatcher {
    /// Load the dispatcher into a network namespace.
    ///
    /// `program` is the compiled sk_lookup eBPF object. Fails with
    /// `AlreadyLoaded` if the namespace already has a state directory;
    /// any later failure removes the freshly claimed directory again.
    pub fn create(netns_path: &Path, bpffs_root: &Path, program: &[u8]) -> Result<Dispatcher> {
        let netns = NetNs::open(netns_path)?;
        let path = netns.state_path(bpffs_root);

        let state = StateDir::create(&path)?;
        let mut cleanup = RemoveOnError::new(&path);

        let dispatcher = Self::create_locked(netns, state, program)?;
        cleanup.disarm();

        debug!(path = %path.display(), "created dispatcher state");
        Ok(dispatcher)
    }

    fn create_locked(netns: NetNs, state: StateDir, program: &[u8]) -> Result<Dispatcher> {
        let mut bpf = Ebpf::load(program)?;

        for name in [MAP_LABELS, MAP_BINDINGS, MAP_DESTINATIONS] {
            bpf.map_mut(name)
                .ok_or_else(|| {
                    DispatchError::Corrupt(format!("program object has no map {name:?}"))
                })?
                .pin(state.join(name))?;
        }

        let prog: &mut SkLookup = bpf
            .program_mut(PROG_DISPATCH)
            .ok_or_else(|| {
                DispatchError::Corrupt(format!(
                    "program object has no program {PROG_DISPATCH:?}"
                ))
            })?
            .try_into()?;
        prog.load()?;

        let link_id = prog.attach(netns.as_fd())?;
        let link = prog.take_link(link_id)?;
        let fd_link: FdLink = link.try_into().unwrap();
        let pinned = fd_link.pin(state.join(LINK_NAME))?;

        let labels = Labels::from_map(take_typed(&mut bpf, MAP_LABELS)?)?;
        let bindings = take_typed(&mut bpf, MAP_BINDINGS)?;
        let destinations = Destinations::new(take_sock_map(&mut bpf)?);

        Ok(Dispatcher {
            _link: pinned,
            labels,
            bindings,
            destinations,
            _netns: netns,
            state,
        })
    }

    /// Open an existing dispatcher from its pinned state.
    ///
    /// Fails with `NotLoaded` if the namespace has no state directory and
    /// `Busy` if another process holds the lock.
    pub fn open(netns_path: &Path, bpffs_root: &Path) -> Result<Dispatcher> {
        let netns = NetNs::open(netns_path)?;
        let path = netns.state_path(bpffs_root);
        let state = StateDir::open(&path)?;

        let labels = Labels::from_map(open_typed(&state, MAP_LABELS)?)?;
        let bindings = open_typed(&state, MAP_BINDINGS)?;
        let destinations = Destinations::new(match open_pinned(&state, MAP_DESTINATIONS)? {
            Map::SockHash(data) => data,
            _ => {
                return Err(DispatchError::Corrupt(format!(
                    "pinned map {MAP_DESTINATIONS:?} has the wrong type"
                )))
            }
        });

        let link = PinnedLink::from_pin(state.join(LINK_NAME))?;

        debug!(path = %path.display(), "opened dispatcher state");
        Ok(Dispatcher {
            _link: link,
            labels,
            bindings,
            destinations,
            _netns: netns,
            state,
        })
    }

    /// Release all resources without removing the dispatcher. Dropping the
    /// value does the same; this spelling just reads better at call sites.
    pub fn close(self) {}

    /// Remove the dispatcher from the namespace: unpin everything by
    /// deleting the state directory, then close. A subsequent `open`
    /// returns `NotLoaded`.
    pub fn unload(self) -> Result<()> {
        self.state.remove()?;
        Ok(())
    }

    pub fn state_path(&self) -> &Path {
        self.state.path()
    }

    // -----------------------------------------------------------------------
    // Bindings
    // -----------------------------------------------------------------------

    /// Redirect traffic for (protocol, prefix, port) to a label.
    ///
    /// Traffic for the binding is dropped by the data plane until a
    /// destination is registered under the label. Fails with
    /// `AlreadyBound` if the exact key is already in use.
    pub fn add_binding(&mut self, binding: &Binding) -> Result<()> {
        let id = self.labels.acquire(&binding.label)?;

        let result = self.insert_binding(binding, id);
        if result.is_err() {
            // Compensate the speculative acquire.
            let _ = self.labels.release(&binding.label);
        }
        result
    }

    fn insert_binding(&mut self, binding: &Binding, id: LabelId) -> Result<()> {
        let key = binding.lpm_key();
        match self.bindings.insert(&key, id.get(), BPF_NOEXIST) {
            Ok(()) => Ok(()),
            Err(MapError::SyscallError(err))
                if err.io_error.kind() == std::io::ErrorKind::AlreadyExists =>
            {
                let owner = self
                    .lookup_exact(&key)?
                    .and_then(|id| self.labels.name_for(id).map(str::to_string))
                    .unwrap_or_else(|| binding.label.clone());
                Err(DispatchError::AlreadyBound(owner))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stop redirecting traffic for (protocol, prefix, port).
    pub fn remove_binding(&mut self, binding: &Binding) -> Result<()> {
        let key = binding.lpm_key();

        let id = self.lookup_exact(&key)?.ok_or(DispatchError::NotFound)?;
        if !self.labels.has_id(&binding.label, LabelId(id)) {
            return Err(DispatchError::LabelMismatch(binding.label.clone()));
        }

        // Delete before releasing: a failed release leaves an unused
        // label, but a released id must never still be reachable from the
        // kernel.
        self.bindings.remove(&key)?;
        self.labels.release(&binding.label)?;
        Ok(())
    }

    /// List known bindings, sorted for stable display and diffing.
    pub fn bindings(&self) -> Result<Vec<Binding>> {
        let labels = self.labels.list();

        let mut bindings = Vec::new();
        for entry in self.bindings.iter() {
            let (key, id) = entry?;
            let label = labels.get(&LabelId(id)).ok_or_else(|| {
                DispatchError::Corrupt(format!("binding references unallocated id {id}"))
            })?;
            bindings.push(Binding::from_lpm_key(label, &key)?);
        }

        bindings.sort();
        Ok(bindings)
    }

    /// Converge the binding table onto `desired`.
    ///
    /// Removals are applied before additions so a binding moving between
    /// labels never trips the exact-key conflict check. Not atomic: an
    /// error leaves the mutations applied so far in place, and re-running
    /// with the same set finishes the job.
    pub fn replace_bindings(&mut self, desired: &[Binding]) -> Result<(Vec<Binding>, Vec<Binding>)> {
        let current = self.bindings()?;
        let (removed, added) = diff_bindings(&current, desired);

        for binding in &removed {
            self.remove_binding(binding)?;
        }
        for binding in &added {
            self.add_binding(binding)?;
        }

        Ok((added, removed))
    }

    /// Exact-match lookup of a binding key. The kernel's own LPM lookup
    /// answers with the longest matching prefix, which is the wrong
    /// question here.
    fn lookup_exact(&self, key: &Key<BindingKey>) -> Result<Option<u32>> {
        let want_len = key.prefix_len();
        let want_data = key.data();
        for entry in self.bindings.iter() {
            let (have, id) = entry?;
            let have_len = have.prefix_len();
            let have_data = have.data();
            if have_len == want_len && have_data == want_data {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Destinations
    // -----------------------------------------------------------------------

    /// Register a server socket under a label.
    ///
    /// The socket must be a listening TCP socket or an unconnected UDP
    /// socket; anything else fails `Unsupported`. Re-registration under
    /// the same (family, protocol, label) replaces the previous socket.
    /// The returned value describes the outcome so the caller can log it.
    pub fn register_socket(&mut self, label: &str, sock: BorrowedFd<'_>) -> Result<Registration> {
        let info = inspect_socket(sock)?;
        let (family, protocol) = validate_socket(&info)?;

        let id = self.labels.acquire(label)?;
        let key = destination_key(family, protocol, id);

        // Compensate the acquire if either map operation fails. On
        // success the reference stays, even when this replaced an
        // earlier registration: the destination entry now holds it.
        let previous = match self.destinations.cookie(&key) {
            Ok(previous) => previous,
            Err(e) => {
                let _ = self.labels.release(label);
                return Err(e);
            }
        };
        if let Err(e) = self.destinations.assign(&key, sock) {
            let _ = self.labels.release(label);
            return Err(e);
        }

        Ok(Registration {
            label: label.to_string(),
            family,
            protocol,
            cookie: info.cookie,
            previous,
        })
    }

    /// List registered destinations joined against the label allocator.
    pub fn destinations(&self) -> Result<Vec<DestinationEntry>> {
        let mut entries = Vec::new();
        for (key, cookie) in self.destinations.entries()? {
            let family = Family::from_number(key.family).ok_or_else(|| {
                DispatchError::Corrupt(format!("destination has family {}", key.family))
            })?;
            let protocol = crate::binding::Protocol::from_number(key.protocol).ok_or_else(
                || DispatchError::Corrupt(format!("destination has protocol {}", key.protocol)),
            )?;
            let label = self
                .labels
                .name_for(key.label_id)
                .ok_or_else(|| {
                    DispatchError::Corrupt(format!(
                        "destination references unallocated id {}",
                        key.label_id
                    ))
                })?
                .to_string();

            entries.push(DestinationEntry {
                family,
                protocol,
                label,
                cookie,
            });
        }

        entries.sort_by(|a, b| {
            (&a.label, a.protocol.number(), a.family.number()).cmp(&(
                &b.label,
                b.protocol.number(),
                b.family.number(),
            ))
        });
        Ok(entries)
    }
}

/// Removals and additions needed to turn `current` into `desired`, both
/// sorted for deterministic application order.
fn diff_bindings(current: &[Binding], desired: &[Binding]) -> (Vec<Binding>, Vec<Binding>) {
    let have: HashSet<&Binding> = current.iter().collect();
    let want: HashSet<&Binding> = desired.iter().collect();

    let mut removed: Vec<Binding> = current
        .iter()
        .filter(|b| !want.contains(*b))
        .cloned()
        .collect();
    let mut added: Vec<Binding> = desired
        .iter()
        .filter(|b| !have.contains(*b))
        .cloned()
        .collect();

    removed.sort();
    added.sort();
    removed.dedup();
    added.dedup();
    (removed, added)
}

fn take_typed<T>(bpf: &mut Ebpf, name: &str) -> Result<T>
where
    T: TryFrom<Map, Error = MapError>,
{
    let map = bpf.take_map(name).ok_or_else(|| {
        DispatchError::Corrupt(format!("program object has no map {name:?}"))
    })?;
    Ok(T::try_from(map)?)
}

fn take_sock_map(bpf: &mut Ebpf) -> Result<MapData> {
    match bpf.take_map(MAP_DESTINATIONS) {
        Some(Map::SockHash(data)) => Ok(data),
        Some(_) => Err(DispatchError::Corrupt(format!(
            "map {MAP_DESTINATIONS:?} has the wrong type"
        ))),
        None => Err(DispatchError::Corrupt(format!(
            "program object has no map {MAP_DESTINATIONS:?}"
        ))),
    }
}

/// Reopen a pinned map from the state directory. A missing pin under an
/// existing state directory is corruption, not "not loaded".
fn open_pinned(state: &StateDir, name: &str) -> Result<Map> {
    let pin = state.join(name);
    let data = MapData::from_pin(&pin).map_err(|e| match e {
        MapError::SyscallError(ref err)
            if err.io_error.kind() == std::io::ErrorKind::NotFound =>
        {
            DispatchError::Corrupt(format!("pinned map {name:?} is missing"))
        }
        e => DispatchError::Map(e),
    })?;
    Ok(wrap_map_data(data)?)
}

/// Wrap a reopened [`MapData`] in the [`Map`] variant matching its kernel
/// map type, mirroring what `Ebpf::load` does for maps discovered at load
/// time. Needed because a pinned map is reopened outside of an `Ebpf`
/// instance, so there is no loader to do this for us.
fn wrap_map_data(data: MapData) -> Result<Map, MapError> {
    use aya::maps::MapType;

    let map_type = data.info()?.map_type()?;
    Ok(match map_type {
        MapType::Array => Map::Array(data),
        MapType::PerCpuArray => Map::PerCpuArray(data),
        MapType::ProgramArray => Map::ProgramArray(data),
        MapType::Hash => Map::HashMap(data),
        MapType::LruHash => Map::LruHashMap(data),
        MapType::PerCpuHash => Map::PerCpuHashMap(data),
        MapType::LruPerCpuHash => Map::PerCpuLruHashMap(data),
        MapType::PerfEventArray => Map::PerfEventArray(data),
        MapType::RingBuf => Map::RingBuf(data),
        MapType::SockHash => Map::SockHash(data),
        MapType::SockMap => Map::SockMap(data),
        MapType::BloomFilter => Map::BloomFilter(data),
        MapType::LpmTrie => Map::LpmTrie(data),
        MapType::Stack => Map::Stack(data),
        MapType::StackTrace => Map::StackTraceMap(data),
        MapType::Queue => Map::Queue(data),
        MapType::CpuMap => Map::CpuMap(data),
        MapType::DevMap => Map::DevMap(data),
        MapType::DevMapHash => Map::DevMapHash(data),
        MapType::XskMap => Map::XskMap(data),
        _ => Map::Unsupported(data),
    })
}

fn open_typed<T>(state: &StateDir, name: &str) -> Result<T>
where
    T: TryFrom<Map, Error = MapError>,
{
    Ok(T::try_from(open_pinned(state, name)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::Protocol;

    fn binding(label: &str, protocol: Protocol, prefix: &str, port: u16) -> Binding {
        Binding::new(label, protocol, prefix.parse().unwrap(), port)
    }

    #[test]
    fn diff_is_empty_for_identical_sets() {
        let set = vec![
            binding("web", Protocol::Tcp, "192.0.2.0/24", 80),
            binding("web", Protocol::Udp, "192.0.2.0/24", 80),
        ];
        let (removed, added) = diff_bindings(&set, &set.clone());
        assert!(removed.is_empty());
        assert!(added.is_empty());
    }

    #[test]
    fn diff_splits_removals_and_additions() {
        let current = vec![
            binding("web", Protocol::Tcp, "192.0.2.0/24", 80),
            binding("old", Protocol::Tcp, "10.0.0.0/8", 0),
        ];
        let desired = vec![
            binding("web", Protocol::Tcp, "192.0.2.0/24", 80),
            binding("new", Protocol::Udp, "10.0.0.0/8", 0),
        ];

        let (removed, added) = diff_bindings(&current, &desired);
        assert_eq!(removed, vec![binding("old", Protocol::Tcp, "10.0.0.0/8", 0)]);
        assert_eq!(added, vec![binding("new", Protocol::Udp, "10.0.0.0/8", 0)]);
    }

    #[test]
    fn diff_treats_label_change_as_remove_plus_add() {
        let current = vec![binding("a", Protocol::Tcp, "10.0.0.0/8", 0)];
        let desired = vec![binding("b", Protocol::Tcp, "10.0.0.0/8", 0)];

        let (removed, added) = diff_bindings(&current, &desired);
        assert_eq!(removed.len(), 1);
        assert_eq!(added.len(), 1);
        assert_eq!(removed[0].label, "a");
        assert_eq!(added[0].label, "b");
    }

    #[test]
    fn diff_ignores_duplicates_in_desired() {
        let current = Vec::new();
        let b = binding("web", Protocol::Tcp, "192.0.2.0/24", 80);
        let desired = vec![b.clone(), b.clone()];

        let (removed, added) = diff_bindings(&current, &desired);
        assert!(removed.is_empty());
        assert_eq!(added, vec![b]);
    }
}
