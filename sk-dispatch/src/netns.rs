//! Network namespace handle.
//!
//! The namespace file identifies where the sk_lookup program attaches and
//! names the per-namespace state directory: two processes looking at the
//! same namespace derive the same path from the file's device and inode.

use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::errors::Result;

pub struct NetNs {
    file: File,
    dev: u64,
    ino: u64,
}

impl NetNs {
    /// Open a namespace file, e.g. `/proc/self/ns/net` or a bind mount
    /// under `/run/netns`.
    pub fn open(path: &Path) -> Result<NetNs> {
        let file = File::open(path)?;
        let meta = file.metadata()?;
        Ok(NetNs {
            file,
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    /// State directory for this namespace under the BPF filesystem root.
    pub fn state_path(&self, bpffs_root: &Path) -> PathBuf {
        bpffs_root.join(format!("{}_{}", self.dev, self.ino))
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_path_is_stable_per_file() {
        // Any regular file works for the dev/ino derivation.
        let ns = NetNs::open(Path::new("/proc/self/ns/net"))
            .or_else(|_| NetNs::open(Path::new("/etc/hostname")))
            .unwrap();

        let a = ns.state_path(Path::new("/sys/fs/bpf"));
        let b = ns.state_path(Path::new("/sys/fs/bpf"));
        assert_eq!(a, b);
        assert!(a.starts_with("/sys/fs/bpf"));

        let name = a.file_name().unwrap().to_str().unwrap();
        let (dev, ino) = name.split_once('_').unwrap();
        assert!(dev.parse::<u64>().is_ok());
        assert!(ino.parse::<u64>().is_ok());
    }
}
