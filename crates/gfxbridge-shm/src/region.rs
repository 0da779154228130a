use std::ffi::CString;
use std::sync::atomic::{AtomicU32, AtomicU64};

use tracing::debug;

use crate::error::{Result, ShmError};

/// Maximum region name length accepted for `shm_open`.
///
/// POSIX only guarantees `NAME_MAX`-ish limits; 250 keeps us clear of the
/// 255-byte filename limit once the leading slash is added.
const MAX_NAME_LEN: usize = 250;

/// A shared memory region mapped into this process.
///
/// The fundamental storage type under every gfxbridge channel and the bulk
/// data arena. A region is either *named* (visible to the worker process via
/// `shm_open`) or *anonymous* (a `MAP_SHARED|MAP_ANONYMOUS` mapping usable
/// across threads of one process, which is what the tests and the in-process
/// worker loop use).
///
/// The creator zero-fills the region; openers must not assume any layout
/// beyond what the owning component wrote.
pub struct SharedRegion {
    ptr: *mut u8,
    len: usize,
    name: Option<String>,
    owner: bool,
}

// SAFETY: the mapping itself is plain shared memory; all concurrent access
// goes through raw pointers or atomics obtained via the accessors below,
// and the coordination burden is on the callers (SPSC ring discipline).
unsafe impl Send for SharedRegion {}
// SAFETY: see above; `&SharedRegion` only hands out pointers and atomic
// references, never unsynchronized `&mut` access.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create a named region of `len` bytes, replacing any stale region
    /// with the same name.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        let cname = validated_name(name)?;

        // Remove a stale region from a crashed session; ENOENT is fine.
        // SAFETY: `cname` is a valid NUL-terminated string.
        unsafe {
            libc::shm_unlink(cname.as_ptr());
        }

        // SAFETY: `cname` is a valid NUL-terminated string and the flags
        // request exclusive creation with owner-only permissions.
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(ShmError::Create {
                name: name.to_string(),
                source: std::io::Error::last_os_error(),
            });
        }

        // SAFETY: `fd` is the descriptor we just created.
        let rc = unsafe { libc::ftruncate(fd, len as libc::off_t) };
        if rc != 0 {
            let source = std::io::Error::last_os_error();
            // SAFETY: fd is open; cname was validated above.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(ShmError::Create {
                name: name.to_string(),
                source,
            });
        }

        let ptr = map_fd(fd, len, name)?;
        debug!(name, len, "created shared memory region");
        Ok(Self {
            ptr,
            len,
            name: Some(name.to_string()),
            owner: true,
        })
    }

    /// Open an existing named region created by the peer process.
    pub fn open(name: &str, len: usize) -> Result<Self> {
        let cname = validated_name(name)?;

        // SAFETY: `cname` is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(ShmError::Open {
                name: name.to_string(),
                source: std::io::Error::last_os_error(),
            });
        }

        // The creator sized the region; verify it is at least as large as
        // the layout we were told to expect.
        // SAFETY: `fd` is an open descriptor and `stat` is a valid out-pointer.
        let actual = unsafe {
            let mut stat: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut stat) != 0 {
                let source = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(ShmError::Open {
                    name: name.to_string(),
                    source,
                });
            }
            stat.st_size as usize
        };
        if actual < len {
            // SAFETY: fd is open.
            unsafe { libc::close(fd) };
            return Err(ShmError::RegionTooSmall {
                name: name.to_string(),
                len: actual,
                need: len,
            });
        }

        let ptr = map_fd(fd, len, name)?;
        debug!(name, len, "opened shared memory region");
        Ok(Self {
            ptr,
            len,
            name: Some(name.to_string()),
            owner: false,
        })
    }

    /// Create an anonymous shared mapping.
    ///
    /// Visible to all threads of this process (and to forked children), but
    /// not attachable by name. Used by tests and by in-process worker loops.
    pub fn anonymous(len: usize) -> Result<Self> {
        // SAFETY: anonymous mapping; no fd involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ShmError::Map {
                name: "<anonymous>".to_string(),
                len,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(Self {
            ptr: ptr.cast(),
            len,
            name: None,
            owner: true,
        })
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the mapping is zero bytes long.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The region name, if this is a named region.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Raw base pointer of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// An `AtomicU32` living at `offset` within the region.
    ///
    /// # Panics
    /// Panics if `offset` is misaligned or out of bounds; region layouts are
    /// fixed at construction time so either is a programming error.
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        assert!(offset + 4 <= self.len, "atomic_u32 offset out of bounds");
        assert!(offset % 4 == 0, "atomic_u32 offset misaligned");
        // SAFETY: bounds and alignment checked above; the pointed-to memory
        // lives as long as the mapping, and AtomicU32 tolerates arbitrary
        // concurrent access from both processes.
        unsafe { AtomicU32::from_ptr(self.ptr.add(offset).cast()) }
    }

    /// An `AtomicU64` living at `offset` within the region.
    ///
    /// # Panics
    /// Panics if `offset` is misaligned or out of bounds.
    pub fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        assert!(offset + 8 <= self.len, "atomic_u64 offset out of bounds");
        assert!(offset % 8 == 0, "atomic_u64 offset misaligned");
        // SAFETY: bounds and alignment checked above; see `atomic_u32`.
        unsafe { AtomicU64::from_ptr(self.ptr.add(offset).cast()) }
    }

    /// Copy `src` into the region at `offset`.
    ///
    /// # Panics
    /// Panics if the write would run past the end of the region.
    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        assert!(
            offset + src.len() <= self.len,
            "write_bytes out of bounds ({} + {} > {})",
            offset,
            src.len(),
            self.len
        );
        // SAFETY: bounds checked above; the ring discipline of the caller
        // guarantees the producer is the only writer of this byte range.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(offset), src.len());
        }
    }

    /// Copy `dst.len()` bytes out of the region at `offset`.
    ///
    /// # Panics
    /// Panics if the read would run past the end of the region.
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        assert!(
            offset + dst.len() <= self.len,
            "read_bytes out of bounds ({} + {} > {})",
            offset,
            dst.len(),
            self.len
        );
        // SAFETY: bounds checked above; see `write_bytes`.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    /// Zero-fill the whole region. Creators call this before publishing
    /// the region name to the peer.
    pub fn zero(&self) {
        // SAFETY: the full range [ptr, ptr+len) belongs to this mapping.
        unsafe {
            std::ptr::write_bytes(self.ptr, 0, self.len);
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe the mapping created in the ctor.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
        if self.owner {
            if let Some(name) = &self.name {
                if let Ok(cname) = CString::new(format!("/{}", name.trim_start_matches('/'))) {
                    // SAFETY: valid NUL-terminated string.
                    unsafe {
                        libc::shm_unlink(cname.as_ptr());
                    }
                    debug!(name, "unlinked shared memory region");
                }
            }
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name.as_deref().unwrap_or("<anonymous>"))
            .field("len", &self.len)
            .field("owner", &self.owner)
            .finish()
    }
}

fn map_fd(fd: libc::c_int, len: usize, name: &str) -> Result<*mut u8> {
    // SAFETY: `fd` is an open shm descriptor sized to at least `len`.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    let mmap_err = std::io::Error::last_os_error();
    // The mapping holds its own reference to the object; the fd is no
    // longer needed either way.
    // SAFETY: fd is open.
    unsafe { libc::close(fd) };
    if ptr == libc::MAP_FAILED {
        return Err(ShmError::Map {
            name: name.to_string(),
            len,
            source: mmap_err,
        });
    }
    Ok(ptr.cast())
}

fn validated_name(name: &str) -> Result<CString> {
    let bare = name.trim_start_matches('/');
    if bare.is_empty() || bare.len() > MAX_NAME_LEN || bare.contains('/') {
        return Err(ShmError::InvalidName {
            name: name.to_string(),
        });
    }
    CString::new(format!("/{bare}")).map_err(|_| ShmError::InvalidName {
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn anonymous_region_round_trip() {
        let region = SharedRegion::anonymous(4096).unwrap();
        region.write_bytes(128, b"payload");
        let mut out = [0u8; 7];
        region.read_bytes(128, &mut out);
        assert_eq!(&out, b"payload");
    }

    #[test]
    fn atomics_are_shared_across_threads() {
        let region = Arc::new(SharedRegion::anonymous(4096).unwrap());
        let writer = Arc::clone(&region);

        let handle = std::thread::spawn(move || {
            writer.atomic_u32(0).store(7, Ordering::Release);
            writer.atomic_u64(8).store(u64::MAX, Ordering::Release);
        });
        handle.join().unwrap();

        assert_eq!(region.atomic_u32(0).load(Ordering::Acquire), 7);
        assert_eq!(region.atomic_u64(8).load(Ordering::Acquire), u64::MAX);
    }

    #[test]
    fn named_region_create_open() {
        let name = format!("gfxbridge-test-region-{}", std::process::id());
        let created = SharedRegion::create(&name, 8192).unwrap();
        created.write_bytes(0, b"hello");

        let opened = SharedRegion::open(&name, 8192).unwrap();
        let mut out = [0u8; 5];
        opened.read_bytes(0, &mut out);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn open_rejects_undersized_region() {
        let name = format!("gfxbridge-test-small-{}", std::process::id());
        let _created = SharedRegion::create(&name, 1024).unwrap();
        let err = SharedRegion::open(&name, 4096).unwrap_err();
        assert!(matches!(err, ShmError::RegionTooSmall { .. }));
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(matches!(
            SharedRegion::create("", 64),
            Err(ShmError::InvalidName { .. })
        ));
        assert!(matches!(
            SharedRegion::create("a/b", 64),
            Err(ShmError::InvalidName { .. })
        ));
        let long = "x".repeat(300);
        assert!(matches!(
            SharedRegion::create(&long, 64),
            Err(ShmError::InvalidName { .. })
        ));
    }

    #[test]
    fn zero_clears_region() {
        let region = SharedRegion::anonymous(256).unwrap();
        region.write_bytes(0, &[0xFF; 256]);
        region.zero();
        let mut out = [0xAAu8; 256];
        region.read_bytes(0, &mut out);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn write_past_end_panics() {
        let region = SharedRegion::anonymous(16).unwrap();
        region.write_bytes(10, &[0u8; 8]);
    }
}
