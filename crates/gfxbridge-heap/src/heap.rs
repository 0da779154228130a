use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use gfxbridge_shm::SharedRegion;
use tracing::{debug, warn};

use crate::error::{HeapError, Result};

/// Identity of one bulk allocation. Minted monotonically per session and
/// never reused, so a stale id can only miss, never alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocId(pub u32);

impl std::fmt::Display for AllocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bulk#{}", self.0)
    }
}

/// Where an allocation lives inside the arena region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub byte_offset: usize,
    pub byte_len: usize,
}

#[derive(Debug)]
struct Allocation {
    first_chunk: usize,
    chunk_count: usize,
    byte_len: usize,
}

#[derive(Debug, Default)]
struct HeapState {
    /// One bit of truth per chunk: occupied or free.
    occupied: Vec<bool>,
    allocs: HashMap<AllocId, Allocation>,
    next_id: u32,
}

/// The interceptor-side bulk allocator: a chunk-granular arena over one
/// shared memory region.
///
/// First-fit over a contiguous chunk run. Allocations are explicitly
/// paired with a later deallocate (lock allocates or reuses, the following
/// discard or destroy frees); nothing is garbage collected.
pub struct SharedHeap {
    region: Arc<SharedRegion>,
    chunk_len: usize,
    chunk_count: usize,
    state: Mutex<HeapState>,
}

impl SharedHeap {
    /// Default chunk granularity.
    pub const DEFAULT_CHUNK_LEN: usize = 4096;

    pub fn new(region: Arc<SharedRegion>, chunk_len: usize) -> Result<Self> {
        if chunk_len == 0 || !chunk_len.is_power_of_two() || chunk_len > region.len() {
            return Err(HeapError::InvalidGeometry {
                region_len: region.len(),
                chunk_len,
            });
        }
        let chunk_count = region.len() / chunk_len;
        Ok(Self {
            region,
            chunk_len,
            chunk_count,
            state: Mutex::new(HeapState {
                occupied: vec![false; chunk_count],
                allocs: HashMap::new(),
                next_id: 1,
            }),
        })
    }

    /// Allocate `len` bytes. `None` means the arena is exhausted; the
    /// caller degrades to inline transfer rather than failing the call.
    pub fn allocate(&self, len: usize) -> Option<AllocId> {
        if len == 0 {
            return None;
        }
        let chunks_needed = len.div_ceil(self.chunk_len);
        if chunks_needed > self.chunk_count {
            return None;
        }

        let mut state = self.state.lock().expect("heap state poisoned");
        let first = find_run(&state.occupied, chunks_needed)?;
        for chunk in &mut state.occupied[first..first + chunks_needed] {
            *chunk = true;
        }
        let id = AllocId(state.next_id);
        state.next_id += 1;
        state.allocs.insert(
            id,
            Allocation {
                first_chunk: first,
                chunk_count: chunks_needed,
                byte_len: len,
            },
        );
        debug!(%id, len, first_chunk = first, "bulk allocation");
        Some(id)
    }

    /// Free an allocation. Freeing an unknown id is a logged no-op —
    /// discard paths can race object destruction and the second free must
    /// not hurt.
    pub fn deallocate(&self, id: AllocId) {
        let mut state = self.state.lock().expect("heap state poisoned");
        match state.allocs.remove(&id) {
            Some(alloc) => {
                for chunk in
                    &mut state.occupied[alloc.first_chunk..alloc.first_chunk + alloc.chunk_count]
                {
                    *chunk = false;
                }
                debug!(%id, "bulk deallocation");
            }
            None => warn!(%id, "deallocate of unknown bulk allocation ignored"),
        }
    }

    /// Placement of a live allocation.
    pub fn resolve(&self, id: AllocId) -> Result<Placement> {
        let state = self.state.lock().expect("heap state poisoned");
        let alloc = state.allocs.get(&id).ok_or(HeapError::UnknownAlloc(id.0))?;
        Ok(Placement {
            byte_offset: alloc.first_chunk * self.chunk_len,
            byte_len: alloc.byte_len,
        })
    }

    /// Copy `data` into the allocation at `offset`.
    pub fn write(&self, id: AllocId, offset: usize, data: &[u8]) -> Result<()> {
        let placement = self.resolve(id)?;
        if offset + data.len() > placement.byte_len {
            return Err(HeapError::OutOfBounds {
                offset,
                len: data.len(),
                alloc_len: placement.byte_len,
            });
        }
        self.region
            .write_bytes(placement.byte_offset + offset, data);
        Ok(())
    }

    /// Copy bytes out of the allocation at `offset`.
    pub fn read(&self, id: AllocId, offset: usize, out: &mut [u8]) -> Result<()> {
        let placement = self.resolve(id)?;
        if offset + out.len() > placement.byte_len {
            return Err(HeapError::OutOfBounds {
                offset,
                len: out.len(),
                alloc_len: placement.byte_len,
            });
        }
        self.region.read_bytes(placement.byte_offset + offset, out);
        Ok(())
    }

    /// Arena size in bytes.
    pub fn len(&self) -> usize {
        self.chunk_count * self.chunk_len
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_count == 0
    }

    /// Bytes currently allocated (chunk-rounded).
    pub fn bytes_in_use(&self) -> usize {
        let state = self.state.lock().expect("heap state poisoned");
        state.occupied.iter().filter(|&&b| b).count() * self.chunk_len
    }
}

impl std::fmt::Debug for SharedHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedHeap")
            .field("chunk_len", &self.chunk_len)
            .field("chunk_count", &self.chunk_count)
            .finish()
    }
}

fn find_run(occupied: &[bool], needed: usize) -> Option<usize> {
    let mut run_start = 0;
    let mut run_len = 0;
    for (i, &used) in occupied.iter().enumerate() {
        if used {
            run_len = 0;
            run_start = i + 1;
        } else {
            run_len += 1;
            if run_len == needed {
                return Some(run_start);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap(region_len: usize, chunk_len: usize) -> SharedHeap {
        let region = Arc::new(SharedRegion::anonymous(region_len).unwrap());
        SharedHeap::new(region, chunk_len).unwrap()
    }

    #[test]
    fn allocate_write_read_round_trip() {
        let heap = heap(64 * 1024, 4096);
        let id = heap.allocate(10_000).unwrap();
        heap.write(id, 0, &[0xCD; 10_000]).unwrap();

        let mut out = vec![0u8; 10_000];
        heap.read(id, 0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0xCD));
    }

    #[test]
    fn ids_are_never_reused() {
        let heap = heap(16 * 4096, 4096);
        let a = heap.allocate(100).unwrap();
        heap.deallocate(a);
        let b = heap.allocate(100).unwrap();
        assert_ne!(a, b);
        // The stale id misses instead of aliasing the new allocation.
        assert!(matches!(heap.resolve(a), Err(HeapError::UnknownAlloc(_))));
    }

    #[test]
    fn exhaustion_returns_none() {
        let heap = heap(4 * 4096, 4096);
        assert!(heap.allocate(4 * 4096).is_some());
        assert!(heap.allocate(1).is_none());
    }

    #[test]
    fn freed_space_is_reusable() {
        let heap = heap(4 * 4096, 4096);
        let a = heap.allocate(2 * 4096).unwrap();
        let _b = heap.allocate(2 * 4096).unwrap();
        assert!(heap.allocate(1).is_none());
        heap.deallocate(a);
        assert!(heap.allocate(2 * 4096).is_some());
    }

    #[test]
    fn allocation_is_chunk_rounded_but_length_exact() {
        let heap = heap(16 * 4096, 4096);
        let id = heap.allocate(5000).unwrap();
        let placement = heap.resolve(id).unwrap();
        assert_eq!(placement.byte_len, 5000);
        assert_eq!(placement.byte_offset % 4096, 0);
        assert_eq!(heap.bytes_in_use(), 2 * 4096);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let heap = heap(16 * 4096, 4096);
        let id = heap.allocate(100).unwrap();
        assert!(matches!(
            heap.write(id, 90, &[0u8; 20]),
            Err(HeapError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn double_free_is_a_silent_no_op() {
        let heap = heap(16 * 4096, 4096);
        let id = heap.allocate(100).unwrap();
        heap.deallocate(id);
        heap.deallocate(id);
    }

    #[test]
    fn zero_length_allocation_is_refused() {
        let heap = heap(16 * 4096, 4096);
        assert!(heap.allocate(0).is_none());
    }

    #[test]
    fn invalid_geometry_is_rejected() {
        let region = Arc::new(SharedRegion::anonymous(4096).unwrap());
        assert!(matches!(
            SharedHeap::new(Arc::clone(&region), 3000),
            Err(HeapError::InvalidGeometry { .. })
        ));
        assert!(matches!(
            SharedHeap::new(region, 8192),
            Err(HeapError::InvalidGeometry { .. })
        ));
    }
}
