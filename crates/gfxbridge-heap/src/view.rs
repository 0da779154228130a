use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use gfxbridge_shm::SharedRegion;
use tracing::warn;

use crate::error::{HeapError, Result};
use crate::heap::{AllocId, Placement};

/// The worker-side view of the bulk data arena.
///
/// The worker never allocates; it learns placements from `HeapAlloc`
/// commands, forgets them on `HeapFree`, and reads payload bytes in place
/// through its own mapping of the arena region.
pub struct HeapView {
    region: Arc<SharedRegion>,
    placements: Mutex<HashMap<AllocId, Placement>>,
}

impl HeapView {
    pub fn new(region: Arc<SharedRegion>) -> Self {
        Self {
            region,
            placements: Mutex::new(HashMap::new()),
        }
    }

    /// Record a placement announced by the interceptor.
    pub fn register(&self, id: AllocId, placement: Placement) {
        let mut placements = self.placements.lock().expect("heap view poisoned");
        if placements.insert(id, placement).is_some() {
            warn!(%id, "bulk allocation re-registered; replacing placement");
        }
    }

    /// Forget a placement. Unknown ids are a logged no-op, mirroring the
    /// allocator's defensive double-free behavior.
    pub fn remove(&self, id: AllocId) {
        let mut placements = self.placements.lock().expect("heap view poisoned");
        if placements.remove(&id).is_none() {
            warn!(%id, "remove of unknown bulk allocation ignored");
        }
    }

    /// Placement of a registered allocation.
    pub fn resolve(&self, id: AllocId) -> Result<Placement> {
        let placements = self.placements.lock().expect("heap view poisoned");
        placements
            .get(&id)
            .copied()
            .ok_or(HeapError::UnknownAlloc(id.0))
    }

    /// Copy the allocation's bytes (or a sub-range) out of the arena.
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
}

impl std::fmt::Debug for HeapView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let placements = self.placements.lock().expect("heap view poisoned");
        f.debug_struct("HeapView")
            .field("registered", &placements.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::SharedHeap;

    use super::*;

    #[test]
    fn view_reads_what_allocator_wrote() {
        let region = Arc::new(SharedRegion::anonymous(64 * 1024).unwrap());
        let heap = SharedHeap::new(Arc::clone(&region), 4096).unwrap();
        let view = HeapView::new(region);

        let id = heap.allocate(512).unwrap();
        heap.write(id, 0, &[0x5A; 512]).unwrap();
        view.register(id, heap.resolve(id).unwrap());

        let mut out = [0u8; 512];
        view.read(id, 0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn removed_placement_cannot_be_read() {
        let region = Arc::new(SharedRegion::anonymous(16 * 4096).unwrap());
        let view = HeapView::new(Arc::clone(&region));
        let id = AllocId(7);
        view.register(
            id,
            Placement {
                byte_offset: 0,
                byte_len: 64,
            },
        );
        view.remove(id);
        assert!(matches!(view.resolve(id), Err(HeapError::UnknownAlloc(7))));
        // Second remove is tolerated.
        view.remove(id);
    }

    #[test]
    fn sub_range_reads_are_bounds_checked() {
        let region = Arc::new(SharedRegion::anonymous(16 * 4096).unwrap());
        let view = HeapView::new(region);
        view.register(
            AllocId(1),
            Placement {
                byte_offset: 4096,
                byte_len: 100,
            },
        );
        let mut out = [0u8; 50];
        view.read(AllocId(1), 60, &mut out).unwrap_err();
        view.read(AllocId(1), 50, &mut out).unwrap();
    }
}
