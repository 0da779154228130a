use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use gfxbridge_heap::AllocId;
use gfxbridge_wire::{BufferDesc, CommandFlags, LockFlags, ObjectId, Opcode, PayloadWriter};
use tracing::debug;

use crate::proxy::{
    CapabilityKind, CapabilityRef, Lockable, ProxyCore, ProxyKind, ProxyObject,
};
use crate::session::BridgeSession;
use gfxbridge_wire::{LegacyResult, LegacyStatus};

struct LockInfo {
    offset: u32,
    len: u32,
    flags: LockFlags,
}

struct BufferInner {
    /// Staging copy the application writes through while locked.
    shadow: Vec<u8>,
    /// Outstanding locks, oldest first.
    locks: VecDeque<LockInfo>,
    /// Current bulk allocation backing this buffer on the worker side.
    /// Reused lock-to-lock until a DISCARD retires it.
    heap_id: Option<AllocId>,
}

/// A linear lockable resource (vertex or index data).
///
/// Lock hands out a range of the staging copy; unlock transmits the
/// written range — through the bulk arena when one is available, inline
/// otherwise — and retires the oldest outstanding lock.
pub struct BufferProxy {
    core: ProxyCore,
    desc: BufferDesc,
    inner: Mutex<BufferInner>,
}

/// Write access to a locked buffer range. Drop the guard before calling
/// `unlock`.
pub struct BufferLockGuard<'a> {
    inner: MutexGuard<'a, BufferInner>,
    start: usize,
    end: usize,
}

impl std::ops::Deref for BufferLockGuard<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.inner.shadow[self.start..self.end]
    }
}

impl std::ops::DerefMut for BufferLockGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.inner.shadow[self.start..self.end]
    }
}

impl BufferProxy {
    pub(crate) fn create(session: Arc<BridgeSession>, desc: BufferDesc) -> LegacyResult<Arc<Self>> {
        let core = ProxyCore::new(session)?;
        Ok(Arc::new(Self {
            core,
            desc,
            inner: Mutex::new(BufferInner {
                shadow: vec![0; desc.len as usize],
                locks: VecDeque::new(),
                heap_id: None,
            }),
        }))
    }

    pub fn desc(&self) -> BufferDesc {
        self.desc
    }

    pub(crate) fn wire_handle(&self) -> u32 {
        self.core.handle()
    }

    /// Lock a byte range for CPU access. `len == 0` locks through to the
    /// end of the buffer. Local only; transmission happens at unlock.
    pub fn lock(&self, offset: u32, len: u32, flags: LockFlags) -> LegacyResult<BufferLockGuard<'_>> {
        self.core.session().ensure_running()?;
        if offset >= self.desc.len || u64::from(offset) + u64::from(len) > u64::from(self.desc.len)
        {
            return Err(LegacyStatus::INVALID_CALL);
        }
        let effective_len = if len == 0 { self.desc.len - offset } else { len };

        let mut inner = self.inner.lock().expect("buffer inner poisoned");
        inner.locks.push_back(LockInfo { offset, len, flags });
        Ok(BufferLockGuard {
            start: offset as usize,
            end: offset as usize + effective_len as usize,
            inner,
        })
    }

    /// Transmit the oldest outstanding lock's range and retire it. With
    /// none outstanding this is a silent no-op and emits nothing.
    pub fn unlock(&self) -> LegacyStatus {
        let session = self.core.session();
        let mut inner = self.inner.lock().expect("buffer inner poisoned");
        let Some(lock) = inner.locks.pop_front() else {
            debug!(id = %self.core.id(), "unlock with no outstanding lock ignored");
            return LegacyStatus::OK;
        };
        if lock.flags.contains(LockFlags::READ_ONLY) {
            return LegacyStatus::OK;
        }
        if session.ensure_running().is_err() {
            return LegacyStatus::DEVICE_LOST;
        }

        // Applications routinely request oversized locks; clamp to the
        // real extent before transmitting.
        let offset = lock.offset;
        let len = if lock.len == 0 {
            self.desc.len - offset
        } else {
            lock.len.min(self.desc.len - offset)
        };
        let range = offset as usize..(offset + len) as usize;

        let discard = lock.flags.contains(LockFlags::DISCARD);
        let reuse_id = inner.heap_id.filter(|_| !discard);
        let heap_id = reuse_id.or_else(|| session.heap_allocate(self.desc.len as usize));

        let mut payload = PayloadWriter::new();
        payload
            .put_u32(offset)
            .put_u32(len)
            .put_u32(lock.flags.bits());
        let mut header = self.core.cmd(Opcode::BufferUnlock);

        let outcome = match heap_id {
            Some(id) => {
                let write = session
                    .heap()
                    .map(|heap| heap.write(id, offset as usize, &inner.shadow[range.clone()]));
                if let Some(Err(err)) = write {
                    session.poison(&format!("bulk write failed: {err}"));
                    return LegacyStatus::DEVICE_LOST;
                }
                let retired = if discard { inner.heap_id.take() } else { None };
                inner.heap_id = Some(id);
                header.flags = header.flags | CommandFlags::DATA_IN_HEAP;
                payload.put_u32(id.0);
                let result = session.forget(session.device_caller(), header, &payload.finish());
                // The free follows the unlock on the same FIFO channel,
                // so the worker never sees a dangling allocation id.
                if let Some(old) = retired {
                    session.heap_free(old);
                }
                result
            }
            None => {
                payload.put_blob(&inner.shadow[range]);
                session.forget(session.device_caller(), header, &payload.finish())
            }
        };
        match outcome {
            Ok(()) => LegacyStatus::OK,
            Err(status) => status,
        }
    }
}

impl ProxyObject for BufferProxy {
    fn object_id(&self) -> ObjectId {
        self.core.id()
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::Buffer
    }

    fn add_ref(&self) -> u32 {
        self.core.add_ref()
    }

    fn release(&self) -> u32 {
        match self.core.release_count() {
            Some(0) => {
                let session = self.core.session();
                let _ = session.forget(
                    session.device_caller(),
                    self.core.cmd(Opcode::BufferDestroy),
                    &[],
                );
                // Free after destroy: FIFO ordering keeps the worker from
                // resolving a freed id.
                if let Some(id) = self.inner.lock().expect("buffer inner poisoned").heap_id.take() {
                    session.heap_free(id);
                }
                0
            }
            Some(count) => count,
            None => 0,
        }
    }

    fn query_capability(&self, kind: CapabilityKind) -> Option<CapabilityRef<'_>> {
        match kind {
            CapabilityKind::Lockable => Some(CapabilityRef::Lockable(self)),
            CapabilityKind::Container => None,
        }
    }
}

impl Lockable for BufferProxy {
    fn unlock(&self) -> LegacyStatus {
        BufferProxy::unlock(self)
    }

    fn outstanding_locks(&self) -> usize {
        self.inner.lock().expect("buffer inner poisoned").locks.len()
    }
}

impl std::fmt::Debug for BufferProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferProxy")
            .field("id", &self.core.id())
            .field("desc", &self.desc)
            .finish()
    }
}
