//! Shared Doubly-Linked List
//!
//! A circular list whose header and links live in shared memory. Links are
//! portable pointers and are turned into local addresses only at the point
//! of dereference, so every attached processor walks the same list through
//! its own mapping of the region.
//!
//! ## Layout
//!
//! ```text
//! ListAttrs { status, gate, head: ListElem, procs[MAX_PROCESSORS] }
//!                           │
//!                           └─ next ─► elem ─► elem ─► ... ─► head
//! ```
//!
//! Every mutation of a `next`/`prev` field happens inside the list's gate.
//! Traversal (`next`, `prev`, [`ListCursor`]) takes the gate per step only,
//! so a walk racing a mutator on another processor may observe a list that
//! changed between steps.

use core::mem::{offset_of, size_of};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::command::{BrokerHandle, Request};
use crate::context::Context;
use crate::error::{IpcError, IpcResult};
use crate::gate::Gate;
use crate::multiproc::MAX_PROCESSORS;
use crate::sharedregion::{PortablePtr, RegionId, SharedObject, SharedPtrCell};

/// Status tag of an initialized list
pub const LIST_CREATED: u32 = 0x1218_1964;

/// Status tag while the creator tears the list down
pub const LIST_DELETING: u32 = 0x0DE1_1964;

// ============================================================================
// Shared Layout
// ============================================================================

/// Link pair embedded in every list member
#[repr(C)]
#[derive(Debug)]
pub struct ListElem {
    next: SharedPtrCell,
    prev: SharedPtrCell,
}

impl ListElem {
    /// An element with null links
    pub const fn new() -> Self {
        Self {
            next: SharedPtrCell::null(),
            prev: SharedPtrCell::null(),
        }
    }
}

impl Default for ListElem {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: repr(C), atomics only, every bit pattern valid.
unsafe impl SharedObject for ListElem {}

/// Per-processor attach record
#[repr(C)]
#[derive(Debug)]
struct ProcAttrs {
    creator: AtomicU32,
    proc_id: AtomicU32,
    open_count: AtomicU32,
    _rsvd: AtomicU32,
}

/// List header as laid out in shared memory
#[repr(C)]
#[derive(Debug)]
pub struct ListAttrs {
    status: AtomicU32,
    _rsvd: AtomicU32,
    /// Shared record of the guarding gate; null for a local gate
    gate: SharedPtrCell,
    head: ListElem,
    procs: [ProcAttrs; MAX_PROCESSORS],
}

// SAFETY: repr(C), atomics only, every bit pattern valid.
unsafe impl SharedObject for ListAttrs {}

fn addr_of<T>(r: &T) -> usize {
    r as *const T as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Creator,
    Opener,
}

// ============================================================================
// List Handle
// ============================================================================

/// One processor's handle on a shared list
#[derive(Debug)]
pub struct ListMp {
    ctx: Context,
    gate: Gate,
    header: PortablePtr,
    head: PortablePtr,
    handle: BrokerHandle,
    role: Role,
    me: usize,
    live: bool,
}

impl ListMp {
    fn local_index(ctx: &Context) -> IpcResult<usize> {
        let me = ctx.self_id();
        if !me.is_valid() || me.0 >= ctx.num_processors() {
            return Err(IpcError::InvalidState);
        }
        Ok(me.index())
    }

    fn head_of(header: PortablePtr) -> PortablePtr {
        header.add(offset_of!(ListAttrs, head) as u32)
    }

    /// Create a list in `region`, guarded by `gate`
    ///
    /// The status tag is written last, after the sentinel and gate
    /// reference are in place and written back.
    pub fn create(ctx: &Context, region: RegionId, gate: &Gate) -> IpcResult<Self> {
        let me = Self::local_index(ctx)?;
        let align = ctx.config().cache_line_size;
        let header = ctx.reserve(region, size_of::<ListAttrs>(), align)?;
        let attrs = ctx.regions().object::<ListAttrs>(header)?;
        let head = Self::head_of(header);
        let platform = ctx.platform();

        attrs.gate.store(gate.shared_addr());
        attrs.head.next.store(Some(head));
        attrs.head.prev.store(Some(head));
        let slot = &attrs.procs[me];
        slot.creator.store(1, Ordering::SeqCst);
        slot.proc_id.store(me as u32, Ordering::SeqCst);
        slot.open_count.store(1, Ordering::SeqCst);
        platform.cache_writeback(addr_of(attrs), size_of::<ListAttrs>());

        attrs.status.store(LIST_CREATED, Ordering::SeqCst);
        platform.cache_writeback(addr_of(&attrs.status), size_of::<u32>());

        let reply = ctx.dispatcher().call(Request::ListCreate {
            header,
            gate: gate.shared_addr(),
        });
        let handle = match reply.and_then(|r| r.handle()) {
            Ok(h) => h,
            Err(e) => {
                attrs.status.store(0, Ordering::SeqCst);
                platform.cache_writeback(addr_of(&attrs.status), size_of::<u32>());
                return Err(e);
            }
        };

        log::debug!("listmp: {} created list at {}", ctx.self_id(), header);
        Ok(Self {
            ctx: ctx.clone(),
            gate: gate.clone(),
            header,
            head,
            handle,
            role: Role::Creator,
            me,
            live: true,
        })
    }

    /// Attach to a list another processor created
    ///
    /// Fails `Corrupted` when `header` holds no list, and `InvalidState`
    /// when the list is being deleted or is guarded by a gate local to its
    /// creator.
    pub fn attach(ctx: &Context, header: PortablePtr) -> IpcResult<Self> {
        let me = Self::local_index(ctx)?;
        let attrs = ctx.regions().object::<ListAttrs>(header)?;
        let platform = ctx.platform();

        platform.cache_invalidate(addr_of(attrs), size_of::<ListAttrs>());
        match attrs.status.load(Ordering::SeqCst) {
            LIST_CREATED => {}
            LIST_DELETING => return Err(IpcError::InvalidState),
            _ => {
                log::warn!("listmp: no list at {}", header);
                return Err(IpcError::Corrupted);
            }
        }
        let gate_ref = attrs.gate.load().ok_or(IpcError::InvalidState)?;
        let gate = Gate::open_by_addr(ctx, gate_ref)?;

        // The creator may have started deleting since the first check.
        let counted = gate.with(|| {
            platform.cache_invalidate(addr_of(attrs), size_of::<ListAttrs>());
            if attrs.status.load(Ordering::SeqCst) != LIST_CREATED {
                return Err(IpcError::InvalidState);
            }
            let slot = &attrs.procs[me];
            slot.proc_id.store(me as u32, Ordering::SeqCst);
            slot.open_count.fetch_add(1, Ordering::SeqCst);
            platform.cache_writeback(addr_of(slot), size_of::<ProcAttrs>());
            Ok(())
        });
        if let Err(e) = counted.and_then(|r| r) {
            Self::close_gate(&gate, header);
            return Err(e);
        }

        let handle = match ctx
            .dispatcher()
            .call(Request::ListOpenByAddr { header })
            .and_then(|r| r.handle())
        {
            Ok(h) => h,
            Err(e) => {
                // Only this processor writes its own slot while it is counted.
                let slot = &attrs.procs[me];
                slot.open_count.fetch_sub(1, Ordering::SeqCst);
                platform.cache_writeback(addr_of(slot), size_of::<ProcAttrs>());
                Self::close_gate(&gate, header);
                return Err(e);
            }
        };

        log::debug!("listmp: {} attached {}", ctx.self_id(), header);
        Ok(Self {
            ctx: ctx.clone(),
            gate,
            header,
            head: Self::head_of(header),
            handle,
            role: Role::Opener,
            me,
            live: true,
        })
    }

    fn close_gate(gate: &Gate, header: PortablePtr) {
        if let Err(e) = gate.close() {
            log::warn!("listmp: gate of {} left open: {}", header, e);
        }
    }

    /// Detach an opener
    ///
    /// On a broker failure the handle stays attached and counted, so the
    /// detach can be retried and the creator still sees the opener.
    pub fn detach(&mut self) -> IpcResult<()> {
        if !self.live || self.role != Role::Opener {
            return Err(IpcError::InvalidState);
        }
        let me = self.me;
        self.locked(|list, attrs| {
            let slot = &attrs.procs[me];
            if slot.open_count.load(Ordering::SeqCst) == 0 {
                return Err(IpcError::InvalidState);
            }
            slot.open_count.fetch_sub(1, Ordering::SeqCst);
            list.writeback(slot);
            Ok(())
        })?;

        let closed = self.ctx.dispatcher().call(Request::ListClose {
            handle: self.handle,
        });
        if let Err(e) = closed {
            let attrs = self.attrs()?;
            self.gate.with(|| {
                let slot = &attrs.procs[me];
                self.invalidate(slot);
                slot.open_count.fetch_add(1, Ordering::SeqCst);
                self.writeback(slot);
            })?;
            return Err(e);
        }

        self.live = false;
        self.gate.close()?;
        log::debug!("listmp: {} detached {}", self.ctx.self_id(), self.header);
        Ok(())
    }

    /// Destroy the list (creator only)
    ///
    /// Fails `InUse` while any opener is still attached. The list is marked
    /// deleting under the gate first, so an attach that has not yet
    /// counted itself fails instead of joining a dying list. On any
    /// failure the list stays intact.
    pub fn delete(&mut self) -> IpcResult<()> {
        if !self.live || self.role != Role::Creator {
            return Err(IpcError::InvalidState);
        }
        let me = self.me;
        self.locked(|list, attrs| {
            let busy = attrs.procs.iter().enumerate().any(|(k, slot)| {
                let own = if k == me { 1 } else { 0 };
                slot.open_count.load(Ordering::SeqCst) > own
            });
            if busy {
                return Err(IpcError::InUse);
            }
            attrs.status.store(LIST_DELETING, Ordering::SeqCst);
            list.writeback(&attrs.status);
            Ok(())
        })?;

        let deleted = self.ctx.dispatcher().call(Request::ListDelete {
            handle: self.handle,
        });
        let attrs = self.attrs()?;
        if let Err(e) = deleted {
            // Status is DELETING here, which `locked` refuses.
            self.gate.with(|| {
                attrs.status.store(LIST_CREATED, Ordering::SeqCst);
                self.writeback(&attrs.status);
            })?;
            return Err(e);
        }

        attrs.gate.store(None);
        attrs.head.next.store(None);
        attrs.head.prev.store(None);
        for slot in &attrs.procs {
            slot.creator.store(0, Ordering::SeqCst);
            slot.open_count.store(0, Ordering::SeqCst);
        }
        attrs.status.store(0, Ordering::SeqCst);
        self.ctx
            .platform()
            .cache_writeback(addr_of(attrs), size_of::<ListAttrs>());
        self.live = false;
        log::debug!("listmp: deleted {}", self.header);
        Ok(())
    }

    /// Location of the list header, for openers
    pub fn shared_addr(&self) -> PortablePtr {
        self.header
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    // ------------------------------------------------------------------
    // Shared memory access
    // ------------------------------------------------------------------

    fn attrs(&self) -> IpcResult<&ListAttrs> {
        self.ctx.regions().object::<ListAttrs>(self.header)
    }

    fn elem(&self, ptr: PortablePtr) -> IpcResult<&ListElem> {
        self.ctx.regions().object::<ListElem>(ptr)
    }

    fn portable(&self, elem: &ListElem) -> IpcResult<PortablePtr> {
        self.ctx.regions().to_portable(addr_of(elem))
    }

    fn writeback<T>(&self, obj: &T) {
        self.ctx
            .platform()
            .cache_writeback(addr_of(obj), size_of::<T>());
    }

    fn invalidate<T>(&self, obj: &T) {
        self.ctx
            .platform()
            .cache_invalidate(addr_of(obj), size_of::<T>());
    }

    fn link(&self, cell: &SharedPtrCell) -> IpcResult<PortablePtr> {
        self.invalidate(cell);
        cell.load().ok_or(IpcError::Corrupted)
    }

    fn set_link(&self, cell: &SharedPtrCell, ptr: Option<PortablePtr>) {
        cell.store(ptr);
        self.writeback(cell);
    }

    /// Run `f` inside the gate against a validated header
    fn locked<'a, R>(
        &'a self,
        f: impl FnOnce(&'a Self, &'a ListAttrs) -> IpcResult<R>,
    ) -> IpcResult<R> {
        if !self.live {
            return Err(IpcError::InvalidState);
        }
        let attrs = self.attrs()?;
        let key = self.gate.enter()?;
        self.ctx
            .platform()
            .cache_invalidate(addr_of(attrs), size_of::<ListAttrs>());
        let r = match attrs.status.load(Ordering::SeqCst) {
            LIST_CREATED => f(self, attrs),
            _ => Err(IpcError::InvalidState),
        };
        self.gate.leave(key)?;
        r
    }

    // ------------------------------------------------------------------
    // List operations
    // ------------------------------------------------------------------

    /// Splice `new` between two adjacent elements
    fn splice(&self, new: &ListElem, prev_p: PortablePtr, next_p: PortablePtr) -> IpcResult<()> {
        let new_p = self.portable(new)?;
        let prev = self.elem(prev_p)?;
        let next = self.elem(next_p)?;
        self.set_link(&new.next, Some(next_p));
        self.set_link(&new.prev, Some(prev_p));
        self.set_link(&prev.next, Some(new_p));
        self.set_link(&next.prev, Some(new_p));
        Ok(())
    }

    /// Unlink the element at `p`, checking its neighbours point back at it
    fn unlink(&self, p: PortablePtr) -> IpcResult<&ListElem> {
        if p == self.head {
            return Err(IpcError::InvalidArgument);
        }
        let elem = self.elem(p)?;
        let prev_p = self.link(&elem.prev).map_err(|_| IpcError::InvalidArgument)?;
        let next_p = self.link(&elem.next).map_err(|_| IpcError::InvalidArgument)?;
        let prev = self.elem(prev_p).map_err(|_| IpcError::InvalidArgument)?;
        let next = self.elem(next_p).map_err(|_| IpcError::InvalidArgument)?;
        if self.link(&prev.next).ok() != Some(p) || self.link(&next.prev).ok() != Some(p) {
            return Err(IpcError::InvalidArgument);
        }
        self.set_link(&prev.next, Some(next_p));
        self.set_link(&next.prev, Some(prev_p));
        self.set_link(&elem.next, None);
        self.set_link(&elem.prev, None);
        Ok(elem)
    }

    /// Append `elem` at the tail
    pub fn put_tail(&self, elem: &ListElem) -> IpcResult<()> {
        self.portable(elem)?;
        self.locked(|list, attrs| {
            let tail = list.link(&attrs.head.prev)?;
            list.splice(elem, tail, list.head)
        })
    }

    /// Prepend `elem` at the head
    pub fn put_head(&self, elem: &ListElem) -> IpcResult<()> {
        self.portable(elem)?;
        self.locked(|list, attrs| {
            let first = list.link(&attrs.head.next)?;
            list.splice(elem, list.head, first)
        })
    }

    /// Insert `new` immediately before `before`
    pub fn insert(&self, new: &ListElem, before: &ListElem) -> IpcResult<()> {
        self.portable(new)?;
        let before_p = self.portable(before)?;
        self.locked(|list, _| {
            let prev_p = list
                .link(&before.prev)
                .map_err(|_| IpcError::InvalidArgument)?;
            if list.link(&list.elem(prev_p)?.next).ok() != Some(before_p) {
                return Err(IpcError::InvalidArgument);
            }
            list.splice(new, prev_p, before_p)
        })
    }

    /// Remove and return the first element
    pub fn get(&self) -> IpcResult<Option<&ListElem>> {
        self.locked(|list, attrs| {
            let first = list.link(&attrs.head.next)?;
            if first == list.head {
                return Ok(None);
            }
            list.unlink(first).map(Some)
        })
    }

    /// Remove and return the last element
    pub fn get_tail(&self) -> IpcResult<Option<&ListElem>> {
        self.locked(|list, attrs| {
            let last = list.link(&attrs.head.prev)?;
            if last == list.head {
                return Ok(None);
            }
            list.unlink(last).map(Some)
        })
    }

    /// Unlink `elem` from wherever it sits in the list
    pub fn remove(&self, elem: &ListElem) -> IpcResult<()> {
        let p = self.portable(elem)?;
        self.locked(|list, _| list.unlink(p).map(|_| ()))
    }

    pub fn empty(&self) -> IpcResult<bool> {
        self.locked(|list, attrs| Ok(list.link(&attrs.head.next)? == list.head))
    }

    fn step(&self, from: Option<PortablePtr>, forward: bool) -> IpcResult<Option<PortablePtr>> {
        self.locked(|list, _| {
            let at = list.elem(from.unwrap_or(list.head))?;
            let to = if forward {
                list.link(&at.next)?
            } else {
                list.link(&at.prev)?
            };
            Ok(if to == list.head { None } else { Some(to) })
        })
    }

    /// Element after `elem`, or the first element for `None`
    pub fn next(&self, elem: Option<&ListElem>) -> IpcResult<Option<&ListElem>> {
        let from = elem.map(|e| self.portable(e)).transpose()?;
        self.step(from, true)?.map(|p| self.elem(p)).transpose()
    }

    /// Element before `elem`, or the last element for `None`
    pub fn prev(&self, elem: Option<&ListElem>) -> IpcResult<Option<&ListElem>> {
        let from = elem.map(|e| self.portable(e)).transpose()?;
        self.step(from, false)?.map(|p| self.elem(p)).transpose()
    }

    /// Lazy forward walk starting after `after` (or at the head)
    pub fn cursor(&self, after: Option<&ListElem>) -> IpcResult<ListCursor<'_>> {
        let pos = after.map(|e| self.portable(e)).transpose()?;
        Ok(self.cursor_at(pos))
    }

    /// Resume a walk from a position saved with [`ListCursor::position`]
    pub fn cursor_at(&self, pos: Option<PortablePtr>) -> ListCursor<'_> {
        ListCursor {
            list: self,
            pos,
            done: false,
        }
    }
}

/// Restartable traversal over a [`ListMp`]
///
/// Each step takes the gate on its own; nothing is held between steps.
#[derive(Debug)]
pub struct ListCursor<'a> {
    list: &'a ListMp,
    pos: Option<PortablePtr>,
    done: bool,
}

impl<'a> ListCursor<'a> {
    /// Last element yielded, `None` before the first step
    pub fn position(&self) -> Option<PortablePtr> {
        self.pos
    }
}

impl<'a> Iterator for ListCursor<'a> {
    type Item = IpcResult<&'a ListElem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.list.step(self.pos, true) {
            Ok(Some(p)) => {
                self.pos = Some(p);
                Some(self.list.elem(p))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
