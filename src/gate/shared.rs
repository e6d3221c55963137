//! Shared gates
//!
//! The record lives in a shared region and is driven by an N-processor
//! filter lock (generalized Peterson): processor `i` climbs levels
//! `1..n`, naming itself victim at each, and waits while it is the victim
//! and some other processor is at its level or above. Only plain loads and
//! stores reach shared memory, so the algorithm does not depend on
//! cross-core atomic read-modify-write.
//!
//! The memory is not assumed coherent. Every store to the record is
//! followed by a write-back of its line, and every poll of a peer's word is
//! preceded by an invalidate.
//!
//! Threads on the same processor are serialized first by a nested local
//! lock, so at most one per processor competes in the filter.

use core::mem::{align_of, size_of};
use core::sync::atomic::{AtomicU32, Ordering};

use super::local::LocalGate;
use super::{GateProvider, ProtectionLevel};
use crate::command::{BrokerHandle, Request};
use crate::context::Context;
use crate::error::{IpcError, IpcResult};
use crate::lock::WaitPolicy;
use crate::multiproc::MAX_PROCESSORS;
use crate::platform::{Deadline, Timeout};
use crate::sharedregion::{PortablePtr, RegionId, SharedObject};

/// Status tag of an initialized gate record
pub const GATE_CREATED: u32 = 0x1122_0701;

/// Gate state as laid out in shared memory
#[repr(C)]
#[derive(Debug)]
pub struct GateRecord {
    status: AtomicU32,
    num_procs: AtomicU32,
    /// Holder's processor id + 1, or 0 when free
    holder: AtomicU32,
    _rsvd: AtomicU32,
    level: [AtomicU32; MAX_PROCESSORS],
    victim: [AtomicU32; MAX_PROCESSORS],
}

// SAFETY: repr(C), atomics only, every bit pattern valid.
unsafe impl SharedObject for GateRecord {}

/// A gate backed by a record in a shared region
#[derive(Debug)]
pub struct SharedGate {
    ctx: Context,
    record: PortablePtr,
    handle: BrokerHandle,
    me: u32,
    num_procs: u32,
    local: LocalGate,
    wait: WaitPolicy,
}

fn addr_of<T>(r: &T) -> usize {
    r as *const T as usize
}

impl SharedGate {
    fn local_id(ctx: &Context) -> IpcResult<u32> {
        let me = ctx.self_id();
        if !me.is_valid() || me.0 >= ctx.num_processors() {
            return Err(IpcError::InvalidState);
        }
        Ok(me.0 as u32)
    }

    fn nested_lock(ctx: &Context, local: ProtectionLevel) -> IpcResult<(LocalGate, WaitPolicy)> {
        let lock = LocalGate::nested(ctx.platform_arc(), local)?;
        let wait = match local {
            ProtectionLevel::Interrupt => WaitPolicy::Spin,
            _ => WaitPolicy::Yield,
        };
        Ok((lock, wait))
    }

    /// Reserve and initialize a record in `region`
    pub fn create(ctx: &Context, region: RegionId, local: ProtectionLevel) -> IpcResult<Self> {
        let (local, wait) = Self::nested_lock(ctx, local)?;
        let me = Self::local_id(ctx)?;
        let num_procs = ctx.num_processors() as u32;

        let align = ctx.config().cache_line_size.max(align_of::<GateRecord>());
        let record = ctx.reserve(region, size_of::<GateRecord>(), align)?;
        let rec = ctx.regions().object::<GateRecord>(record)?;
        let platform = ctx.platform();

        rec.num_procs.store(num_procs, Ordering::SeqCst);
        platform.cache_writeback(addr_of(rec), size_of::<GateRecord>());
        // Status last: openers trust nothing until they see it.
        rec.status.store(GATE_CREATED, Ordering::SeqCst);
        platform.cache_writeback(addr_of(&rec.status), size_of::<u32>());

        let reply = ctx.dispatcher().call(Request::GateCreate {
            protection: ProtectionLevel::System,
            record: Some(record),
        });
        let handle = match reply.and_then(|r| r.handle()) {
            Ok(h) => h,
            Err(e) => {
                rec.status.store(0, Ordering::SeqCst);
                platform.cache_writeback(addr_of(&rec.status), size_of::<u32>());
                return Err(e);
            }
        };

        Ok(Self {
            ctx: ctx.clone(),
            record,
            handle,
            me,
            num_procs,
            local,
            wait,
        })
    }

    /// Check the record's tag and processor count
    fn validate(ctx: &Context, record: PortablePtr) -> IpcResult<u32> {
        let rec = ctx.regions().object::<GateRecord>(record)?;
        ctx.platform()
            .cache_invalidate(addr_of(rec), size_of::<GateRecord>());
        if rec.status.load(Ordering::SeqCst) != GATE_CREATED {
            log::warn!("gate: no gate record at {}", record);
            return Err(IpcError::Corrupted);
        }
        let num_procs = rec.num_procs.load(Ordering::SeqCst);
        if num_procs != ctx.num_processors() as u32 {
            return Err(IpcError::InvalidState);
        }
        Ok(num_procs)
    }

    /// Attach to a record another processor initialized
    pub fn open(ctx: &Context, record: PortablePtr, local: ProtectionLevel) -> IpcResult<Self> {
        let (local, wait) = Self::nested_lock(ctx, local)?;
        let me = Self::local_id(ctx)?;
        let num_procs = Self::validate(ctx, record)?;

        let handle = ctx
            .dispatcher()
            .call(Request::GateOpenByAddr { record })?
            .handle()?;

        Ok(Self {
            ctx: ctx.clone(),
            record,
            handle,
            me,
            num_procs,
            local,
            wait,
        })
    }

    pub fn record(&self) -> PortablePtr {
        self.record
    }

    /// Count one more opener of a record this processor already drives
    pub(crate) fn reopen(&self) -> IpcResult<()> {
        Self::validate(&self.ctx, self.record)?;
        self.ctx.dispatcher().call(Request::GateOpenByAddr {
            record: self.record,
        })?;
        Ok(())
    }

    fn rec(&self) -> IpcResult<&GateRecord> {
        self.ctx.regions().object::<GateRecord>(self.record)
    }

    fn publish(&self, word: &AtomicU32, value: u32) {
        word.store(value, Ordering::SeqCst);
        self.ctx
            .platform()
            .cache_writeback(addr_of(word), size_of::<u32>());
    }

    fn acquire(&self, rec: &GateRecord, deadline: &Deadline) -> IpcResult<()> {
        let platform = self.ctx.platform();
        let me = self.me as usize;

        for level in 1..self.num_procs {
            self.publish(&rec.level[me], level);
            self.publish(&rec.victim[level as usize], self.me);

            loop {
                platform.cache_invalidate(addr_of(rec), size_of::<GateRecord>());
                if rec.victim[level as usize].load(Ordering::SeqCst) != self.me {
                    break;
                }
                let contended = (0..self.num_procs as usize)
                    .filter(|&k| k != me)
                    .any(|k| rec.level[k].load(Ordering::SeqCst) >= level);
                if !contended {
                    break;
                }
                if deadline.expired(platform) {
                    self.publish(&rec.level[me], 0);
                    return Err(IpcError::Timeout);
                }
                match self.wait {
                    WaitPolicy::Spin => platform.relax(),
                    WaitPolicy::Yield => platform.yield_now(),
                }
            }
        }

        self.publish(&rec.holder, self.me + 1);
        Ok(())
    }
}

impl GateProvider for SharedGate {
    fn enter(&self, timeout: Timeout) -> IpcResult<usize> {
        let rec = self.rec()?;
        let deadline = Deadline::start(self.ctx.platform(), timeout);
        let key = self.local.enter_until(&deadline)?;
        if let Err(e) = self.acquire(rec, &deadline) {
            self.local.leave(key)?;
            return Err(e);
        }
        Ok(key)
    }

    fn leave(&self, key: usize) -> IpcResult<()> {
        let rec = self.rec()?;
        self.publish(&rec.holder, 0);
        self.publish(&rec.level[self.me as usize], 0);
        self.local.leave(key)
    }

    fn protection(&self) -> ProtectionLevel {
        ProtectionLevel::System
    }

    fn shared_addr(&self) -> Option<PortablePtr> {
        Some(self.record)
    }

    fn is_held(&self) -> bool {
        match self.rec() {
            Ok(rec) => {
                self.ctx
                    .platform()
                    .cache_invalidate(addr_of(&rec.holder), size_of::<u32>());
                rec.holder.load(Ordering::SeqCst) != 0
            }
            Err(_) => false,
        }
    }

    fn delete(&self) -> IpcResult<()> {
        let rec = self.rec()?;
        self.ctx
            .dispatcher()
            .call(Request::GateDelete {
                handle: self.handle,
            })?;
        self.publish(&rec.status, 0);
        Ok(())
    }

    fn close(&self) -> IpcResult<()> {
        self.ctx.dispatcher().call(Request::GateClose {
            handle: self.handle,
        })?;
        Ok(())
    }
}
