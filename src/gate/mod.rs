//! Distributed Gate
//!
//! Mutual exclusion for sections entered from one processor or many. A
//! gate is chosen at creation time to be either
//!
//! - [`LocalGate`]: an in-process lock matched to the protection level,
//!   never touching shared memory; or
//! - [`SharedGate`]: a record inside a shared region, run as a filter lock
//!   with explicit cache maintenance so it works without coherence.
//!
//! Both sit behind the [`GateProvider`] trait and one [`Gate`] handle.
//!
//! A processor runs at most one filter-lock participant per shared record.
//! Creating or opening a record the processor already drives hands out a
//! new handle over the same [`SharedGate`], so threads of one processor
//! are still serialized by its nested local lock.
//!
//! ## Lifecycle
//!
//! `create`/`open_by_addr` → (`enter` ⇄ `leave`)* → `delete`/`close`.
//! A key returned by `enter` must be handed back unchanged to `leave`.

mod local;
mod shared;

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::config::GateConfig;
use crate::context::Context;
use crate::error::{IpcError, IpcResult};
use crate::platform::Timeout;
use crate::sharedregion::{PortablePtr, RegionId};

pub use local::LocalGate;
pub use shared::{GateRecord, SharedGate, GATE_CREATED};

// ============================================================================
// Parameters
// ============================================================================

/// What a gate protects against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ProtectionLevel {
    /// Local interrupts on this core
    Interrupt = 1,
    /// Other tasks on this core
    Task = 2,
    /// Other processes on this core (brokered)
    Process = 3,
    /// Every processor mapping the gate's region
    System = 4,
}

impl TryFrom<u32> for ProtectionLevel {
    type Error = IpcError;

    fn try_from(raw: u32) -> IpcResult<Self> {
        match raw {
            1 => Ok(ProtectionLevel::Interrupt),
            2 => Ok(ProtectionLevel::Task),
            3 => Ok(ProtectionLevel::Process),
            4 => Ok(ProtectionLevel::System),
            _ => Err(IpcError::InvalidArgument),
        }
    }
}

impl ProtectionLevel {
    /// True for levels served by a shared record
    pub fn is_shared(self) -> bool {
        self == ProtectionLevel::System
    }
}

/// Gate creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateParams {
    pub protection: ProtectionLevel,
    /// Region holding the record; required for `System` gates
    pub region: Option<RegionId>,
    /// Local protection nested inside a shared gate
    pub local: ProtectionLevel,
    /// Timeout used by `enter`
    pub timeout: Timeout,
}

impl GateParams {
    /// Parameters for a gate of `protection`, other fields from `config`
    pub fn new(protection: ProtectionLevel, config: &GateConfig) -> Self {
        Self {
            protection,
            region: None,
            local: config.default_local,
            timeout: config.enter_timeout,
        }
    }

    /// Parameters for a shared gate whose record lives in `region`
    pub fn shared(region: RegionId, config: &GateConfig) -> Self {
        Self {
            region: Some(region),
            ..Self::new(ProtectionLevel::System, config)
        }
    }
}

// ============================================================================
// Provider Interface
// ============================================================================

/// The two gate implementations behind one handle
pub trait GateProvider: Send + Sync + fmt::Debug {
    /// Acquire, returning the key `leave` needs
    fn enter(&self, timeout: Timeout) -> IpcResult<usize>;

    /// Release with the key `enter` returned
    fn leave(&self, key: usize) -> IpcResult<()>;

    fn protection(&self) -> ProtectionLevel;

    /// Location of the shared record, if any
    fn shared_addr(&self) -> Option<PortablePtr>;

    /// True while any processor holds the gate
    fn is_held(&self) -> bool;

    /// Creator side teardown; leaves the gate intact on failure
    fn delete(&self) -> IpcResult<()>;

    /// Opener side detach
    fn close(&self) -> IpcResult<()>;
}

// ============================================================================
// Gate Handle
// ============================================================================

/// Key proving the gate is held; pass it unchanged to [`Gate::leave`]
#[must_use = "a gate key must be passed back to leave"]
#[derive(Debug, PartialEq, Eq)]
pub struct GateKey(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Creator,
    Opener,
}

struct GateObject {
    ctx: Context,
    provider: Arc<dyn GateProvider>,
    role: Role,
    timeout: Timeout,
    destroyed: AtomicBool,
    outstanding: AtomicUsize,
}

/// Handle to a local or shared gate
#[derive(Clone)]
pub struct Gate {
    obj: Arc<GateObject>,
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("provider", &self.obj.provider)
            .field("role", &self.obj.role)
            .field("destroyed", &self.obj.destroyed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Gate {
    fn wrap(ctx: &Context, provider: Arc<dyn GateProvider>, role: Role, timeout: Timeout) -> Self {
        Self {
            obj: Arc::new(GateObject {
                ctx: ctx.clone(),
                provider,
                role,
                timeout,
                destroyed: AtomicBool::new(false),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a gate
    ///
    /// `System` protection builds a shared gate in `params.region`; every
    /// other level builds a local gate.
    pub fn create(ctx: &Context, params: GateParams) -> IpcResult<Self> {
        let provider: Arc<dyn GateProvider> = if params.protection.is_shared() {
            let region = params.region.ok_or(IpcError::InvalidArgument)?;
            let gate = Arc::new(SharedGate::create(ctx, region, params.local)?);
            let mut table = ctx.shared_gates().lock();
            table.retain(|_, g| g.strong_count() > 0);
            table.insert(gate.record().to_bits(), Arc::downgrade(&gate));
            gate
        } else {
            Arc::new(LocalGate::create(ctx, params.protection)?)
        };
        log::debug!(
            "gate: created {:?} gate on {}",
            params.protection,
            ctx.self_id()
        );
        Ok(Self::wrap(ctx, provider, Role::Creator, params.timeout))
    }

    /// Open a shared gate created on this or another processor
    ///
    /// Reuses the processor's existing participant for `record` if there
    /// is one; the broker counts the open either way.
    pub fn open_by_addr(ctx: &Context, record: PortablePtr) -> IpcResult<Self> {
        let mut table = ctx.shared_gates().lock();
        let provider = match table.get(&record.to_bits()).and_then(|g| g.upgrade()) {
            Some(gate) => {
                gate.reopen()?;
                gate
            }
            None => {
                let local = ctx.config().gate.default_local;
                let gate = Arc::new(SharedGate::open(ctx, record, local)?);
                table.retain(|_, g| g.strong_count() > 0);
                table.insert(record.to_bits(), Arc::downgrade(&gate));
                gate
            }
        };
        drop(table);

        log::debug!("gate: {} opened {}", ctx.self_id(), record);
        Ok(Self::wrap(
            ctx,
            provider,
            Role::Opener,
            ctx.config().gate.enter_timeout,
        ))
    }

    fn check_live(&self) -> IpcResult<()> {
        if self.obj.destroyed.load(Ordering::Acquire) {
            if cfg!(debug_assertions) {
                panic!("gate used after delete or close");
            }
            return Err(IpcError::InvalidState);
        }
        Ok(())
    }

    /// Enter with the gate's configured timeout
    pub fn enter(&self) -> IpcResult<GateKey> {
        self.enter_timeout(self.obj.timeout)
    }

    /// Enter, giving up after `timeout`
    pub fn enter_timeout(&self, timeout: Timeout) -> IpcResult<GateKey> {
        self.check_live()?;
        let key = self.obj.provider.enter(timeout)?;
        self.obj.outstanding.fetch_add(1, Ordering::AcqRel);
        log::trace!("gate: enter key={:#x}", key);
        Ok(GateKey(key))
    }

    /// Leave, restoring the state captured by `enter`
    pub fn leave(&self, key: GateKey) -> IpcResult<()> {
        self.check_live()?;
        self.obj.provider.leave(key.0)?;
        self.obj.outstanding.fetch_sub(1, Ordering::AcqRel);
        log::trace!("gate: leave key={:#x}", key.0);
        Ok(())
    }

    /// Run `f` inside the gate
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> IpcResult<R> {
        let key = self.enter()?;
        let r = f();
        self.leave(key)?;
        Ok(r)
    }

    pub fn protection(&self) -> ProtectionLevel {
        self.obj.provider.protection()
    }

    /// Location of the shared record; `None` for local gates
    pub fn shared_addr(&self) -> Option<PortablePtr> {
        self.obj.provider.shared_addr()
    }

    pub fn context(&self) -> &Context {
        &self.obj.ctx
    }

    /// Destroy the gate (creator only)
    ///
    /// Fails `Busy` while a key is outstanding on any processor.
    pub fn delete(&self) -> IpcResult<()> {
        self.check_live()?;
        if self.obj.role != Role::Creator {
            return Err(IpcError::InvalidState);
        }
        if self.obj.outstanding.load(Ordering::Acquire) != 0 || self.obj.provider.is_held() {
            return Err(IpcError::Busy);
        }
        self.obj.provider.delete()?;
        self.obj.destroyed.store(true, Ordering::Release);
        log::debug!("gate: deleted on {}", self.obj.ctx.self_id());
        Ok(())
    }

    /// Drop an opened gate (opener only)
    pub fn close(&self) -> IpcResult<()> {
        self.check_live()?;
        if self.obj.role != Role::Opener {
            return Err(IpcError::InvalidState);
        }
        if self.obj.outstanding.load(Ordering::Acquire) != 0 {
            return Err(IpcError::Busy);
        }
        self.obj.provider.close()?;
        self.obj.destroyed.store(true, Ordering::Release);
        log::debug!("gate: closed on {}", self.obj.ctx.self_id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{system, REGION};
    use core::sync::atomic::AtomicU32;
    use std::thread;

    const WORKERS: usize = 8;
    const ROUNDS: usize = 200;

    /// Every worker holds the gate while the counter is 1
    fn hammer(gates: std::vec::Vec<Gate>) {
        let counter = Arc::new(AtomicU32::new(0));
        let handles: std::vec::Vec<_> = (0..WORKERS)
            .map(|i| {
                let gate = gates[i % gates.len()].clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        let key = gate.enter().unwrap();
                        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        assert_eq!(now, 1, "two holders inside the gate");
                        thread::yield_now();
                        counter.fetch_sub(1, Ordering::SeqCst);
                        gate.leave(key).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    fn shared_gate(ctx: &Context) -> Gate {
        Gate::create(ctx, GateParams::shared(REGION, &ctx.config().gate)).unwrap()
    }

    #[test]
    fn test_protection_from_raw() {
        assert_eq!(ProtectionLevel::try_from(2), Ok(ProtectionLevel::Task));
        assert_eq!(ProtectionLevel::try_from(4), Ok(ProtectionLevel::System));
        assert_eq!(ProtectionLevel::try_from(0), Err(IpcError::InvalidArgument));
        assert_eq!(ProtectionLevel::try_from(9), Err(IpcError::InvalidArgument));
    }

    #[test]
    fn test_local_task_gate_mutual_exclusion() {
        let sys = system(1, 4096);
        let ctx = &sys.procs[0];
        let gate = Gate::create(ctx, GateParams::new(ProtectionLevel::Task, &ctx.config().gate))
            .unwrap();
        assert_eq!(gate.shared_addr(), None);
        hammer(std::vec![gate.clone()]);
        gate.delete().unwrap();
    }

    #[test]
    fn test_local_process_gate_mutual_exclusion() {
        let sys = system(1, 4096);
        let ctx = &sys.procs[0];
        let gate =
            Gate::create(ctx, GateParams::new(ProtectionLevel::Process, &ctx.config().gate))
                .unwrap();
        hammer(std::vec![gate.clone()]);
        gate.delete().unwrap();
        assert_eq!(sys.broker.live_objects(), 0);
    }

    #[test]
    fn test_shared_gate_mutual_exclusion_across_processors() {
        let sys = system(4, 4096);
        let creator = shared_gate(&sys.procs[0]);
        let record = creator.shared_addr().unwrap();

        let mut gates = std::vec![creator.clone()];
        for ctx in &sys.procs[1..] {
            gates.push(Gate::open_by_addr(ctx, record).unwrap());
        }
        hammer(gates.clone());

        assert_eq!(creator.delete(), Err(IpcError::InUse));
        for g in &gates[1..] {
            g.close().unwrap();
        }
        creator.delete().unwrap();
    }

    #[test]
    fn test_interrupt_gate_masks_while_held() {
        use crate::platform::HostPlatform;

        let sys = system(1, 4096);
        let ctx = &sys.procs[0];
        let gate =
            Gate::create(ctx, GateParams::new(ProtectionLevel::Interrupt, &ctx.config().gate))
                .unwrap();
        let probe = HostPlatform::new();

        let key = gate.enter().unwrap();
        assert!(probe.interrupts_masked());
        gate.leave(key).unwrap();
        assert!(!probe.interrupts_masked());
    }

    #[test]
    fn test_delete_busy_while_entered() {
        let sys = system(2, 4096);
        let gate = shared_gate(&sys.procs[0]);
        let key = gate.enter().unwrap();
        assert_eq!(gate.delete(), Err(IpcError::Busy));
        gate.leave(key).unwrap();
        gate.delete().unwrap();
    }

    #[test]
    fn test_enter_times_out_on_held_shared_gate() {
        let sys = system(2, 4096);
        let creator = shared_gate(&sys.procs[0]);
        let opener = Gate::open_by_addr(&sys.procs[1], creator.shared_addr().unwrap()).unwrap();

        let key = creator.enter().unwrap();
        assert_eq!(
            opener.enter_timeout(Timeout::from_millis(10)).err(),
            Some(IpcError::Timeout)
        );
        creator.leave(key).unwrap();

        let key = opener.enter_timeout(Timeout::from_millis(1000)).unwrap();
        opener.leave(key).unwrap();
        opener.close().unwrap();
        creator.delete().unwrap();
    }

    #[test]
    fn test_create_failures() {
        let sys = system(1, 256);
        let ctx = &sys.procs[0];
        let cfg = ctx.config().gate;

        let mut params = GateParams::new(ProtectionLevel::System, &cfg);
        assert_eq!(Gate::create(ctx, params).err(), Some(IpcError::InvalidArgument));

        params.region = Some(REGION);
        params.local = ProtectionLevel::System;
        assert_eq!(Gate::create(ctx, params).err(), Some(IpcError::InvalidArgument));

        // Two records fit in 256 bytes at 128-byte alignment; the third does not.
        let a = Gate::create(ctx, GateParams::shared(REGION, &cfg)).unwrap();
        let b = Gate::create(ctx, GateParams::shared(REGION, &cfg)).unwrap();
        assert_eq!(
            Gate::create(ctx, GateParams::shared(REGION, &cfg)).err(),
            Some(IpcError::OutOfMemory)
        );
        a.delete().unwrap();
        b.delete().unwrap();
    }

    #[test]
    fn test_open_uninitialized_record_fails() {
        let sys = system(2, 4096);
        let ctx = &sys.procs[1];
        let junk = ctx.reserve(REGION, 128, 128).unwrap();
        assert_eq!(Gate::open_by_addr(ctx, junk).err(), Some(IpcError::Corrupted));
    }

    #[test]
    fn test_roles_enforced() {
        let sys = system(2, 4096);
        let creator = shared_gate(&sys.procs[0]);
        let opener = Gate::open_by_addr(&sys.procs[1], creator.shared_addr().unwrap()).unwrap();
        assert_eq!(creator.close(), Err(IpcError::InvalidState));
        assert_eq!(opener.delete(), Err(IpcError::InvalidState));
        opener.close().unwrap();
        creator.delete().unwrap();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "gate used after delete")]
    fn test_enter_after_delete_is_loud() {
        let sys = system(1, 4096);
        let ctx = &sys.procs[0];
        let gate = Gate::create(ctx, GateParams::new(ProtectionLevel::Task, &ctx.config().gate))
            .unwrap();
        gate.delete().unwrap();
        let _ = gate.enter();
    }

    #[test]
    fn test_same_processor_open_shares_participant() {
        let sys = system(2, 4096);
        let ctx = &sys.procs[0];
        let creator = shared_gate(ctx);
        let record = creator.shared_addr().unwrap();
        let again = Gate::open_by_addr(ctx, record).unwrap();
        let remote = Gate::open_by_addr(&sys.procs[1], record).unwrap();

        // Two handles on one processor must not race each other in the filter.
        hammer(std::vec![creator.clone(), again.clone(), remote.clone()]);

        assert_eq!(creator.delete(), Err(IpcError::InUse));
        again.close().unwrap();
        assert_eq!(creator.delete(), Err(IpcError::InUse));
        remote.close().unwrap();
        creator.delete().unwrap();
        assert_eq!(sys.broker.live_objects(), 0);
    }

    #[test]
    fn test_reopen_after_delete_fails() {
        let sys = system(1, 4096);
        let ctx = &sys.procs[0];
        let creator = shared_gate(ctx);
        let record = creator.shared_addr().unwrap();
        creator.delete().unwrap();
        assert_eq!(Gate::open_by_addr(ctx, record).err(), Some(IpcError::Corrupted));
    }
}
