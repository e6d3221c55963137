//! Per-process coordination context
//!
//! Replaces process-wide singletons: the registry, the region directory and
//! the broker channel all hang off one explicitly constructed `Context`
//! that is passed to every gate and list operation. Gate and list handles
//! keep a clone, so the context cannot be torn down underneath them.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};

use spin::{Mutex, RwLock};

use crate::command::{Channel, ControlCmd, Dispatcher, Request};
use crate::config::IpcConfig;
use crate::error::{IpcError, IpcResult};
use crate::gate::SharedGate;
use crate::multiproc::{ProcName, ProcessorId, Registry};
use crate::platform::Platform;
use crate::sharedregion::{PortablePtr, ProcSet, RegionDirectory, RegionId};

/// Shared gates this processor drives, keyed by record bits
pub(crate) type SharedGateTable = Mutex<BTreeMap<u64, Weak<SharedGate>>>;

struct ContextInner {
    config: IpcConfig,
    registry: RwLock<Registry>,
    regions: RegionDirectory,
    dispatcher: Dispatcher,
    platform: Arc<dyn Platform>,
    /// One filter-lock participant per record on this processor
    shared_gates: SharedGateTable,
}

/// Handle to one processor's view of the IPC layer
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("self_id", &self.self_id())
            .field("regions", &self.inner.regions)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Bring the layer up for this processor
    ///
    /// Validates `config` locally, then announces the processor to the
    /// broker. Nothing is left registered with the broker on failure.
    pub fn new(
        config: IpcConfig,
        platform: Arc<dyn Platform>,
        channel: Arc<dyn Channel>,
    ) -> IpcResult<Self> {
        if !config.cache_line_size.is_power_of_two() {
            return Err(IpcError::InvalidArgument);
        }
        let mut registry = Registry::new();
        registry.setup(&config.multiproc)?;
        let local = registry.self_id();

        let dispatcher = Dispatcher::new(channel, config.channel_timeout);
        dispatcher.call(Request::IpcSetup { local })?;
        let announced = dispatcher.call(Request::MultiProcSetup {
            num_processors: registry.num_processors(),
            local,
        });
        if let Err(e) = announced {
            let _ = dispatcher.call(Request::IpcDestroy);
            return Err(e);
        }

        log::debug!(
            "context: {} of {} processors up",
            local,
            registry.num_processors()
        );
        Ok(Self {
            inner: Arc::new(ContextInner {
                config,
                registry: RwLock::new(registry),
                regions: RegionDirectory::new(local),
                dispatcher,
                platform,
                shared_gates: Mutex::new(BTreeMap::new()),
            }),
        })
    }

    /// Tear the layer down
    ///
    /// Fails `Busy`, handing the context back, while gate or list handles
    /// (or other clones) still reference it.
    pub fn destroy(self) -> Result<(), (Self, IpcError)> {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(inner) => return Err((Self { inner }, IpcError::Busy)),
        };

        let result = inner
            .dispatcher
            .call(Request::MultiProcDestroy)
            .and_then(|_| inner.dispatcher.call(Request::IpcDestroy));
        if let Err(e) = result {
            return Err((
                Self {
                    inner: Arc::new(inner),
                },
                e,
            ));
        }
        log::debug!("context: {} down", inner.registry.read().self_id());
        Ok(())
    }

    pub fn config(&self) -> &IpcConfig {
        &self.inner.config
    }

    pub fn platform(&self) -> &dyn Platform {
        &*self.inner.platform
    }

    pub(crate) fn platform_arc(&self) -> Arc<dyn Platform> {
        self.inner.platform.clone()
    }

    pub fn regions(&self) -> &RegionDirectory {
        &self.inner.regions
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub(crate) fn shared_gates(&self) -> &SharedGateTable {
        &self.inner.shared_gates
    }

    // ------------------------------------------------------------------
    // Processor registry
    // ------------------------------------------------------------------

    pub fn self_id(&self) -> ProcessorId {
        self.inner.registry.read().self_id()
    }

    pub fn num_processors(&self) -> u16 {
        self.inner.registry.read().num_processors()
    }

    pub fn id_from_name(&self, name: &str) -> IpcResult<ProcessorId> {
        self.inner.registry.read().id_from_name(name)
    }

    pub fn name_from_id(&self, id: ProcessorId) -> IpcResult<ProcName> {
        let registry = self.inner.registry.read();
        let name = registry.name_from_id(id)?;
        let mut out = ProcName::new();
        out.push_str(name).map_err(|_| IpcError::InvalidArgument)?;
        Ok(out)
    }

    pub fn is_valid_remote(&self, id: ProcessorId) -> bool {
        self.inner.registry.read().is_valid_remote(id)
    }

    /// Assign the local id when bring-up left it unassigned
    pub fn set_local_id(&self, id: ProcessorId) -> IpcResult<()> {
        {
            let registry = self.inner.registry.read();
            if registry.self_id().is_valid() || id.0 >= registry.num_processors() {
                return Err(IpcError::InvalidArgument);
            }
        }
        self.inner
            .dispatcher
            .call(Request::MultiProcSetLocalId { id })?;
        self.inner.registry.write().set_local_id(id)?;
        self.inner.regions.set_local(id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared regions
    // ------------------------------------------------------------------

    /// Register a mapped shared region and announce it to the broker
    ///
    /// # Safety
    ///
    /// Same contract as [`RegionDirectory::register`]: the mapping must
    /// outlive this context.
    pub unsafe fn register_region(
        &self,
        id: RegionId,
        base: *mut u8,
        size: usize,
        mappable_by: ProcSet,
    ) -> IpcResult<()> {
        self.inner.regions.register(id, base, size, mappable_by)?;
        let announced = self.inner.dispatcher.call(Request::SharedRegionSetEntry {
            region: id,
            size: size as u64,
            owner: self.self_id(),
        });
        if let Err(e) = announced {
            let _ = self.inner.regions.unregister(id);
            return Err(e);
        }
        Ok(())
    }

    /// Withdraw a region from the broker and the local directory
    pub fn unregister_region(&self, id: RegionId) -> IpcResult<()> {
        self.inner.regions.entry(id)?;
        self.inner
            .dispatcher
            .call(Request::SharedRegionClearEntry { region: id })?;
        self.inner.regions.unregister(id)?;
        Ok(())
    }

    /// Reserve `size` zeroed bytes aligned to `align` inside `region`
    ///
    /// The broker owns the region's allocation cursor, so blocks reserved
    /// from different processors never overlap. Alignment is relative to
    /// the region offset; regions must be mapped at bases at least as
    /// aligned as the largest `align` requested.
    pub fn reserve(&self, region: RegionId, size: usize, align: usize) -> IpcResult<PortablePtr> {
        if size == 0 || !align.is_power_of_two() {
            return Err(IpcError::InvalidArgument);
        }
        self.inner.regions.entry(region)?;
        let offset = self
            .inner
            .dispatcher
            .call(Request::SharedRegionReserve {
                region,
                size: size as u64,
                align: align as u64,
            })?
            .value();
        let offset = u32::try_from(offset).map_err(|_| IpcError::ChannelFailure)?;
        let ptr = PortablePtr::new(region, offset);
        self.inner.regions.claim(ptr, size, align)?;
        log::trace!("context: reserved {} bytes at {}", size, ptr);
        Ok(ptr)
    }

    // ------------------------------------------------------------------
    // Core control
    // ------------------------------------------------------------------

    /// Load, start or stop a remote processor through the broker
    pub fn control(&self, remote: ProcessorId, cmd: ControlCmd) -> IpcResult<()> {
        if !self.is_valid_remote(remote) {
            log::warn!("context: control {:?} on invalid remote {}", cmd, remote);
            return Err(IpcError::InvalidArgument);
        }
        self.inner
            .dispatcher
            .call(Request::IpcControl { remote, cmd })?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Multi-processor fixtures: several contexts in one process sharing
    //! a loopback broker and one region buffer.

    use super::*;
    use crate::command::LoopbackBroker;
    use crate::multiproc::MultiProcConfig;
    use crate::platform::HostPlatform;
    use std::vec::Vec;

    pub const REGION: RegionId = RegionId(0);

    pub struct System {
        pub broker: Arc<LoopbackBroker>,
        pub procs: Vec<Context>,
    }

    pub fn config(n: u16, local: u16) -> IpcConfig {
        let names = ["HOST", "DSP", "SYSM3", "APPM3"];
        IpcConfig::new(MultiProcConfig::with_names(&names[..n as usize], local).unwrap())
    }

    /// `n` processors, each mapping one shared region of `size` bytes
    pub fn system(n: u16, size: usize) -> System {
        let platform: Arc<dyn Platform> = Arc::new(HostPlatform::new());
        let broker = Arc::new(LoopbackBroker::new(platform.clone()));
        // Page-aligned so record alignment inside the region is predictable.
        let backing: &'static mut [u64] = std::vec![0u64; size / 8 + 512].leak();
        let raw = backing.as_mut_ptr() as usize;
        let base = ((raw + 4095) & !4095) as *mut u8;

        let procs = (0..n)
            .map(|i| {
                let ctx = Context::new(config(n, i), platform.clone(), broker.clone()).unwrap();
                unsafe { ctx.register_region(REGION, base, size, ProcSet::all()).unwrap() };
                ctx
            })
            .collect();
        System { broker, procs }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::command::{multiproc, sharedregion, LoopbackBroker};
    use crate::multiproc::MultiProcConfig;
    use crate::platform::HostPlatform;

    fn broker() -> (Arc<dyn Platform>, Arc<LoopbackBroker>) {
        let platform: Arc<dyn Platform> = Arc::new(HostPlatform::new());
        let broker = Arc::new(LoopbackBroker::new(platform.clone()));
        (platform, broker)
    }

    #[test]
    fn test_bring_up_announces_to_broker() {
        let (platform, broker) = broker();
        let ctx = Context::new(config(2, 1), platform, broker.clone()).unwrap();

        assert_eq!(ctx.self_id(), ProcessorId(1));
        assert_eq!(ctx.id_from_name("HOST"), Ok(ProcessorId(0)));
        assert_eq!(ctx.name_from_id(ProcessorId(1)).unwrap().as_str(), "DSP");
        assert_eq!(
            broker.history(),
            std::vec![crate::command::ipc::SETUP, multiproc::SETUP]
        );
        ctx.destroy().map_err(|(_, e)| e).unwrap();
    }

    #[test]
    fn test_bad_config_never_reaches_broker() {
        let (platform, broker) = broker();
        let err = Context::new(
            IpcConfig::new(MultiProcConfig::with_names(&["A", "A"], 0).unwrap()),
            platform.clone(),
            broker.clone(),
        )
        .err();
        assert_eq!(err, Some(IpcError::InvalidArgument));

        let err = Context::new(config(2, 0).with_cache_line_size(48), platform, broker.clone());
        assert_eq!(err.err(), Some(IpcError::InvalidArgument));
        assert!(broker.history().is_empty());
    }

    #[test]
    fn test_destroy_busy_while_shared() {
        let (platform, broker) = broker();
        let ctx = Context::new(config(2, 0), platform, broker).unwrap();
        let held = ctx.clone();

        let (ctx, err) = ctx.destroy().unwrap_err();
        assert_eq!(err, IpcError::Busy);
        drop(held);
        ctx.destroy().map_err(|(_, e)| e).unwrap();
    }

    #[test]
    fn test_region_registration_reverts_on_broker_failure() {
        let (platform, broker) = broker();
        let ctx = Context::new(config(2, 0), platform, broker.clone()).unwrap();
        let mut backing = std::vec![0u64; 32];

        broker.fail_next(IpcError::OutOfMemory);
        let res = unsafe {
            ctx.register_region(REGION, backing.as_mut_ptr().cast(), 256, ProcSet::all())
        };
        assert_eq!(res, Err(IpcError::OutOfMemory));
        assert_eq!(ctx.regions().entry(REGION).err(), Some(IpcError::NotFound));

        unsafe {
            ctx.register_region(REGION, backing.as_mut_ptr().cast(), 256, ProcSet::all())
                .unwrap();
        }
        broker.set_offline(true);
        assert_eq!(ctx.unregister_region(REGION), Err(IpcError::ChannelFailure));
        assert!(ctx.regions().entry(REGION).is_ok());

        broker.set_offline(false);
        ctx.unregister_region(REGION).unwrap();
        assert_eq!(broker.history().last(), Some(&sharedregion::CLEARENTRY));
    }

    #[test]
    fn test_reserve_disjoint_across_processors() {
        use core::sync::atomic::{AtomicU64, Ordering};

        let sys = system(2, 1024);
        let (host, dsp) = (&sys.procs[0], &sys.procs[1]);

        let a = host.reserve(REGION, 100, 64).unwrap();
        let b = dsp.reserve(REGION, 100, 64).unwrap();
        let c = host.reserve(REGION, 8, 8).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 128);
        assert_eq!(c.offset, 232);

        // Writes through one processor's block never land in the other's.
        let word = host.regions().object::<AtomicU64>(a).unwrap();
        word.store(0xFEED, Ordering::SeqCst);
        let peer = dsp.regions().object::<AtomicU64>(b).unwrap();
        assert_eq!(peer.load(Ordering::SeqCst), 0);

        assert_eq!(dsp.reserve(REGION, 4096, 8), Err(IpcError::OutOfMemory));
        assert_eq!(dsp.reserve(RegionId(3), 8, 8), Err(IpcError::NotFound));
        assert_eq!(dsp.reserve(REGION, 8, 6), Err(IpcError::InvalidArgument));
    }

    #[test]
    fn test_set_local_id_late() {
        let (platform, broker) = broker();
        let ctx = Context::new(config(3, 0xFFFF), platform, broker).unwrap();
        assert_eq!(ctx.self_id(), ProcessorId::INVALID);

        assert_eq!(ctx.set_local_id(ProcessorId(3)), Err(IpcError::InvalidArgument));
        ctx.set_local_id(ProcessorId(2)).unwrap();
        assert_eq!(ctx.self_id(), ProcessorId(2));
        assert_eq!(ctx.regions().local(), ProcessorId(2));
        assert_eq!(ctx.set_local_id(ProcessorId(1)), Err(IpcError::InvalidArgument));
    }

    #[test]
    fn test_control_validates_remote_first() {
        let sys = system(2, 4096);
        let host = &sys.procs[0];
        let before = sys.broker.history().len();

        assert_eq!(
            host.control(ProcessorId(0), ControlCmd::Load),
            Err(IpcError::InvalidArgument)
        );
        assert_eq!(
            host.control(ProcessorId(2), ControlCmd::Load),
            Err(IpcError::InvalidArgument)
        );
        assert_eq!(sys.broker.history().len(), before);

        host.control(ProcessorId(1), ControlCmd::Load).unwrap();
        host.control(ProcessorId(1), ControlCmd::Start).unwrap();
        host.control(ProcessorId(1), ControlCmd::Stop).unwrap();
    }
}
