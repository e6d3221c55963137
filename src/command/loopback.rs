//! Loopback Broker
//!
//! An in-process stand-in for the privileged broker. It keeps the handle
//! table for gates and lists, owns the process-level locks that user space
//! cannot implement by itself, and tracks core state for core-control
//! commands. Several [`Context`](crate::Context)s may share one instance to
//! emulate processors attached to the same broker.
//!
//! The broker also owns the allocation cursor of every announced region, so
//! processors reserving shared objects never hand out the same bytes twice.
//!
//! Failure injection (`fail_next`, `fail_on`, `set_offline`) lets callers
//! exercise the error paths of every brokered operation.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::request::{BrokerHandle, ControlCmd, Request};
use super::{Channel, ChannelError, CommandBlock, CommandId};
use crate::error::{IpcError, IpcResult};
use crate::gate::ProtectionLevel;
use crate::lock::{SimpleLock, WaitPolicy};
use crate::multiproc::MAX_PROCESSORS;
use crate::platform::{Deadline, Platform, Timeout};
use crate::sharedregion::{PortablePtr, RegionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoreState {
    Reset,
    Loaded,
    Running,
}

#[derive(Debug)]
enum Object {
    Gate {
        protection: ProtectionLevel,
        record: Option<PortablePtr>,
        lock: Arc<SimpleLock>,
        holder: Option<u64>,
        opens: u32,
    },
    List {
        header: PortablePtr,
        opens: u32,
    },
}

#[derive(Debug)]
struct RegionState {
    size: u64,
    refs: u32,
    /// Offset of the first byte not yet reserved
    cursor: u64,
}

#[derive(Debug)]
struct BrokerState {
    num_processors: Option<u16>,
    attached: u32,
    regions: BTreeMap<u16, RegionState>,
    objects: BTreeMap<u32, Object>,
    next_handle: u32,
    next_key: u64,
    cores: [CoreState; MAX_PROCESSORS],
    fail_next: Option<IpcError>,
    fail_on: Option<(CommandId, IpcError)>,
    offline: bool,
    history: Vec<CommandId>,
}

/// In-process broker implementing [`Channel`]
pub struct LoopbackBroker {
    platform: Arc<dyn Platform>,
    state: Mutex<BrokerState>,
}

impl core::fmt::Debug for LoopbackBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoopbackBroker")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl LoopbackBroker {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            state: Mutex::new(BrokerState {
                num_processors: None,
                attached: 0,
                regions: BTreeMap::new(),
                objects: BTreeMap::new(),
                next_handle: 1,
                next_key: 1,
                cores: [CoreState::Reset; MAX_PROCESSORS],
                fail_next: None,
                fail_on: None,
                offline: false,
                history: Vec::new(),
            }),
        }
    }

    /// Fail the next request with `err` after the broker receives it
    pub fn fail_next(&self, err: IpcError) {
        self.state.lock().fail_next = Some(err);
    }

    /// Fail the next request carrying `cmd` with `err`
    pub fn fail_on(&self, cmd: CommandId, err: IpcError) {
        self.state.lock().fail_on = Some((cmd, err));
    }

    /// Make the channel itself unreachable
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Command ids received so far, oldest first
    pub fn history(&self) -> Vec<CommandId> {
        self.state.lock().history.clone()
    }

    /// Number of live gate and list handles
    pub fn live_objects(&self) -> usize {
        self.state.lock().objects.len()
    }

    fn handle_request(&self, req: Request) -> IpcResult<u64> {
        // Enter blocks, so it must not run under the state lock.
        if let Request::GateEnter { handle, timeout } = req {
            return self.gate_enter(handle, timeout);
        }

        let mut st = self.state.lock();
        match req {
            Request::MultiProcSetup { num_processors, .. } => {
                match st.num_processors {
                    Some(n) if n != num_processors => return Err(IpcError::InvalidArgument),
                    _ => st.num_processors = Some(num_processors),
                }
                Ok(0)
            }
            Request::MultiProcDestroy => Ok(0),
            Request::MultiProcSetLocalId { id } => match st.num_processors {
                Some(n) if id.0 < n => Ok(0),
                _ => Err(IpcError::InvalidArgument),
            },
            Request::SharedRegionSetEntry { region, size, .. } => {
                match st.regions.get_mut(&region.0) {
                    Some(r) if r.size != size => return Err(IpcError::AlreadyExists),
                    Some(r) => r.refs += 1,
                    None => {
                        let r = RegionState {
                            size,
                            refs: 1,
                            cursor: 0,
                        };
                        st.regions.insert(region.0, r);
                    }
                }
                Ok(0)
            }
            Request::SharedRegionClearEntry { region } => Self::clear_region(&mut st, region),
            Request::SharedRegionReserve {
                region,
                size,
                align,
            } => Self::reserve(&mut st, region, size, align),
            Request::GateCreate { protection, record } => {
                let obj = Object::Gate {
                    protection,
                    record,
                    lock: Arc::new(SimpleLock::new()),
                    holder: None,
                    opens: 0,
                };
                Ok(Self::insert(&mut st, obj) as u64)
            }
            Request::GateOpenByAddr { record } => {
                let (handle, obj) = st
                    .objects
                    .iter_mut()
                    .find(|(_, o)| matches!(o, Object::Gate { record: Some(r), .. } if *r == record))
                    .ok_or(IpcError::NotFound)?;
                if let Object::Gate { opens, .. } = obj {
                    *opens += 1;
                }
                Ok(*handle as u64)
            }
            Request::ListOpenByAddr { header } => {
                let (handle, obj) = st
                    .objects
                    .iter_mut()
                    .find(|(_, o)| matches!(o, Object::List { header: h, .. } if *h == header))
                    .ok_or(IpcError::NotFound)?;
                if let Object::List { opens, .. } = obj {
                    *opens += 1;
                }
                Ok(*handle as u64)
            }
            Request::GateClose { handle } | Request::ListClose { handle } => {
                match st.objects.get_mut(&handle.0) {
                    Some(Object::Gate { opens, .. }) | Some(Object::List { opens, .. })
                        if *opens > 0 =>
                    {
                        *opens -= 1;
                        Ok(0)
                    }
                    Some(_) => Err(IpcError::InvalidState),
                    None => Err(IpcError::NotFound),
                }
            }
            Request::GateDelete { handle } => {
                match st.objects.get(&handle.0) {
                    Some(Object::Gate { lock, opens, .. }) => {
                        if lock.is_locked() {
                            return Err(IpcError::Busy);
                        }
                        if *opens > 0 {
                            return Err(IpcError::InUse);
                        }
                    }
                    _ => return Err(IpcError::NotFound),
                }
                st.objects.remove(&handle.0);
                Ok(0)
            }
            Request::ListCreate { header, .. } => {
                let obj = Object::List { header, opens: 0 };
                Ok(Self::insert(&mut st, obj) as u64)
            }
            Request::ListDelete { handle } => {
                match st.objects.get(&handle.0) {
                    Some(Object::List { opens: 0, .. }) => {}
                    Some(Object::List { .. }) => return Err(IpcError::InUse),
                    _ => return Err(IpcError::NotFound),
                }
                st.objects.remove(&handle.0);
                Ok(0)
            }
            Request::GateLeave { handle, key } => {
                let Some(Object::Gate { lock, holder, .. }) = st.objects.get_mut(&handle.0) else {
                    return Err(IpcError::NotFound);
                };
                if *holder != Some(key) {
                    return Err(IpcError::InvalidArgument);
                }
                *holder = None;
                lock.unlock();
                Ok(0)
            }
            Request::IpcSetup { .. } => {
                st.attached += 1;
                Ok(0)
            }
            Request::IpcDestroy => {
                if st.attached == 0 {
                    return Err(IpcError::InvalidState);
                }
                st.attached -= 1;
                Ok(0)
            }
            Request::IpcControl { remote, cmd } => {
                let n = st.num_processors.unwrap_or(0);
                if remote.0 >= n {
                    return Err(IpcError::InvalidArgument);
                }
                let core = &mut st.cores[remote.index()];
                *core = match (cmd, *core) {
                    (ControlCmd::Load, CoreState::Reset | CoreState::Loaded) => CoreState::Loaded,
                    (ControlCmd::Start, CoreState::Loaded) => CoreState::Running,
                    (ControlCmd::Stop, CoreState::Running) => CoreState::Reset,
                    _ => return Err(IpcError::InvalidState),
                };
                Ok(0)
            }
            Request::GateEnter { .. } => Err(IpcError::InvalidState),
        }
    }

    fn insert(st: &mut BrokerState, obj: Object) -> u32 {
        let handle = st.next_handle;
        st.next_handle += 1;
        st.objects.insert(handle, obj);
        handle
    }

    fn clear_region(st: &mut BrokerState, region: RegionId) -> IpcResult<u64> {
        let r = st.regions.get_mut(&region.0).ok_or(IpcError::NotFound)?;
        r.refs -= 1;
        if r.refs == 0 {
            st.regions.remove(&region.0);
        }
        Ok(0)
    }

    fn reserve(st: &mut BrokerState, region: RegionId, size: u64, align: u64) -> IpcResult<u64> {
        if size == 0 || !align.is_power_of_two() {
            return Err(IpcError::InvalidArgument);
        }
        let r = st.regions.get_mut(&region.0).ok_or(IpcError::NotFound)?;
        let start = r
            .cursor
            .checked_add(align - 1)
            .map(|c| c & !(align - 1))
            .ok_or(IpcError::OutOfMemory)?;
        let end = start.checked_add(size).ok_or(IpcError::OutOfMemory)?;
        if end > r.size {
            log::warn!(
                "broker: region {} exhausted ({} bytes requested, {} free)",
                region.0,
                size,
                r.size - r.cursor
            );
            return Err(IpcError::OutOfMemory);
        }
        r.cursor = end;
        Ok(start)
    }

    fn gate_enter(&self, handle: BrokerHandle, timeout: Timeout) -> IpcResult<u64> {
        let lock = match self.state.lock().objects.get(&handle.0) {
            Some(Object::Gate {
                protection: ProtectionLevel::Process,
                record: None,
                lock,
                ..
            }) => lock.clone(),
            Some(_) => return Err(IpcError::InvalidState),
            None => return Err(IpcError::NotFound),
        };

        let deadline = Deadline::start(&*self.platform, timeout);
        if !lock.lock_until(&*self.platform, WaitPolicy::Yield, &deadline) {
            return Err(IpcError::Timeout);
        }

        let mut st = self.state.lock();
        let key = st.next_key;
        st.next_key += 1;
        match st.objects.get_mut(&handle.0) {
            Some(Object::Gate { holder, .. }) => {
                *holder = Some(key);
                Ok(key)
            }
            // Deleted while we waited; deletion refuses a held lock, so
            // this lock is orphaned and can simply be released.
            _ => {
                lock.unlock();
                Err(IpcError::NotFound)
            }
        }
    }
}

impl Channel for LoopbackBroker {
    fn transact(&self, block: &mut CommandBlock, _timeout: Timeout) -> Result<(), ChannelError> {
        {
            let mut st = self.state.lock();
            if st.offline {
                return Err(ChannelError::Offline);
            }
            st.history.push(CommandId(block.cmd_id));
            if let Some(err) = st.fail_next.take() {
                block.fail(err);
                return Ok(());
            }
            if let Some((cmd, err)) = st.fail_on {
                if cmd.0 == block.cmd_id {
                    st.fail_on = None;
                    block.fail(err);
                    return Ok(());
                }
            }
        }

        match Request::decode(block).and_then(|req| self.handle_request(req)) {
            Ok(out) => block.complete(out),
            Err(err) => block.fail(err),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{gatemp, sharedregion, Dispatcher};
    use crate::multiproc::ProcessorId;
    use crate::platform::HostPlatform;
    use core::time::Duration;

    fn broker() -> (Arc<LoopbackBroker>, Dispatcher) {
        let broker = Arc::new(LoopbackBroker::new(Arc::new(HostPlatform::new())));
        let d = Dispatcher::new(broker.clone(), Timeout::Forever);
        (broker, d)
    }

    fn process_gate(d: &Dispatcher) -> BrokerHandle {
        d.call(Request::GateCreate {
            protection: ProtectionLevel::Process,
            record: None,
        })
        .unwrap()
        .handle()
        .unwrap()
    }

    #[test]
    fn test_process_lock_enter_leave() {
        let (_, d) = broker();
        let h = process_gate(&d);

        let key = d
            .call(Request::GateEnter {
                handle: h,
                timeout: Timeout::Forever,
            })
            .unwrap()
            .value();
        let again = d.call(Request::GateEnter {
            handle: h,
            timeout: Timeout::After(Duration::from_millis(5)),
        });
        assert_eq!(again.err(), Some(IpcError::Timeout));

        assert_eq!(
            d.call(Request::GateDelete { handle: h }).err(),
            Some(IpcError::Busy)
        );
        assert_eq!(
            d.call(Request::GateLeave { handle: h, key: key + 1 }).err(),
            Some(IpcError::InvalidArgument)
        );
        d.call(Request::GateLeave { handle: h, key }).unwrap();
        d.call(Request::GateDelete { handle: h }).unwrap();
    }

    #[test]
    fn test_fault_injection() {
        let (broker, d) = broker();
        broker.fail_next(IpcError::OutOfMemory);
        assert_eq!(
            d.call(Request::GateCreate {
                protection: ProtectionLevel::Process,
                record: None,
            })
            .err(),
            Some(IpcError::OutOfMemory)
        );
        assert_eq!(broker.live_objects(), 0);
        assert_eq!(broker.history(), std::vec![gatemp::CREATE]);

        broker.set_offline(true);
        assert_eq!(
            d.call(Request::IpcDestroy).err(),
            Some(IpcError::ChannelFailure)
        );
    }

    #[test]
    fn test_core_control_sequence() {
        let (_, d) = broker();
        let control = |cmd| {
            d.call(Request::IpcControl {
                remote: ProcessorId(1),
                cmd,
            })
        };
        assert_eq!(control(ControlCmd::Load).err(), Some(IpcError::InvalidArgument));

        d.call(Request::MultiProcSetup {
            num_processors: 2,
            local: ProcessorId(0),
        })
        .unwrap();
        assert_eq!(control(ControlCmd::Start).err(), Some(IpcError::InvalidState));
        control(ControlCmd::Load).unwrap();
        control(ControlCmd::Start).unwrap();
        assert_eq!(control(ControlCmd::Load).err(), Some(IpcError::InvalidState));
        control(ControlCmd::Stop).unwrap();
    }

    fn reserve(d: &Dispatcher, region: u16, size: u64, align: u64) -> IpcResult<u64> {
        d.call(Request::SharedRegionReserve {
            region: RegionId(region),
            size,
            align,
        })
        .map(|r| r.value())
    }

    #[test]
    fn test_reserve_hands_out_disjoint_blocks() {
        let (_, d) = broker();
        assert_eq!(reserve(&d, 0, 8, 8), Err(IpcError::NotFound));

        let announce = |size| {
            d.call(Request::SharedRegionSetEntry {
                region: RegionId(0),
                size,
                owner: ProcessorId(0),
            })
        };
        announce(512).unwrap();
        // A second processor announcing the same region shares its cursor.
        announce(512).unwrap();

        assert_eq!(reserve(&d, 0, 10, 8), Ok(0));
        assert_eq!(reserve(&d, 0, 16, 64), Ok(64));
        assert_eq!(reserve(&d, 0, 8, 8), Ok(80));
        assert_eq!(reserve(&d, 0, 0, 8), Err(IpcError::InvalidArgument));
        assert_eq!(reserve(&d, 0, 8, 12), Err(IpcError::InvalidArgument));
        assert_eq!(reserve(&d, 0, 512, 8), Err(IpcError::OutOfMemory));
        assert_eq!(reserve(&d, 0, 424, 8), Ok(88));
        assert_eq!(reserve(&d, 0, 1, 1), Err(IpcError::OutOfMemory));

        // The cursor lives as long as some processor still maps the region.
        d.call(Request::SharedRegionClearEntry { region: RegionId(0) }).unwrap();
        assert_eq!(reserve(&d, 0, 1, 1), Err(IpcError::OutOfMemory));
        d.call(Request::SharedRegionClearEntry { region: RegionId(0) }).unwrap();
        announce(512).unwrap();
        assert_eq!(reserve(&d, 0, 1, 1), Ok(0));
    }

    #[test]
    fn test_fail_on_targets_one_command() {
        let (broker, d) = broker();
        broker.fail_on(sharedregion::RESERVEMEMORY, IpcError::ChannelFailure);
        d.call(Request::SharedRegionSetEntry {
            region: RegionId(0),
            size: 64,
            owner: ProcessorId(0),
        })
        .unwrap();
        assert_eq!(reserve(&d, 0, 8, 8), Err(IpcError::ChannelFailure));
        assert_eq!(reserve(&d, 0, 8, 8), Ok(0));
    }
}
