//! Typed broker requests
//!
//! `Request` is what callers build; `CommandBlock` is what crosses the
//! channel. `encode` and `decode` are the only places that know how each
//! command lays its arguments out in the block.

use core::time::Duration;

use super::{gatemp, ipc, listmp, multiproc, sharedregion, CommandBlock, CommandId};
use crate::error::{IpcError, IpcResult, S_SUCCESS};
use crate::gate::ProtectionLevel;
use crate::multiproc::ProcessorId;
use crate::platform::Timeout;
use crate::sharedregion::{PortablePtr, RegionId};

/// Argument slot the broker writes a command's output into
pub const OUT_SLOT: usize = super::CMD_ARGS - 1;

/// Wire value of `Timeout::Forever`
const TIMEOUT_FOREVER: u64 = u64::MAX;

/// Broker-side handle for a gate or list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BrokerHandle(pub u32);

/// Core-control operations on a remote processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlCmd {
    Load = 0xBABE_0000,
    Start = 0xBABE_0001,
    Stop = 0xBABE_0002,
}

impl TryFrom<u64> for ControlCmd {
    type Error = IpcError;

    fn try_from(raw: u64) -> IpcResult<Self> {
        match raw {
            0xBABE_0000 => Ok(ControlCmd::Load),
            0xBABE_0001 => Ok(ControlCmd::Start),
            0xBABE_0002 => Ok(ControlCmd::Stop),
            _ => Err(IpcError::InvalidArgument),
        }
    }
}

/// A request addressed to the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    MultiProcSetup {
        num_processors: u16,
        local: ProcessorId,
    },
    MultiProcDestroy,
    MultiProcSetLocalId {
        id: ProcessorId,
    },
    SharedRegionSetEntry {
        region: RegionId,
        size: u64,
        owner: ProcessorId,
    },
    SharedRegionClearEntry {
        region: RegionId,
    },
    /// Carve `size` bytes out of `region`; the reply carries the offset
    SharedRegionReserve {
        region: RegionId,
        size: u64,
        align: u64,
    },
    /// `record` is `None` for a local gate brokered at process level
    GateCreate {
        protection: ProtectionLevel,
        record: Option<PortablePtr>,
    },
    GateOpenByAddr {
        record: PortablePtr,
    },
    GateClose {
        handle: BrokerHandle,
    },
    GateDelete {
        handle: BrokerHandle,
    },
    GateEnter {
        handle: BrokerHandle,
        timeout: Timeout,
    },
    GateLeave {
        handle: BrokerHandle,
        key: u64,
    },
    ListCreate {
        header: PortablePtr,
        gate: Option<PortablePtr>,
    },
    ListOpenByAddr {
        header: PortablePtr,
    },
    ListClose {
        handle: BrokerHandle,
    },
    ListDelete {
        handle: BrokerHandle,
    },
    IpcSetup {
        local: ProcessorId,
    },
    IpcDestroy,
    IpcControl {
        remote: ProcessorId,
        cmd: ControlCmd,
    },
}

fn ptr_bits(ptr: Option<PortablePtr>) -> u64 {
    ptr.map_or(PortablePtr::INVALID_BITS, PortablePtr::to_bits)
}

fn ptr_required(bits: u64) -> IpcResult<PortablePtr> {
    PortablePtr::from_bits(bits).ok_or(IpcError::InvalidArgument)
}

fn proc_id(raw: u64) -> IpcResult<ProcessorId> {
    u16::try_from(raw)
        .map(ProcessorId)
        .map_err(|_| IpcError::InvalidArgument)
}

fn handle(raw: u64) -> IpcResult<BrokerHandle> {
    u32::try_from(raw)
        .map(BrokerHandle)
        .map_err(|_| IpcError::InvalidArgument)
}

fn timeout_bits(timeout: Timeout) -> u64 {
    match timeout {
        Timeout::Forever => TIMEOUT_FOREVER,
        Timeout::After(d) => (d.as_millis() as u64).min(TIMEOUT_FOREVER - 1),
    }
}

fn timeout_from(raw: u64) -> Timeout {
    if raw == TIMEOUT_FOREVER {
        Timeout::Forever
    } else {
        Timeout::After(Duration::from_millis(raw))
    }
}

impl Request {
    /// Command id this request travels under
    pub fn command(&self) -> CommandId {
        match self {
            Request::MultiProcSetup { .. } => multiproc::SETUP,
            Request::MultiProcDestroy => multiproc::DESTROY,
            Request::MultiProcSetLocalId { .. } => multiproc::SETLOCALID,
            Request::SharedRegionSetEntry { .. } => sharedregion::SETENTRY,
            Request::SharedRegionClearEntry { .. } => sharedregion::CLEARENTRY,
            Request::SharedRegionReserve { .. } => sharedregion::RESERVEMEMORY,
            Request::GateCreate { .. } => gatemp::CREATE,
            Request::GateOpenByAddr { .. } => gatemp::OPENBYADDR,
            Request::GateClose { .. } => gatemp::CLOSE,
            Request::GateDelete { .. } => gatemp::DELETE,
            Request::GateEnter { .. } => gatemp::ENTER,
            Request::GateLeave { .. } => gatemp::LEAVE,
            Request::ListCreate { .. } => listmp::CREATE,
            Request::ListOpenByAddr { .. } => listmp::OPENBYADDR,
            Request::ListClose { .. } => listmp::CLOSE,
            Request::ListDelete { .. } => listmp::DELETE,
            Request::IpcSetup { .. } => ipc::SETUP,
            Request::IpcDestroy => ipc::DESTROY,
            Request::IpcControl { .. } => ipc::CONTROL,
        }
    }

    /// Marshal into a command block
    pub fn encode(&self) -> CommandBlock {
        let mut block = CommandBlock::new(self.command());
        let a = &mut block.args;
        match *self {
            Request::MultiProcSetup {
                num_processors,
                local,
            } => {
                a[0] = num_processors as u64;
                a[1] = local.0 as u64;
            }
            Request::MultiProcSetLocalId { id } => a[0] = id.0 as u64,
            Request::SharedRegionSetEntry {
                region,
                size,
                owner,
            } => {
                a[0] = region.0 as u64;
                a[1] = size;
                a[2] = owner.0 as u64;
            }
            Request::SharedRegionClearEntry { region } => a[0] = region.0 as u64,
            Request::SharedRegionReserve {
                region,
                size,
                align,
            } => {
                a[0] = region.0 as u64;
                a[1] = size;
                a[2] = align;
            }
            Request::GateCreate { protection, record } => {
                a[0] = protection as u64;
                a[1] = ptr_bits(record);
            }
            Request::GateOpenByAddr { record } => a[0] = record.to_bits(),
            Request::GateClose { handle }
            | Request::GateDelete { handle }
            | Request::ListClose { handle }
            | Request::ListDelete { handle } => a[0] = handle.0 as u64,
            Request::GateEnter { handle, timeout } => {
                a[0] = handle.0 as u64;
                a[1] = timeout_bits(timeout);
            }
            Request::GateLeave { handle, key } => {
                a[0] = handle.0 as u64;
                a[1] = key;
            }
            Request::ListCreate { header, gate } => {
                a[0] = header.to_bits();
                a[1] = ptr_bits(gate);
            }
            Request::ListOpenByAddr { header } => a[0] = header.to_bits(),
            Request::IpcSetup { local } => a[0] = local.0 as u64,
            Request::IpcControl { remote, cmd } => {
                a[0] = remote.0 as u64;
                a[1] = cmd as u64;
            }
            Request::MultiProcDestroy | Request::IpcDestroy => {}
        }
        block
    }

    /// Unmarshal a command block on the broker side
    ///
    /// Fails `InvalidArgument` for ids outside the implemented commands and
    /// for malformed argument words.
    pub fn decode(block: &CommandBlock) -> IpcResult<Self> {
        let a = &block.args;
        let req = match CommandId(block.cmd_id) {
            multiproc::SETUP => Request::MultiProcSetup {
                num_processors: u16::try_from(a[0]).map_err(|_| IpcError::InvalidArgument)?,
                local: proc_id(a[1])?,
            },
            multiproc::DESTROY => Request::MultiProcDestroy,
            multiproc::SETLOCALID => Request::MultiProcSetLocalId { id: proc_id(a[0])? },
            sharedregion::SETENTRY => Request::SharedRegionSetEntry {
                region: RegionId(u16::try_from(a[0]).map_err(|_| IpcError::InvalidArgument)?),
                size: a[1],
                owner: proc_id(a[2])?,
            },
            sharedregion::CLEARENTRY => Request::SharedRegionClearEntry {
                region: RegionId(u16::try_from(a[0]).map_err(|_| IpcError::InvalidArgument)?),
            },
            sharedregion::RESERVEMEMORY => Request::SharedRegionReserve {
                region: RegionId(u16::try_from(a[0]).map_err(|_| IpcError::InvalidArgument)?),
                size: a[1],
                align: a[2],
            },
            gatemp::CREATE => Request::GateCreate {
                protection: ProtectionLevel::try_from(
                    u32::try_from(a[0]).map_err(|_| IpcError::InvalidArgument)?,
                )?,
                record: PortablePtr::from_bits(a[1]),
            },
            gatemp::OPENBYADDR => Request::GateOpenByAddr {
                record: ptr_required(a[0])?,
            },
            gatemp::CLOSE => Request::GateClose { handle: handle(a[0])? },
            gatemp::DELETE => Request::GateDelete { handle: handle(a[0])? },
            gatemp::ENTER => Request::GateEnter {
                handle: handle(a[0])?,
                timeout: timeout_from(a[1]),
            },
            gatemp::LEAVE => Request::GateLeave {
                handle: handle(a[0])?,
                key: a[1],
            },
            listmp::CREATE => Request::ListCreate {
                header: ptr_required(a[0])?,
                gate: PortablePtr::from_bits(a[1]),
            },
            listmp::OPENBYADDR => Request::ListOpenByAddr {
                header: ptr_required(a[0])?,
            },
            listmp::CLOSE => Request::ListClose { handle: handle(a[0])? },
            listmp::DELETE => Request::ListDelete { handle: handle(a[0])? },
            ipc::SETUP => Request::IpcSetup { local: proc_id(a[0])? },
            ipc::DESTROY => Request::IpcDestroy,
            ipc::CONTROL => Request::IpcControl {
                remote: proc_id(a[0])?,
                cmd: ControlCmd::try_from(a[1])?,
            },
            _ => return Err(IpcError::InvalidArgument),
        };
        Ok(req)
    }
}

/// A successful broker reply
#[derive(Debug, Clone, Copy)]
pub struct Reply {
    block: CommandBlock,
}

impl Reply {
    /// Accept `block` only if its status reports success
    pub fn from_block(block: CommandBlock) -> IpcResult<Self> {
        IpcError::from_status(block.api_status)?;
        Ok(Self { block })
    }

    /// Raw output word
    pub fn value(&self) -> u64 {
        self.block.args[OUT_SLOT]
    }

    /// Output interpreted as a broker handle
    pub fn handle(&self) -> IpcResult<BrokerHandle> {
        handle(self.value()).map_err(|_| IpcError::ChannelFailure)
    }
}

impl CommandBlock {
    /// Broker side: complete the request successfully with `output`
    pub fn complete(&mut self, output: u64) {
        self.args[OUT_SLOT] = output;
        self.api_status = S_SUCCESS;
    }

    /// Broker side: fail the request, leaving outputs untouched
    pub fn fail(&mut self, err: IpcError) {
        self.api_status = err.status();
    }
}
