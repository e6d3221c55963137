//! Command Dispatcher - broker command table and transport
//!
//! Every module that talks to the broker owns a contiguous range of
//! command ids. A command id is `base + offset`; the ranges are part of
//! the wire contract with the broker and are checked for overlap at
//! compile time.
//!
//! ## Layout
//!
//! - Ranges 2-5: processor registry
//! - Ranges 10-24: name resolution
//! - Ranges 50-62: shared regions
//! - Ranges 70-82: gates
//! - Ranges 90-108: shared lists
//! - Ranges 130-134: core control
//!
//! The remaining ranges belong to services this layer does not implement
//! but must never collide with.

mod dispatch;
pub mod loopback;
mod request;

use core::fmt;

use static_assertions::const_assert;

pub use dispatch::{Channel, ChannelError, Dispatcher};
pub use loopback::LoopbackBroker;
pub use request::{BrokerHandle, ControlCmd, Reply, Request};

// ============================================================================
// Module Ranges
// ============================================================================

/// First command id handed out to any module
pub const IPC_IOC_BASE: u32 = 2;

/// Modules that own a command range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Module {
    MultiProc,
    NameServer,
    HeapBufMp,
    SharedRegion,
    GateMp,
    ListMp,
    MessageQ,
    Ipc,
    SysMemMgr,
    HeapMemMp,
    Notify,
}

/// A module's slice of the command id space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleRange {
    pub module: Module,
    /// Prefix used for generated command names
    pub name: &'static str,
    pub base: u32,
    /// Command names, in offset order
    pub commands: &'static [&'static str],
}

impl ModuleRange {
    pub const fn new(
        module: Module,
        name: &'static str,
        base: u32,
        commands: &'static [&'static str],
    ) -> Self {
        Self {
            module,
            name,
            base,
            commands,
        }
    }

    /// Number of commands in the range
    pub const fn count(&self) -> u32 {
        self.commands.len() as u32
    }

    /// Last id in the range (inclusive)
    pub const fn end(&self) -> u32 {
        self.base + self.count() - 1
    }

    pub const fn contains(&self, id: u32) -> bool {
        id >= self.base && id <= self.end()
    }

    /// Command id for `offset`; fails to compile when used in a const
    /// context with an offset outside the range
    pub const fn cmd(&self, offset: u32) -> CommandId {
        assert!(offset < self.count(), "command offset outside module range");
        CommandId(self.base + offset)
    }
}

pub const MULTIPROC: ModuleRange = ModuleRange::new(
    Module::MultiProc,
    "MULTIPROC",
    IPC_IOC_BASE,
    &["SETUP", "DESTROY", "GETCONFIG", "SETLOCALID"],
);

pub const NAMESERVER: ModuleRange = ModuleRange::new(
    Module::NameServer,
    "NAMESERVER",
    10,
    &[
        "SETUP", "DESTROY", "PARAMS_INIT", "CREATE", "DELETE", "ADD", "ADDUINT32", "GET",
        "GETLOCAL", "MATCH", "REMOVE", "REMOVEENTRY", "GETHANDLE", "ISREGISTERED", "GETCONFIG",
    ],
);

pub const HEAPBUFMP: ModuleRange = ModuleRange::new(
    Module::HeapBufMp,
    "HEAPBUFMP",
    30,
    &[
        "GETCONFIG", "SETUP", "DESTROY", "PARAMS_INIT", "CREATE", "DELETE", "OPEN",
        "OPENBYADDR", "CLOSE", "ALLOC", "FREE", "SHAREDMEMREQ", "GETSTATS",
        "GETEXTENDEDSTATS",
    ],
);

pub const SHAREDREGION: ModuleRange = ModuleRange::new(
    Module::SharedRegion,
    "SHAREDREGION",
    50,
    &[
        "GETCONFIG", "SETUP", "DESTROY", "START", "STOP", "ATTACH", "DETACH", "GETHEAP",
        "CLEARENTRY", "SETENTRY", "RESERVEMEMORY", "CLEARRESERVEDMEMORY", "GETREGIONINFO",
    ],
);

pub const GATEMP: ModuleRange = ModuleRange::new(
    Module::GateMp,
    "GATEMP",
    70,
    &[
        "GETCONFIG", "SETUP", "DESTROY", "PARAMS_INIT", "CREATE", "DELETE", "OPEN", "CLOSE",
        "ENTER", "LEAVE", "SHAREDMEMREQ", "OPENBYADDR", "GETDEFAULTREMOTE",
    ],
);

pub const LISTMP: ModuleRange = ModuleRange::new(
    Module::ListMp,
    "LISTMP",
    90,
    &[
        "GETCONFIG", "SETUP", "DESTROY", "PARAMS_INIT", "CREATE", "DELETE", "OPEN", "CLOSE",
        "ISEMPTY", "GETHEAD", "GETTAIL", "PUTHEAD", "PUTTAIL", "INSERT", "REMOVE", "NEXT",
        "PREV", "SHAREDMEMREQ", "OPENBYADDR",
    ],
);

pub const MESSAGEQ: ModuleRange = ModuleRange::new(
    Module::MessageQ,
    "MESSAGEQ",
    110,
    &[
        "GETCONFIG", "SETUP", "DESTROY", "PARAMS_INIT", "CREATE", "DELETE", "OPEN", "CLOSE",
        "COUNT", "ALLOC", "FREE", "PUT", "REGISTERHEAP", "UNREGISTERHEAP", "ATTACH", "DETACH",
        "GET", "SHAREDMEMREQ",
    ],
);

pub const IPC: ModuleRange = ModuleRange::new(
    Module::Ipc,
    "IPC",
    130,
    &["SETUP", "DESTROY", "CONTROL", "READCONFIG", "WRITECONFIG"],
);

pub const SYSMEMMGR: ModuleRange = ModuleRange::new(
    Module::SysMemMgr,
    "SYSMEMMGR",
    140,
    &["GETCONFIG", "SETUP", "DESTROY", "ALLOC", "FREE", "TRANSLATE"],
);

pub const HEAPMEMMP: ModuleRange = ModuleRange::new(
    Module::HeapMemMp,
    "HEAPMEMMP",
    150,
    &[
        "GETCONFIG", "SETUP", "DESTROY", "PARAMS_INIT", "CREATE", "DELETE", "OPEN",
        "OPENBYADDR", "CLOSE", "ALLOC", "FREE", "SHAREDMEMREQ", "GETSTATS",
        "GETEXTENDEDSTATS", "RESTORE",
    ],
);

pub const NOTIFY: ModuleRange = ModuleRange::new(
    Module::Notify,
    "NOTIFY",
    170,
    &[
        "GETCONFIG", "SETUP", "DESTROY", "REGISTEREVENT", "UNREGISTEREVENT", "SENDEVENT",
        "DISABLE", "RESTORE", "DISABLEEVENT", "ENABLEEVENT", "ATTACH", "DETACH",
        "THREADATTACH", "THREADDETACH", "ISREGISTERED", "SHAREDMEMREQ",
        "REGISTEREVENTSINGLE", "UNREGISTEREVENTSINGLE",
    ],
);

/// Every module range sharing the broker channel
pub const COMMAND_RANGES: [ModuleRange; 11] = [
    MULTIPROC,
    NAMESERVER,
    HEAPBUFMP,
    SHAREDREGION,
    GATEMP,
    LISTMP,
    MESSAGEQ,
    IPC,
    SYSMEMMGR,
    HEAPMEMMP,
    NOTIFY,
];

/// True iff every range is non-empty and no two ranges share an id
pub const fn ranges_disjoint(ranges: &[ModuleRange]) -> bool {
    let mut i = 0;
    while i < ranges.len() {
        if ranges[i].count() == 0 {
            return false;
        }
        i += 1;
    }
    let mut i = 0;
    while i < ranges.len() {
        let mut j = i + 1;
        while j < ranges.len() {
            let (a, b) = (&ranges[i], &ranges[j]);
            if a.base <= b.end() && b.base <= a.end() {
                return false;
            }
            j += 1;
        }
        i += 1;
    }
    true
}

const_assert!(ranges_disjoint(&COMMAND_RANGES));

/// Find the range owning `id`
pub fn module_of(id: u32) -> Option<&'static ModuleRange> {
    COMMAND_RANGES.iter().find(|r| r.contains(id))
}

// ============================================================================
// Command Ids
// ============================================================================

/// A broker command id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandId(pub u32);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match module_of(self.0) {
            Some(r) => write!(f, "{}_{}", r.name, r.commands[(self.0 - r.base) as usize]),
            None => write!(f, "CMD_{}", self.0),
        }
    }
}

pub mod multiproc {
    use super::{CommandId, MULTIPROC};

    pub const SETUP: CommandId = MULTIPROC.cmd(0);
    pub const DESTROY: CommandId = MULTIPROC.cmd(1);
    pub const GETCONFIG: CommandId = MULTIPROC.cmd(2);
    pub const SETLOCALID: CommandId = MULTIPROC.cmd(3);
}

pub mod sharedregion {
    use super::{CommandId, SHAREDREGION};

    pub const CLEARENTRY: CommandId = SHAREDREGION.cmd(8);
    pub const SETENTRY: CommandId = SHAREDREGION.cmd(9);
    pub const RESERVEMEMORY: CommandId = SHAREDREGION.cmd(10);
}

pub mod gatemp {
    use super::{CommandId, GATEMP};

    pub const CREATE: CommandId = GATEMP.cmd(4);
    pub const DELETE: CommandId = GATEMP.cmd(5);
    pub const CLOSE: CommandId = GATEMP.cmd(7);
    pub const ENTER: CommandId = GATEMP.cmd(8);
    pub const LEAVE: CommandId = GATEMP.cmd(9);
    pub const OPENBYADDR: CommandId = GATEMP.cmd(11);
}

pub mod listmp {
    use super::{CommandId, LISTMP};

    pub const CREATE: CommandId = LISTMP.cmd(4);
    pub const DELETE: CommandId = LISTMP.cmd(5);
    pub const CLOSE: CommandId = LISTMP.cmd(7);
    pub const OPENBYADDR: CommandId = LISTMP.cmd(18);
}

pub mod ipc {
    use super::{CommandId, IPC};

    pub const SETUP: CommandId = IPC.cmd(0);
    pub const DESTROY: CommandId = IPC.cmd(1);
    pub const CONTROL: CommandId = IPC.cmd(2);
}

// ============================================================================
// Command Block
// ============================================================================

/// Number of argument words in a command block
pub const CMD_ARGS: usize = 6;

/// The fixed-layout block exchanged with the broker
///
/// The broker reads `cmd_id` and `args`, performs the request, and writes
/// back `api_status` plus any output words. Outputs are meaningful only
/// when `api_status` is non-negative.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBlock {
    pub cmd_id: u32,
    pub api_status: i32,
    pub args: [u64; CMD_ARGS],
}

const_assert!(core::mem::size_of::<CommandBlock>() == 8 + 8 * CMD_ARGS);

impl CommandBlock {
    pub const fn new(cmd: CommandId) -> Self {
        Self {
            cmd_id: cmd.0,
            api_status: crate::error::E_FAIL,
            args: [0; CMD_ARGS],
        }
    }
}
