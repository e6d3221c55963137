//! Local gates
//!
//! Interrupt level masks local interrupts and spins; task level yields to
//! the scheduler between attempts; process level asks the broker, since
//! only it can hold a lock on behalf of several processes.

use alloc::sync::Arc;
use core::fmt;

use super::{GateProvider, ProtectionLevel};
use crate::command::{BrokerHandle, Dispatcher, Request};
use crate::context::Context;
use crate::error::{IpcError, IpcResult};
use crate::lock::{SimpleLock, WaitPolicy};
use crate::platform::{Deadline, Platform, Timeout};
use crate::sharedregion::PortablePtr;

enum Backing {
    Interrupt(SimpleLock),
    Task(SimpleLock),
    Process(Dispatcher, BrokerHandle),
}

/// A gate visible only to the processor that created it
pub struct LocalGate {
    backing: Backing,
    platform: Arc<dyn Platform>,
}

impl fmt::Debug for LocalGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalGate")
            .field("protection", &self.protection())
            .field("held", &self.is_held())
            .finish()
    }
}

impl LocalGate {
    pub fn create(ctx: &Context, protection: ProtectionLevel) -> IpcResult<Self> {
        let backing = match protection {
            ProtectionLevel::Interrupt => Backing::Interrupt(SimpleLock::new()),
            ProtectionLevel::Task => Backing::Task(SimpleLock::new()),
            ProtectionLevel::Process => {
                let dispatcher = ctx.dispatcher().clone();
                let handle = dispatcher
                    .call(Request::GateCreate {
                        protection,
                        record: None,
                    })?
                    .handle()?;
                Backing::Process(dispatcher, handle)
            }
            ProtectionLevel::System => return Err(IpcError::InvalidArgument),
        };
        Ok(Self {
            backing,
            platform: ctx.platform_arc(),
        })
    }

    /// Local lock with no broker involvement, for nesting inside shared gates
    pub(crate) fn nested(
        platform: Arc<dyn Platform>,
        protection: ProtectionLevel,
    ) -> IpcResult<Self> {
        let backing = match protection {
            ProtectionLevel::Interrupt => Backing::Interrupt(SimpleLock::new()),
            ProtectionLevel::Task => Backing::Task(SimpleLock::new()),
            _ => return Err(IpcError::InvalidArgument),
        };
        Ok(Self { backing, platform })
    }

    pub(crate) fn enter_until(&self, deadline: &Deadline) -> IpcResult<usize> {
        let platform = &*self.platform;
        match &self.backing {
            Backing::Interrupt(lock) => {
                let key = platform.disable_interrupts();
                if !lock.lock_until(platform, WaitPolicy::Spin, deadline) {
                    platform.restore_interrupts(key);
                    return Err(IpcError::Timeout);
                }
                Ok(key)
            }
            Backing::Task(lock) => {
                if !lock.lock_until(platform, WaitPolicy::Yield, deadline) {
                    return Err(IpcError::Timeout);
                }
                Ok(0)
            }
            Backing::Process(..) => Err(IpcError::InvalidState),
        }
    }
}

impl GateProvider for LocalGate {
    fn enter(&self, timeout: Timeout) -> IpcResult<usize> {
        if let Backing::Process(dispatcher, handle) = &self.backing {
            let reply = dispatcher.call(Request::GateEnter {
                handle: *handle,
                timeout,
            })?;
            return Ok(reply.value() as usize);
        }
        let deadline = Deadline::start(&*self.platform, timeout);
        self.enter_until(&deadline)
    }

    fn leave(&self, key: usize) -> IpcResult<()> {
        match &self.backing {
            Backing::Interrupt(lock) => {
                lock.unlock();
                self.platform.restore_interrupts(key);
            }
            Backing::Task(lock) => lock.unlock(),
            Backing::Process(dispatcher, handle) => {
                dispatcher.call(Request::GateLeave {
                    handle: *handle,
                    key: key as u64,
                })?;
            }
        }
        Ok(())
    }

    fn protection(&self) -> ProtectionLevel {
        match self.backing {
            Backing::Interrupt(_) => ProtectionLevel::Interrupt,
            Backing::Task(_) => ProtectionLevel::Task,
            Backing::Process(..) => ProtectionLevel::Process,
        }
    }

    fn shared_addr(&self) -> Option<PortablePtr> {
        None
    }

    fn is_held(&self) -> bool {
        match &self.backing {
            Backing::Interrupt(lock) | Backing::Task(lock) => lock.is_locked(),
            // The broker refuses to delete a held process lock.
            Backing::Process(..) => false,
        }
    }

    fn delete(&self) -> IpcResult<()> {
        if let Backing::Process(dispatcher, handle) = &self.backing {
            dispatcher.call(Request::GateDelete { handle: *handle })?;
        }
        Ok(())
    }

    fn close(&self) -> IpcResult<()> {
        Err(IpcError::InvalidState)
    }
}
