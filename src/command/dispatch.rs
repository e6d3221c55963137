//! Synchronous broker round trips

use alloc::sync::Arc;
use core::fmt;

use thiserror::Error;

use super::{CommandBlock, Reply, Request};
use crate::error::{IpcError, IpcResult};
use crate::platform::Timeout;

/// Transport-level failures, before the broker ever saw the request
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("broker unreachable")]
    Offline,

    #[error("broker did not reply in time")]
    TimedOut,

    #[error("transport error {0}")]
    Transport(i32),
}

impl From<ChannelError> for IpcError {
    fn from(_: ChannelError) -> Self {
        IpcError::ChannelFailure
    }
}

/// The one logical channel a process keeps open to the broker
///
/// `transact` sends the block, blocks the calling thread until the broker
/// has written its reply into the same block, and returns. Outputs and
/// `api_status` are only read after `Ok(())`.
pub trait Channel: Send + Sync {
    fn transact(&self, block: &mut CommandBlock, timeout: Timeout) -> Result<(), ChannelError>;
}

/// Turns typed requests into blocking broker calls
#[derive(Clone)]
pub struct Dispatcher {
    channel: Arc<dyn Channel>,
    timeout: Timeout,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(channel: Arc<dyn Channel>, timeout: Timeout) -> Self {
        Self { channel, timeout }
    }

    /// Send `req` and wait for the reply
    ///
    /// Transport failures surface as `ChannelFailure`; a broker-side
    /// failure surfaces as the error its status encodes. Neither is retried.
    pub fn call(&self, req: Request) -> IpcResult<Reply> {
        let cmd = req.command();
        let mut block = req.encode();

        log::trace!("dispatch: {} args={:x?}", cmd, block.args);
        if let Err(e) = self.channel.transact(&mut block, self.timeout) {
            log::warn!("dispatch: {} failed in transport: {}", cmd, e);
            return Err(e.into());
        }
        if block.cmd_id != cmd.0 {
            log::warn!("dispatch: reply for {} carried id {}", cmd, block.cmd_id);
            return Err(IpcError::ChannelFailure);
        }

        Reply::from_block(block).map_err(|e| {
            log::warn!("dispatch: broker rejected {}: {}", cmd, e);
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::request::OUT_SLOT;
    use crate::multiproc::ProcessorId;
    use spin::Mutex;

    /// Records the last block and answers with a fixed status
    struct Scripted {
        status: i32,
        seen: Mutex<Option<CommandBlock>>,
    }

    impl Channel for Scripted {
        fn transact(&self, block: &mut CommandBlock, _: Timeout) -> Result<(), ChannelError> {
            *self.seen.lock() = Some(*block);
            if self.status == i32::MIN {
                return Err(ChannelError::Offline);
            }
            block.args[OUT_SLOT] = 5;
            block.api_status = self.status;
            Ok(())
        }
    }

    fn dispatcher(status: i32) -> (Arc<Scripted>, Dispatcher) {
        let chan = Arc::new(Scripted {
            status,
            seen: Mutex::new(None),
        });
        let d = Dispatcher::new(chan.clone(), Timeout::Forever);
        (chan, d)
    }

    #[test]
    fn test_call_success() {
        let (chan, d) = dispatcher(0);
        let reply = d
            .call(Request::IpcSetup {
                local: ProcessorId(0),
            })
            .unwrap();
        assert_eq!(reply.value(), 5);
        assert_eq!(chan.seen.lock().map(|b| b.cmd_id), Some(130));
    }

    #[test]
    fn test_broker_status_propagates() {
        let (_, d) = dispatcher(IpcError::InUse.status());
        assert_eq!(d.call(Request::IpcDestroy).err(), Some(IpcError::InUse));
    }

    #[test]
    fn test_transport_failure() {
        let (_, d) = dispatcher(i32::MIN);
        assert_eq!(
            d.call(Request::IpcDestroy).err(),
            Some(IpcError::ChannelFailure)
        );
    }
}
