//! Processor Registry
//!
//! Maps symbolic processor names onto the dense id space used everywhere
//! else in the layer and records which id is "self". The table is small
//! (at most [`MAX_PROCESSORS`] entries) and effectively immutable between
//! `setup` and `destroy`, so lookups are plain linear scans.
//!
//! Setup and destroy are not internally synchronized; the owning
//! [`Context`](crate::Context) serializes them.

use core::fmt;

use heapless::String;

use crate::error::{IpcError, IpcResult};

/// Maximum number of processors in the system
pub const MAX_PROCESSORS: usize = 4;

/// Maximum processor name length in bytes
pub const MAX_NAME_LEN: usize = 32;

/// Processor name storage
pub type ProcName = String<MAX_NAME_LEN>;

/// Dense processor identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessorId(pub u16);

impl ProcessorId {
    /// Invalid processor id
    pub const INVALID: Self = Self(0xFFFF);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc{}", self.0)
    }
}

/// A registered processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorDescriptor {
    pub id: ProcessorId,
    pub name: ProcName,
}

/// Registry configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiProcConfig {
    /// Number of processors in the system
    pub num_processors: u16,
    /// Names indexed by processor id; only the first `num_processors` are used
    pub names: [ProcName; MAX_PROCESSORS],
    /// Local processor id, or `ProcessorId::INVALID` to set it later
    pub id: ProcessorId,
}

impl MultiProcConfig {
    /// Build a configuration from a name list and the local index
    pub fn with_names(names: &[&str], id: u16) -> IpcResult<Self> {
        if names.len() > MAX_PROCESSORS {
            return Err(IpcError::InvalidArgument);
        }
        let mut cfg = get_default_config();
        for (i, name) in names.iter().enumerate() {
            cfg.set_name(i, name)?;
        }
        cfg.num_processors = names.len() as u16;
        cfg.id = ProcessorId(id);
        Ok(cfg)
    }

    /// Set the name of processor `index`
    pub fn set_name(&mut self, index: usize, name: &str) -> IpcResult<()> {
        let slot = self.names.get_mut(index).ok_or(IpcError::InvalidArgument)?;
        let mut s = ProcName::new();
        s.push_str(name).map_err(|_| IpcError::InvalidArgument)?;
        *slot = s;
        Ok(())
    }

    fn validate(&self) -> IpcResult<()> {
        let n = self.num_processors as usize;
        if n == 0 || n > MAX_PROCESSORS {
            return Err(IpcError::InvalidArgument);
        }
        if self.id.is_valid() && self.id.index() >= n {
            return Err(IpcError::InvalidArgument);
        }
        for i in 0..n {
            if self.names[i].is_empty() {
                return Err(IpcError::InvalidArgument);
            }
            if self.names[i + 1..n].contains(&self.names[i]) {
                return Err(IpcError::InvalidArgument);
            }
        }
        Ok(())
    }
}

/// Get the zero-processor configuration template
pub fn get_default_config() -> MultiProcConfig {
    MultiProcConfig {
        num_processors: 0,
        names: Default::default(),
        id: ProcessorId::INVALID,
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug)]
struct RegistryState {
    procs: heapless::Vec<ProcessorDescriptor, MAX_PROCESSORS>,
    local: ProcessorId,
}

/// The processor registry
#[derive(Debug, Default)]
pub struct Registry {
    state: Option<RegistryState>,
}

impl Registry {
    /// Create a registry that has not been set up
    pub const fn new() -> Self {
        Self { state: None }
    }

    /// Validate `config` and install it
    pub fn setup(&mut self, config: &MultiProcConfig) -> IpcResult<()> {
        if self.state.is_some() {
            return Err(IpcError::AlreadyInitialized);
        }
        config.validate()?;

        let mut procs = heapless::Vec::new();
        for i in 0..config.num_processors {
            let desc = ProcessorDescriptor {
                id: ProcessorId(i),
                name: config.names[i as usize].clone(),
            };
            procs.push(desc).map_err(|_| IpcError::InvalidArgument)?;
        }

        log::debug!(
            "multiproc: setup {} processors, self {}",
            config.num_processors,
            config.id
        );
        self.state = Some(RegistryState {
            procs,
            local: config.id,
        });
        Ok(())
    }

    /// Tear the registry down
    pub fn destroy(&mut self) -> IpcResult<()> {
        self.state.take().ok_or(IpcError::InvalidState)?;
        Ok(())
    }

    pub fn is_setup(&self) -> bool {
        self.state.is_some()
    }

    fn state(&self) -> IpcResult<&RegistryState> {
        self.state.as_ref().ok_or(IpcError::InvalidState)
    }

    /// Set the local id if setup left it unassigned
    ///
    /// The local id is immutable once assigned.
    pub fn set_local_id(&mut self, id: ProcessorId) -> IpcResult<()> {
        let state = self.state.as_mut().ok_or(IpcError::InvalidState)?;
        if state.local.is_valid() || id.index() >= state.procs.len() {
            return Err(IpcError::InvalidArgument);
        }
        state.local = id;
        Ok(())
    }

    /// The local processor id
    ///
    /// Returns `ProcessorId::INVALID` before setup.
    pub fn self_id(&self) -> ProcessorId {
        self.state
            .as_ref()
            .map_or(ProcessorId::INVALID, |s| s.local)
    }

    /// Number of configured processors (0 before setup)
    pub fn num_processors(&self) -> u16 {
        self.state.as_ref().map_or(0, |s| s.procs.len() as u16)
    }

    /// Look up a processor id by name
    pub fn id_from_name(&self, name: &str) -> IpcResult<ProcessorId> {
        self.state()?
            .procs
            .iter()
            .find(|p| p.name.as_str() == name)
            .map(|p| p.id)
            .ok_or(IpcError::NotFound)
    }

    /// Look up a processor name by id
    pub fn name_from_id(&self, id: ProcessorId) -> IpcResult<&str> {
        self.state()?
            .procs
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.name.as_str())
            .ok_or(IpcError::NotFound)
    }

    /// True iff `id` names a configured processor other than self
    pub fn is_valid_remote(&self, id: ProcessorId) -> bool {
        match &self.state {
            Some(s) => id != s.local && id.index() < s.procs.len(),
            None => false,
        }
    }

    /// Iterate over the configured processors
    pub fn processors(&self) -> impl Iterator<Item = &ProcessorDescriptor> {
        self.state.iter().flat_map(|s| s.procs.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config() -> MultiProcConfig {
        MultiProcConfig::with_names(&["MPU", "Tesla", "SysM3", "AppM3"], 0).unwrap()
    }

    #[test]
    fn test_default_config_is_empty() {
        let cfg = get_default_config();
        assert_eq!(cfg.num_processors, 0);
        assert_eq!(cfg.id, ProcessorId::INVALID);

        let mut reg = Registry::new();
        assert_eq!(reg.setup(&cfg), Err(IpcError::InvalidArgument));
    }

    #[test]
    fn test_setup_and_lookup() {
        let mut reg = Registry::new();
        reg.setup(&config()).unwrap();

        assert_eq!(reg.self_id(), ProcessorId(0));
        assert_eq!(reg.num_processors(), 4);
        assert_eq!(reg.id_from_name("SysM3"), Ok(ProcessorId(2)));
        assert_eq!(reg.name_from_id(ProcessorId(1)), Ok("Tesla"));
        assert_eq!(reg.id_from_name("DSP2"), Err(IpcError::NotFound));
        assert_eq!(reg.name_from_id(ProcessorId(4)), Err(IpcError::NotFound));
    }

    #[test]
    fn test_setup_twice_fails() {
        let mut reg = Registry::new();
        reg.setup(&config()).unwrap();
        assert_eq!(reg.setup(&config()), Err(IpcError::AlreadyInitialized));

        reg.destroy().unwrap();
        assert_eq!(reg.destroy(), Err(IpcError::InvalidState));
        reg.setup(&config()).unwrap();
    }

    #[test]
    fn test_rejects_malformed_config() {
        let mut reg = Registry::new();

        let dup = MultiProcConfig::with_names(&["MPU", "MPU"], 0).unwrap();
        assert_eq!(reg.setup(&dup), Err(IpcError::InvalidArgument));

        let bad_self = MultiProcConfig::with_names(&["MPU", "DSP"], 2).unwrap();
        assert_eq!(reg.setup(&bad_self), Err(IpcError::InvalidArgument));

        let too_many = MultiProcConfig::with_names(&["a", "b", "c", "d", "e"], 0);
        assert_eq!(too_many, Err(IpcError::InvalidArgument));

        let long = "x".repeat(MAX_NAME_LEN + 1);
        let mut cfg = get_default_config();
        assert_eq!(cfg.set_name(0, &long), Err(IpcError::InvalidArgument));

        assert!(!reg.is_setup());
    }

    #[test]
    fn test_is_valid_remote() {
        let mut reg = Registry::new();
        assert!(!reg.is_valid_remote(ProcessorId(1)));

        reg.setup(&MultiProcConfig::with_names(&["MPU", "DSP", "M3"], 1).unwrap())
            .unwrap();
        assert!(reg.is_valid_remote(ProcessorId(0)));
        assert!(!reg.is_valid_remote(ProcessorId(1)));
        assert!(reg.is_valid_remote(ProcessorId(2)));
        assert!(!reg.is_valid_remote(ProcessorId(3)));
    }

    #[test]
    fn test_local_id_set_once() {
        let mut reg = Registry::new();
        let cfg = MultiProcConfig::with_names(&["MPU", "DSP"], 0xFFFF).unwrap();
        reg.setup(&cfg).unwrap();
        assert_eq!(reg.self_id(), ProcessorId::INVALID);

        assert_eq!(reg.set_local_id(ProcessorId(2)), Err(IpcError::InvalidArgument));
        reg.set_local_id(ProcessorId(1)).unwrap();
        assert_eq!(reg.self_id(), ProcessorId(1));
        assert_eq!(reg.set_local_id(ProcessorId(0)), Err(IpcError::InvalidArgument));
    }

    proptest! {
        #[test]
        fn prop_name_id_bijection(
            names in proptest::collection::hash_set("[A-Za-z][A-Za-z0-9]{0,31}", 1..=4),
            pick in 0usize..4,
        ) {
            let names: std::vec::Vec<std::string::String> = names.into_iter().collect();
            let refs: std::vec::Vec<&str> = names.iter().map(|s| s.as_str()).collect();
            let local = (pick % refs.len()) as u16;

            let mut reg = Registry::new();
            reg.setup(&MultiProcConfig::with_names(&refs, local).unwrap()).unwrap();

            prop_assert_eq!(reg.self_id(), ProcessorId(local));
            for i in 0..refs.len() as u16 {
                let name = reg.name_from_id(ProcessorId(i)).unwrap();
                prop_assert_eq!(reg.id_from_name(name), Ok(ProcessorId(i)));
            }
        }
    }
}
