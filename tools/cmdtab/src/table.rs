//! Command table model
//!
//! A serializable snapshot of the module ranges, validated for overlap at
//! runtime so hand-built tables get the same guarantee the library checks
//! at compile time.

use serde::Serialize;
use sha2::{Digest, Sha256};

use mp_ipc::command::{ModuleRange, COMMAND_RANGES, IPC_IOC_BASE};

use crate::error::CmdtabError;

/// One command id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandEntry {
    /// Full name, e.g. `LISTMP_CREATE`
    pub name: String,
    pub id: u32,
}

/// One module's range
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleEntry {
    pub name: String,
    pub base: u32,
    pub end: u32,
    pub commands: Vec<CommandEntry>,
}

/// The whole table, in id order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandTable {
    pub ioc_base: u32,
    pub modules: Vec<ModuleEntry>,
}

impl CommandTable {
    /// Table built from the ranges compiled into `mp_ipc`
    pub fn builtin() -> Result<Self, CmdtabError> {
        Self::from_ranges(&COMMAND_RANGES)
    }

    pub fn from_ranges(ranges: &[ModuleRange]) -> Result<Self, CmdtabError> {
        let mut modules = Vec::with_capacity(ranges.len());
        for r in ranges {
            if r.commands.is_empty() {
                return Err(CmdtabError::EmptyModule(r.name.to_string()));
            }
            let commands = r
                .commands
                .iter()
                .enumerate()
                .map(|(i, cmd)| CommandEntry {
                    name: format!("{}_{}", r.name, cmd),
                    id: r.base + i as u32,
                })
                .collect();
            modules.push(ModuleEntry {
                name: r.name.to_string(),
                base: r.base,
                end: r.end(),
                commands,
            });
        }
        modules.sort_by_key(|m| m.base);

        for pair in modules.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if b.base <= a.end {
                return Err(CmdtabError::Overlap {
                    first: a.name.clone(),
                    first_base: a.base,
                    first_end: a.end,
                    second: b.name.clone(),
                    second_base: b.base,
                    second_end: b.end,
                });
            }
        }

        Ok(Self {
            ioc_base: IPC_IOC_BASE,
            modules,
        })
    }

    /// Line-oriented form hashed by [`fingerprint`](Self::fingerprint)
    ///
    /// Only names and ids take part; formatting of the rendered outputs
    /// may change without breaking compatibility.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        for m in &self.modules {
            out.push_str(&format!("module {} {} {}\n", m.name, m.base, m.end));
            for c in &m.commands {
                out.push_str(&format!("  {} {}\n", c.name, c.id));
            }
        }
        out
    }

    /// SHA-256 of the canonical form, hex encoded
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Fail unless the table hashes to `expected`
    pub fn verify(&self, expected: &str) -> Result<(), CmdtabError> {
        let actual = self.fingerprint();
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(CmdtabError::FingerprintMismatch {
                expected: expected.trim().to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Look up a command by full name
    pub fn find(&self, name: &str) -> Option<&CommandEntry> {
        self.modules
            .iter()
            .flat_map(|m| m.commands.iter())
            .find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mp_ipc::command::{listmp, Module, GATEMP, LISTMP};

    #[test]
    fn test_builtin_ids_match_library() {
        let table = CommandTable::builtin().unwrap();
        assert_eq!(table.find("LISTMP_CREATE").unwrap().id, listmp::CREATE.0);
        assert_eq!(
            table.find("LISTMP_OPENBYADDR").unwrap().id,
            listmp::OPENBYADDR.0
        );
        assert_eq!(table.find("MULTIPROC_SETUP").unwrap().id, 2);
        assert!(table.find("LISTMP_BOGUS").is_none());
    }

    #[test]
    fn test_modules_sorted_by_base() {
        let table = CommandTable::builtin().unwrap();
        let bases: Vec<u32> = table.modules.iter().map(|m| m.base).collect();
        let mut sorted = bases.clone();
        sorted.sort();
        assert_eq!(bases, sorted);
    }

    #[test]
    fn test_overlap_rejected() {
        let clash = ModuleRange::new(Module::Notify, "CLASH", GATEMP.end(), &["ONE"]);
        let err = CommandTable::from_ranges(&[GATEMP, clash]).unwrap_err();
        assert!(matches!(err, CmdtabError::Overlap { .. }));
    }

    #[test]
    fn test_empty_module_rejected() {
        let empty = ModuleRange::new(Module::Notify, "EMPTY", 500, &[]);
        let err = CommandTable::from_ranges(&[LISTMP, empty]).unwrap_err();
        assert!(matches!(err, CmdtabError::EmptyModule(name) if name == "EMPTY"));
    }

    #[test]
    fn test_fingerprint_tracks_ids() {
        let table = CommandTable::builtin().unwrap();
        let print = table.fingerprint();
        assert_eq!(print.len(), 64);
        table.verify(&print.to_uppercase()).unwrap();

        let mut moved = table.clone();
        moved.modules[0].commands[0].id += 1;
        assert!(moved.verify(&print).is_err());
    }
}
