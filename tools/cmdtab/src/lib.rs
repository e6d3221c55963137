//! cmdtab - broker command table generator
//!
//! Renders the command id ranges that `mp_ipc` shares with the broker as
//! plain text, a C header or JSON, and fingerprints the table so both sides
//! can check they were built against the same contract.

pub mod error;
pub mod render;
pub mod table;

pub use error::CmdtabError;
pub use table::{CommandEntry, CommandTable, ModuleEntry};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table_is_valid() {
        let table = CommandTable::builtin().unwrap();
        assert_eq!(table.modules.len(), mp_ipc::command::COMMAND_RANGES.len());
    }
}
