//! Property-based tests for command range validation
//!
//! Random range layouts are checked against a brute-force overlap search,
//! both for the compile-time predicate in `mp_ipc` and for the runtime
//! validation in `CommandTable`.

use std::collections::HashSet;

use cmdtab::{CmdtabError, CommandTable};
use mp_ipc::command::{ranges_disjoint, Module, ModuleRange};
use proptest::prelude::*;

static NAMES: [&str; 16] = [
    "C0", "C1", "C2", "C3", "C4", "C5", "C6", "C7", "C8", "C9", "C10", "C11", "C12", "C13",
    "C14", "C15",
];

static MODULES: [&str; 6] = ["M0", "M1", "M2", "M3", "M4", "M5"];

fn ranges() -> impl Strategy<Value = Vec<ModuleRange>> {
    prop::collection::vec((0u32..200, 1usize..=16), 1..=6).prop_map(|spec| {
        spec.into_iter()
            .enumerate()
            .map(|(i, (base, count))| {
                ModuleRange::new(Module::Notify, MODULES[i], base, &NAMES[..count])
            })
            .collect()
    })
}

fn brute_force_disjoint(ranges: &[ModuleRange]) -> bool {
    let mut seen = HashSet::new();
    ranges
        .iter()
        .flat_map(|r| r.base..=r.end())
        .all(|id| seen.insert(id))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn disjointness_matches_brute_force(rs in ranges()) {
        prop_assert_eq!(ranges_disjoint(&rs), brute_force_disjoint(&rs));
    }

    #[test]
    fn table_accepts_exactly_disjoint_layouts(rs in ranges()) {
        match CommandTable::from_ranges(&rs) {
            Ok(table) => {
                prop_assert!(brute_force_disjoint(&rs));
                let ids: Vec<u32> = table
                    .modules
                    .iter()
                    .flat_map(|m| m.commands.iter().map(|c| c.id))
                    .collect();
                prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
            }
            Err(CmdtabError::Overlap { .. }) => prop_assert!(!brute_force_disjoint(&rs)),
            Err(e) => prop_assert!(false, "unexpected error: {}", e),
        }
    }
}
