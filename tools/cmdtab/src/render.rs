//! Output formats for the command table

use std::fmt::Write;

use crate::error::CmdtabError;
use crate::table::CommandTable;

/// Human-readable listing
pub fn text(table: &CommandTable) -> String {
    let mut out = String::new();
    for m in &table.modules {
        let _ = writeln!(out, "{:<14} {:>4}..={:<4}", m.name, m.base, m.end);
        for c in &m.commands {
            let _ = writeln!(out, "    {:>4}  {}", c.id, c.name);
        }
    }
    let _ = writeln!(out, "fingerprint {}", table.fingerprint());
    out
}

/// C header with per-module base/count and one define per command
pub fn c_header(table: &CommandTable, guard: &str) -> String {
    let mut out = String::new();

    // Include guard start
    out.push_str(&format!("#ifndef {}\n", guard));
    out.push_str(&format!("#define {}\n\n", guard));

    out.push_str("/* Broker command ids. Generated by cmdtab; do not edit. */\n");
    out.push_str(&format!(
        "/* Table fingerprint: {} */\n\n",
        table.fingerprint()
    ));

    out.push_str("#ifdef __cplusplus\n");
    out.push_str("extern \"C\" {\n");
    out.push_str("#endif\n\n");

    out.push_str(&format!("#define IPC_IOC_BASE {}u\n\n", table.ioc_base));

    for m in &table.modules {
        out.push_str(&format!("/* {} */\n", m.name));
        out.push_str(&format!("#define {}_BASE_CMD {}u\n", m.name, m.base));
        out.push_str(&format!(
            "#define {}_END_CMD {}u\n",
            m.name, m.end
        ));
        for c in &m.commands {
            out.push_str(&format!("#define CMD_{} {}u\n", c.name, c.id));
        }
        out.push('\n');
    }

    out.push_str("#ifdef __cplusplus\n");
    out.push_str("}\n");
    out.push_str("#endif\n\n");

    // Include guard end
    out.push_str(&format!("#endif /* {} */\n", guard));
    out
}

/// Pretty-printed JSON, fingerprint included
pub fn json(table: &CommandTable) -> Result<String, CmdtabError> {
    let mut value = serde_json::to_value(table)?;
    value["fingerprint"] = serde_json::Value::String(table.fingerprint());
    Ok(serde_json::to_string_pretty(&value)?)
}
