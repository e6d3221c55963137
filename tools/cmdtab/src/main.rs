use clap::{Parser, ValueEnum};
use std::fs;
use std::path::PathBuf;

use cmdtab::{render, CmdtabError, CommandTable};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Header,
    Json,
}

#[derive(Parser)]
#[command(name = "cmdtab")]
#[command(about = "Broker command table generator", long_about = None)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Write to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Include guard for the C header
    #[arg(long, default_value = "IPCCMDBASE_H")]
    guard: String,

    /// Print only the table fingerprint
    #[arg(long)]
    fingerprint: bool,

    /// Fail unless the table matches this fingerprint
    #[arg(long, value_name = "SHA256")]
    check: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), CmdtabError> {
    let cli = Cli::parse();
    let table = CommandTable::builtin()?;

    if let Some(expected) = &cli.check {
        table.verify(expected)?;
        if cli.verbose {
            println!("✓ fingerprint matches");
        }
        return Ok(());
    }

    let rendered = if cli.fingerprint {
        format!("{}\n", table.fingerprint())
    } else {
        match cli.format {
            Format::Text => render::text(&table),
            Format::Header => render::c_header(&table, &cli.guard),
            Format::Json => render::json(&table)?,
        }
    };

    match &cli.output {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)?;
            }
            fs::write(path, rendered)?;
            if cli.verbose {
                println!("    → {}", path.display());
            }
        }
        None => print!("{}", rendered),
    }
    Ok(())
}
