// Build automation tool - suppress style lints
#![allow(clippy::needless_borrow)]

use sha2::{Digest, Sha256};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Bare-metal targets the library is expected to build for
const NOSTD_TARGETS: &[&str] = &["thumbv7em-none-eabihf", "aarch64-unknown-none"];

/// Generated broker header, relative to the workspace root
const CONTRACT_HEADER: &str = "include/IpcCmdBase.h";

fn run(cmd: &mut Command) -> anyhow::Result<()> {
    eprintln!("[RUN] {:?}", cmd);
    let status = cmd.status()?;
    if !status.success() {
        anyhow::bail!("command failed: {:?}", cmd);
    }
    Ok(())
}

fn output(cmd: &mut Command) -> anyhow::Result<String> {
    eprintln!("[RUN] {:?}", cmd);
    let out = cmd.output()?;
    if !out.status.success() {
        anyhow::bail!("command failed: {:?}", cmd);
    }
    Ok(String::from_utf8(out.stdout)?)
}

fn cargo() -> Command {
    Command::new(env::var("CARGO").unwrap_or_else(|_| "cargo".into()))
}

fn root() -> anyhow::Result<PathBuf> {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow::anyhow!("xtask manifest has no parent directory"))
}

fn have(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let data = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}

fn task_fmt() -> anyhow::Result<()> {
    run(cargo().args(["fmt", "--all"]))
}

fn task_fmt_check() -> anyhow::Result<()> {
    run(cargo().args(["fmt", "--all", "--", "--check"]))
}

fn task_clippy() -> anyhow::Result<()> {
    run(cargo().args([
        "clippy",
        "--workspace",
        "--all-targets",
        "--all-features",
        "--",
        "-D",
        "warnings",
    ]))
}

fn task_test() -> anyhow::Result<()> {
    run(cargo().args(["test", "--workspace"]))
}

fn installed_targets() -> anyhow::Result<Vec<String>> {
    if !have("rustup") {
        return Ok(Vec::new());
    }
    let list = output(Command::new("rustup").args(["target", "list", "--installed"]))?;
    Ok(list.lines().map(|l| l.trim().to_string()).collect())
}

fn task_nostd() -> anyhow::Result<()> {
    let installed = installed_targets()?;
    let mut built = 0;
    for target in NOSTD_TARGETS {
        if !installed.iter().any(|t| t == target) {
            eprintln!("[NOSTD] {} not installed, skipping", target);
            continue;
        }
        run(cargo().args(["build", "-p", "mp_ipc", "--lib", "--target", target]))?;
        built += 1;
    }
    if built == 0 {
        eprintln!(
            "[NOSTD] no bare-metal target installed; try `rustup target add {}`",
            NOSTD_TARGETS[0]
        );
    }
    Ok(())
}

/// Regenerate the broker header and record its checksum
fn task_contract(args: &[String]) -> anyhow::Result<()> {
    let root_dir = root()?;
    let header = root_dir.join(CONTRACT_HEADER);
    let sums = header.with_extension("h.sha256");
    let check = args.iter().any(|a| a == "--check");

    if check {
        if !sums.exists() {
            anyhow::bail!("no recorded contract; run `cargo run -p xtask -- contract`");
        }
        let recorded = fs::read_to_string(&sums)?;
        let expected = recorded.split_whitespace().next().unwrap_or_default();
        let before = sha256_file(&header)?;
        if before != expected {
            anyhow::bail!("{} was edited by hand", header.display());
        }
    }

    run(cargo()
        .args(["run", "-q", "-p", "cmdtab", "--", "--format", "header", "--output"])
        .arg(&header))?;
    let sum = sha256_file(&header)?;

    if check {
        let recorded = fs::read_to_string(&sums)?;
        if !recorded.starts_with(&sum) {
            anyhow::bail!(
                "{} is stale; run `cargo run -p xtask -- contract`",
                header.display()
            );
        }
        eprintln!("[CONTRACT] {} is up to date", CONTRACT_HEADER);
        return Ok(());
    }

    fs::write(&sums, format!("{}  {}\n", sum, CONTRACT_HEADER))?;
    eprintln!("[CONTRACT] {} -> {}", CONTRACT_HEADER, sum);
    Ok(())
}

fn task_check() -> anyhow::Result<()> {
    task_fmt_check()?;
    task_clippy()?;
    task_test()
}

fn task_clean() -> anyhow::Result<()> {
    run(cargo().arg("clean"))
}

fn print_help() {
    eprintln!(
        "xtask commands:\n  fmt | fmt-check | clippy | test | check | clean\n  nostd              # build the library for installed bare-metal targets\n  contract [--check] # regenerate include/IpcCmdBase.h via cmdtab\n\nExamples:\n  cargo run -p xtask -- test\n  cargo run -p xtask -- contract --check"
    );
}

fn main() -> anyhow::Result<()> {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_else(|| "help".into());
    match cmd.as_str() {
        "fmt" => task_fmt(),
        "fmt-check" => task_fmt_check(),
        "clippy" => task_clippy(),
        "test" => task_test(),
        "nostd" => task_nostd(),
        "contract" => {
            let rest: Vec<String> = args.collect();
            task_contract(&rest)
        }
        "check" => task_check(),
        "clean" => task_clean(),

        _ => {
            print_help();
            Ok(())
        }
    }
}
