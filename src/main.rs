//! ROPForge CLI
//!
//! Command-line front-end: reads a gadget file and an IL program,
//! compiles, and prints the chain in the requested format.

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use ropforge::{
    compile, Abi, Arch, ArchKind, BuiltinDecoder, CompileOptions, CompileOutcome,
    Constraint, GadgetDb, RawGadget, System,
};
use std::path::PathBuf;
use std::process::ExitCode;

/// Automatic ROP chain compiler.
///
/// Gadget files contain one gadget per line as `address:hexbytes`,
/// e.g. `0x400410:58c3`.
#[derive(Parser, Debug)]
#[command(name = "ropforge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Gadget file (`address:hexbytes` per line)
    #[arg(short, long)]
    gadgets: PathBuf,

    /// IL program file; use `-e` for inline programs
    #[arg(short, long, conflicts_with = "expr")]
    program: Option<PathBuf>,

    /// Inline IL program
    #[arg(short, long)]
    expr: Option<String>,

    /// Target architecture
    #[arg(short, long, default_value = "x64")]
    arch: ArchChoice,

    /// Output format
    #[arg(short, long, default_value = "pretty")]
    format: OutputFormat,

    /// Forbidden bytes, comma separated hex (e.g. `00,0a,20`)
    #[arg(long)]
    bad_bytes: Option<String>,

    /// Registers the chain must not clobber, comma separated
    #[arg(long)]
    keep_regs: Option<String>,

    /// Enforce memory-dereference safety
    #[arg(long)]
    safe_mem: bool,

    /// Registers assumed to hold valid pointers, comma separated
    #[arg(long)]
    safe_regs: Option<String>,

    /// Writable scratch address for string stores
    #[arg(long, value_parser = parse_hex)]
    scratch: Option<u64>,

    /// Calling convention for function-call IL
    #[arg(long, default_value = "none")]
    abi: AbiChoice,

    /// Target OS for syscall lowering
    #[arg(long, default_value = "linux")]
    os: OsChoice,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ArchChoice {
    X86,
    X64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// One annotated line per chain item
    Pretty,
    /// Paste-friendly packed byte literals
    Code,
    /// Raw bytes on stdout
    Raw,
    /// JSON chain structure
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AbiChoice {
    X86Cdecl,
    X86Stdcall,
    X64SystemV,
    X64Ms,
    None,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OsChoice {
    Linux,
    Windows,
    None,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("ropforge=debug")
            .init();
    }

    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<ExitCode> {
    let arch = Arch::new(match args.arch {
        ArchChoice::X86 => ArchKind::X86,
        ArchChoice::X64 => ArchKind::X64,
    });

    let raws = load_gadgets(&args.gadgets)?;
    let mut db = GadgetDb::new();
    let added = db.analyse_raw_gadgets(&arch, &BuiltinDecoder, &raws);
    if added == 0 {
        bail!("no usable gadgets in {}", args.gadgets.display());
    }

    let program = match (&args.program, &args.expr) {
        (Some(path), _) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        (None, Some(expr)) => expr.clone(),
        (None, None) => bail!("either --program or --expr is required"),
    };

    let constraint = build_constraint(args, &arch)?;
    let options = CompileOptions {
        abi: match args.abi {
            AbiChoice::X86Cdecl => Abi::X86Cdecl,
            AbiChoice::X86Stdcall => Abi::X86Stdcall,
            AbiChoice::X64SystemV => Abi::X64SystemV,
            AbiChoice::X64Ms => Abi::X64Ms,
            AbiChoice::None => Abi::None,
        },
        os: match args.os {
            OsChoice::Linux => System::Linux,
            OsChoice::Windows => System::Windows,
            OsChoice::None => System::None,
        },
        scratch: args.scratch,
        ..CompileOptions::default()
    };

    match compile(&arch, &db, &program, &constraint, &options)? {
        CompileOutcome::Chain(chain) => {
            match args.format {
                OutputFormat::Pretty => print!("{}", chain.dump_pretty()),
                OutputFormat::Code => print!("{}", chain.dump_code()),
                OutputFormat::Raw => {
                    use std::io::Write;
                    std::io::stdout().write_all(&chain.dump_raw())?;
                }
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&chain)?);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        CompileOutcome::Failed(record) => {
            eprintln!("No chain found.");
            if !record.modified_regs.is_empty() {
                let names: Vec<_> = record
                    .modified_regs
                    .iter()
                    .map(|r| arch.reg_name(r))
                    .collect();
                eprintln!("  would need to modify kept registers: {}", names.join(", "));
            }
            for (byte, gadget) in &record.bad_bytes {
                eprintln!(
                    "  byte 0x{byte:02x} blocks gadget {}",
                    db.get(*gadget)
                );
            }
            if record.max_len {
                eprintln!("  search budget exhausted");
            }
            Ok(ExitCode::FAILURE)
        }
        CompileOutcome::Cancelled => {
            eprintln!("Compilation cancelled.");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn load_gadgets(path: &PathBuf) -> anyhow::Result<Vec<RawGadget>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut out = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (addr_s, hex_s) = line
            .split_once(':')
            .with_context(|| format!("{}:{}: expected address:hexbytes", path.display(), lineno + 1))?;
        let addr = parse_hex(addr_s.trim())
            .map_err(|e| anyhow::anyhow!("{}:{}: {e}", path.display(), lineno + 1))?;
        let bytes = hex::decode(hex_s.trim())
            .with_context(|| format!("{}:{}: bad hex bytes", path.display(), lineno + 1))?;
        out.push(RawGadget { addr, bytes, bin_num: 0 });
    }
    Ok(out)
}

fn build_constraint(args: &Args, arch: &Arch) -> anyhow::Result<Constraint> {
    let mut constraint = Constraint::new();
    if let Some(spec) = &args.bad_bytes {
        for part in spec.split(',') {
            let byte = u8::from_str_radix(part.trim().trim_start_matches("0x"), 16)
                .with_context(|| format!("bad byte {part:?}"))?;
            constraint.bad_bytes.add(byte);
        }
    }
    if let Some(spec) = &args.keep_regs {
        for part in spec.split(',') {
            let name = part.trim();
            let r = arch
                .reg_from_name(name)
                .with_context(|| format!("unknown register {name:?}"))?;
            constraint.keep_regs.add(r);
        }
    }
    constraint.mem_safety.enforced = args.safe_mem;
    if let Some(spec) = &args.safe_regs {
        for part in spec.split(',') {
            let name = part.trim();
            let r = arch
                .reg_from_name(name)
                .with_context(|| format!("unknown register {name:?}"))?;
            constraint.mem_safety.add_safe_reg(r);
        }
    }
    Ok(constraint)
}

fn parse_hex(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, radix) = match s.strip_prefix("0x") {
        Some(rest) => (rest, 16),
        None => (s, 10),
    };
    u64::from_str_radix(digits, radix).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args =
            Args::try_parse_from(["ropforge", "-g", "gadgets.txt", "-e", "rax = 1"]).unwrap();
        assert!(args.program.is_none());
        assert_eq!(args.expr.as_deref(), Some("rax = 1"));
        assert!(matches!(args.arch, ArchChoice::X64));
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0x400410"), Ok(0x400410));
        assert_eq!(parse_hex("16"), Ok(16));
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_gadget_file_loading() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# comment").unwrap();
        writeln!(f, "0x400410:58c3").unwrap();
        writeln!(f, "0x400520:488907c3").unwrap();
        let raws = load_gadgets(&f.path().to_path_buf()).unwrap();
        assert_eq!(raws.len(), 2);
        assert_eq!(raws[0].addr, 0x400410);
        assert_eq!(raws[0].bytes, vec![0x58, 0xc3]);
    }

    #[test]
    fn test_bad_byte_flag() {
        let args = Args::try_parse_from([
            "ropforge",
            "-g",
            "g.txt",
            "-e",
            "rax = 1",
            "--bad-bytes",
            "00,0a",
        ])
        .unwrap();
        let arch = Arch::new(ArchKind::X64);
        let c = build_constraint(&args, &arch).unwrap();
        assert!(!c.bad_bytes.is_valid_byte(0x00));
        assert!(!c.bad_bytes.is_valid_byte(0x0a));
        assert!(c.bad_bytes.is_valid_byte(0x41));
    }
}
