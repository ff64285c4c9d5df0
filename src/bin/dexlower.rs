//! Developer front end for dexlower.
//!
//! Reads methods in the textual bytecode format and dumps the graph or
//! liveness, or shows how the AArch64 encoder handles an immediate or a
//! memory access.

use bumpalo::Bump;
use clap::{Parser, Subcommand, ValueEnum};
use dexlower::arm64::{
    decode_logical_immediate, encode_imm_double, encode_imm_single, encode_logical_immediate,
    A64Encoder, OpSize, Reg,
};
use dexlower::bytecode::{parse_method, ParsedMethod};
use dexlower::core::{CompilationSession, CompilerOptions};
use dexlower::driver::MethodCompiler;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// dexlower - bytecode to graph, liveness and AArch64 encodings
#[derive(Parser)]
#[command(name = "dexlower")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Print session statistics when done
    #[arg(long, global = true)]
    stats: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and print the control-flow graph of a method
    Graph {
        file: PathBuf,
        #[command(flatten)]
        limits: Limits,
    },

    /// Build the graph and print live intervals
    Liveness {
        file: PathBuf,
        #[command(flatten)]
        limits: Limits,
    },

    /// Encode a value as a logical immediate
    Imm {
        /// Decimal or 0x-prefixed hexadecimal
        #[arg(value_parser = parse_int)]
        value: u64,

        /// Treat the value as 32 bits
        #[arg(long)]
        w32: bool,
    },

    /// Show how a floating-point constant is materialized
    Fpimm {
        #[arg(allow_hyphen_values = true)]
        value: f64,

        /// Double precision instead of single
        #[arg(long)]
        double: bool,
    },

    /// Select the addressing mode for a load or store
    Mem {
        #[arg(allow_hyphen_values = true)]
        displacement: i32,

        #[arg(long, value_enum, default_value = "k64")]
        size: SizeArg,

        /// Select a store instead of a load
        #[arg(long)]
        store: bool,
    },
}

#[derive(clap::Args)]
struct Limits {
    /// Largest method accepted, in code units
    #[arg(long, default_value_t = CompilerOptions::DEFAULT_MAX_CODE_UNITS)]
    max_code_units: u32,

    /// Largest number of blocks accepted
    #[arg(long, default_value_t = CompilerOptions::DEFAULT_MAX_BLOCKS)]
    max_blocks: usize,

    /// Skip the range-ordering check after liveness
    #[arg(long)]
    no_verify: bool,
}

impl Limits {
    fn options(&self) -> CompilerOptions {
        CompilerOptions {
            max_code_units: self.max_code_units,
            max_blocks: self.max_blocks,
            verify_liveness: !self.no_verify,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SizeArg {
    Word,
    K64,
    K32,
    Reference,
    Single,
    Double,
    UnsignedHalf,
    SignedHalf,
    UnsignedByte,
    SignedByte,
}

impl SizeArg {
    fn op_size(self) -> OpSize {
        match self {
            SizeArg::Word => OpSize::Word,
            SizeArg::K64 => OpSize::K64,
            SizeArg::K32 => OpSize::K32,
            SizeArg::Reference => OpSize::Reference,
            SizeArg::Single => OpSize::Single,
            SizeArg::Double => OpSize::Double,
            SizeArg::UnsignedHalf => OpSize::UnsignedHalf,
            SizeArg::SignedHalf => OpSize::SignedHalf,
            SizeArg::UnsignedByte => OpSize::UnsignedByte,
            SizeArg::SignedByte => OpSize::SignedByte,
        }
    }

    /// Register of the natural class for this size.
    fn data_register(self) -> Reg {
        match self {
            SizeArg::Single => Reg::s(0),
            SizeArg::Double => Reg::d(0),
            SizeArg::Word | SizeArg::K64 => Reg::x(0),
            _ => Reg::w(0),
        }
    }
}

fn parse_int(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => match text.strip_prefix('-') {
            Some(digits) => digits.parse::<i64>().map(|v| v.wrapping_neg() as u64),
            None => text.parse::<u64>(),
        },
    };
    parsed.map_err(|e| format!("invalid integer '{text}': {e}"))
}

fn read_method(path: &Path) -> Result<ParsedMethod, Box<dyn Error>> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_method(&text)?)
}

fn run(cli: &Cli, session: &CompilationSession<'_>) -> Result<(), Box<dyn Error>> {
    match &cli.command {
        Commands::Graph { file, limits } => {
            let parsed = read_method(file)?;
            let compiler = MethodCompiler::new(session, limits.options());
            let graph = compiler.build_graph(&parsed.unit, &parsed.code, &parsed.methods)?;
            print!("{graph}");
        }

        Commands::Liveness { file, limits } => {
            let parsed = read_method(file)?;
            let compiler = MethodCompiler::new(session, limits.options());
            compiler.compile_with(
                &parsed.unit,
                &parsed.code,
                &parsed.methods,
                |graph, liveness| {
                    for &block in liveness.linear_order() {
                        if let Some((start, end)) = liveness.block_lifetime(block) {
                            println!("B{} [{start}, {end})", graph.block_id(block));
                        }
                    }
                    for ssa_index in 0..liveness.number_of_ssa_values() {
                        let Some(inst) = liveness.instruction_from_ssa_index(ssa_index) else {
                            continue;
                        };
                        let Some(id) = liveness.interval_of(inst) else {
                            continue;
                        };
                        println!(
                            "{inst} {}: {}",
                            graph.instruction(inst).kind().name(),
                            liveness.intervals().display(id)
                        );
                    }
                },
            )?;
        }

        Commands::Imm { value, w32 } => {
            let wide = !*w32;
            match encode_logical_immediate(wide, *value) {
                Some(encoded) => {
                    let n = (encoded >> 12) & 1;
                    let immr = (encoded >> 6) & 0x3f;
                    let imms = encoded & 0x3f;
                    println!("{value:#x}: N={n} immr={immr} imms={imms:#08b} ({encoded:#x})");
                    if let Some(decoded) = decode_logical_immediate(wide, encoded) {
                        println!("decodes to {decoded:#x}");
                    }
                }
                None => println!("{value:#x}: not a logical immediate"),
            }
        }

        Commands::Fpimm { value, double } => {
            let mut encoder = A64Encoder::new();
            if *double {
                let bits = value.to_bits();
                if let Some(imm8) = encode_imm_double(bits) {
                    println!("{value} ({bits:#018x}): imm8 {imm8:#04x}");
                }
                encoder.load_fp_constant_value_wide(Reg::d(0), bits as i64)?;
            } else {
                let bits = (*value as f32).to_bits();
                if let Some(imm8) = encode_imm_single(bits) {
                    println!("{value} ({bits:#010x}): imm8 {imm8:#04x}");
                }
                encoder.load_fp_constant_value(Reg::s(0), bits as i32)?;
            }
            print!("{encoder}");
        }

        Commands::Mem {
            displacement,
            size,
            store,
        } => {
            let mut encoder = A64Encoder::new();
            let reg = size.data_register();
            if *store {
                encoder.store_base_disp(Reg::x(1), *displacement, reg, size.op_size())?;
            } else {
                encoder.load_base_disp(Reg::x(1), *displacement, reg, size.op_size())?;
            }
            print!("{encoder}");
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let result = run(&cli, &session);

    if cli.stats {
        eprint!("{}", session.stats());
    }
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
