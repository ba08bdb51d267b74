use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

mod commands;
mod config;

/// Garnet register-machine toolchain.
///
/// Reads stack bytecode routines encoded as JSON, translates them into
/// register bytecode and runs them on the speculative dispatch loop.
///
/// EXAMPLES:
///     garnet check main.json            Validate stack bytecode
///     garnet translate main.json        Print register disassembly
///     garnet run main.json --profile    Run and print a profile report
///
/// ENVIRONMENT VARIABLES:
///     GARNET_CONFIG     Path to a garnet.toml to use
///     GARNET_*          Per-setting overrides (e.g. GARNET_VM_SPECIALIZE=false)
///     RUST_LOG          Log filter, takes precedence over the config
#[derive(Parser)]
#[command(name = "garnet")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Use this configuration file instead of searching for garnet.toml
    #[arg(long, global = true, env = "GARNET_CONFIG")]
    config: Option<PathBuf>,

    /// Raise log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(long, short = 'v', global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Translate a routine and print its register bytecode
    ///
    /// EXAMPLES:
    ///     garnet translate main.json            Disassembly
    ///     garnet translate main.json --json     Register routine as JSON
    ///     garnet translate main.json --no-fuse  Keep compares and branches apart
    #[command(visible_alias = "t")]
    Translate {
        /// Path to the JSON stack routine
        file: PathBuf,
        /// Print the register routine as JSON
        #[arg(long)]
        json: bool,
        /// Don't fuse compares with the following branch
        #[arg(long)]
        no_fuse: bool,
        /// Don't fold literal operands into instructions
        #[arg(long)]
        no_imm: bool,
    },

    /// Translate and execute a routine with the reference host
    ///
    /// EXAMPLES:
    ///     garnet run main.json                   Print the result
    ///     garnet run main.json --profile         Also print a profile report
    ///     garnet run main.json --no-specialize   Generic instructions only
    #[command(visible_alias = "r")]
    Run {
        /// Path to the JSON stack routine
        file: PathBuf,
        /// Count instructions, rewrites and cache hits
        #[arg(long)]
        profile: bool,
        /// Keep every instruction in its generic form
        #[arg(long)]
        no_specialize: bool,
    },

    /// Validate a routine's stack bytecode without translating it
    #[command(visible_alias = "c")]
    Check {
        /// Path to the JSON stack routine
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = config::load(cli.config.as_deref())?;
    config::init_logging(&settings, cli.verbose);
    debug!(translator = ?settings.translator, vm = ?settings.vm, "Resolved settings");

    match cli.command {
        Commands::Translate {
            file,
            json,
            no_fuse,
            no_imm,
        } => {
            if no_fuse {
                settings.translator.fuse_compare_branch = false;
            }
            if no_imm {
                settings.translator.immediate_operands = false;
            }
            commands::translate::run(&file, &settings, json)
        }
        Commands::Run {
            file,
            profile,
            no_specialize,
        } => {
            if profile {
                settings.vm.profile = true;
            }
            if no_specialize {
                settings.vm.specialize = false;
            }
            commands::run::run(&file, &settings)
        }
        Commands::Check { file } => commands::check::run(&file),
    }
}
