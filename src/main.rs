use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use totem::error::{format_error, TotemResult};
use totem::runtime::Runtime;
use totem::script::Actor;
use totem::value::Value;
use totem::vm::{ExecConfig, ExecState};

#[derive(Parser)]
#[command(name = "totem")]
#[command(about = "Compile and run a Totem script", long_about = None)]
struct Cli {
    file: String,

    /// Script function to call after the globals are initialized.
    #[arg(short, long)]
    function: Option<String>,

    /// Size of the local register arena.
    #[arg(long, default_value_t = ExecConfig::default().max_local_registers)]
    locals: usize,

    /// Print the compiled bytecode instead of running it.
    #[arg(long)]
    disassemble: bool,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let source = match std::fs::read_to_string(&cli.file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading '{}': {}", cli.file, e);
            process::exit(1);
        }
    };

    match run(&cli, &source) {
        Ok(Some(value)) => println!("{}", value),
        Ok(None) => {}
        Err(e) => {
            eprintln!("{}", format_error(&e, &source, &cli.file));
            process::exit(1);
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli, source: &str) -> TotemResult<Option<Value>> {
    let runtime = Arc::new(Runtime::new());
    totem::builtin::register_all(&runtime)?;

    if cli.disassemble {
        print!("{}", totem::build(source, &runtime)?.disassemble());
        return Ok(None);
    }

    let script = Arc::new(totem::load(source, &runtime)?);
    let actor = Actor::new(script);

    let config = ExecConfig {
        max_local_registers: cli.locals,
        ..ExecConfig::default()
    };
    let mut state = ExecState::with_config(Arc::clone(&runtime), config);

    state.exec(&actor, 0, &[])?;
    debug!(file = %cli.file, "globals initialized");

    match &cli.function {
        Some(name) => {
            let value = state.exec_by_name(&actor, name, &[])?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}
