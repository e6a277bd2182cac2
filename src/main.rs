//! `stackcap`: print the stack of this process or of a running one.

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use log::debug;

use stackcap::platform::{self, executable_path, list_processes, platform_name, process_name};
use stackcap::{ConsolePrinter, DEFAULT_MAX_DEPTH, StackFrame, StackTrace, TraceConfig};

const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "stackcap",
    version,
    about = "Capture and symbolize stack traces",
    group(ArgGroup::new("mode").required(true).args(["self_capture", "pid", "list"])),
    after_help = "\
EXAMPLES:
    stackcap --self                 Stack of stackcap itself
    sudo stackcap --pid 1234        Stack of process 1234
    sudo stackcap -p 1234 --threads Every thread of process 1234
    stackcap --list                 Running processes"
)]
struct Args {
    /// Capture the stack of this process
    #[arg(short = 's', long = "self")]
    self_capture: bool,

    /// Capture the stack of a running process
    #[arg(short, long)]
    pid: Option<i32>,

    /// List running processes
    #[arg(short, long)]
    list: bool,

    /// Capture every thread of the target process
    #[arg(short, long, requires = "pid")]
    threads: bool,

    /// Maximum number of frames per stack
    #[arg(short = 'd', long, env = "STACKCAP_MAX_DEPTH", default_value_t = DEFAULT_MAX_DEPTH)]
    max_depth: usize,

    /// Disable coloured output
    #[arg(long)]
    no_color: bool,

    /// Never fall back to the external addr2line tool
    #[arg(long)]
    no_addr2line: bool,

    /// addr2line executable used as symbol fallback
    #[arg(long, env = "STACKCAP_ADDR2LINE", default_value = "addr2line", value_name = "PATH")]
    addr2line: String,

    /// Print process details, unresolved frames and debug logs
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            let code = if e.use_stderr() {
                EXIT_USAGE
            } else {
                EXIT_SUCCESS
            };
            std::process::exit(code);
        }
    };

    let default_filter = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut printer = ConsolePrinter::new();
    if args.no_color {
        printer.set_color_enabled(false);
    }

    std::process::exit(match run(&args, &printer) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            printer.print_error(&format!("{e:#}"));
            EXIT_ERROR
        }
    });
}

fn run(args: &Args, printer: &ConsolePrinter) -> Result<()> {
    if args.list {
        return list(printer);
    }

    let config = TraceConfig {
        use_debug_line_tool: !args.no_addr2line,
        debug_line_tool: args.addr2line.clone().into(),
        ..TraceConfig::default()
    }
    .with_max_depth(args.max_depth);
    debug!("Running on {} with {config:?}", platform_name());
    let mut trace = StackTrace::new().with_config(config);

    if args.self_capture {
        printer.print_info("Capturing stack trace of the current thread");
        let frames = trace
            .capture_current_thread()
            .context("Capture of the current thread failed")?;
        report(printer, args, &frames);
        printer.print_success(&format!("Captured {} frames", frames.len()));
        return Ok(());
    }

    let Some(pid) = args.pid else {
        anyhow::bail!("Missing required argument: --self, --pid or --list");
    };

    if args.verbose {
        describe_process(printer, pid);
    }

    if args.threads {
        printer.print_info(&format!("Capturing every thread of process {pid}"));
        let threads = trace
            .capture_threads(pid)
            .with_context(|| format!("Capture of process {pid} failed"))?;
        printer.print_thread_traces(&threads);
        if args.verbose {
            threads.iter().for_each(|thread| warn_degraded(printer, &thread.frames));
        }
        printer.print_success(&format!("Captured {} threads", threads.len()));
    } else {
        printer.print_info(&format!("Capturing stack trace of process {pid}"));
        let frames = trace
            .capture_process(pid)
            .with_context(|| format!("Capture of process {pid} failed"))?;
        report(printer, args, &frames);
        printer.print_success(&format!("Captured {} frames", frames.len()));
    }
    Ok(())
}

fn report(printer: &ConsolePrinter, args: &Args, frames: &[StackFrame]) {
    printer.print_stack_trace(frames);
    if args.verbose {
        warn_degraded(printer, frames);
    }
}

fn warn_degraded(printer: &ConsolePrinter, frames: &[StackFrame]) {
    for frame in frames {
        if let Err(e) = frame.check_resolved() {
            printer.print_warning(&e.to_string());
        }
    }
}

fn describe_process(printer: &ConsolePrinter, pid: i32) {
    let name = process_name(pid).unwrap_or_else(|| "<unknown>".to_string());
    let exe = executable_path(pid)
        .map(|path| {
            platform::resolve_symbolic_link(&path)
                .display()
                .to_string()
        })
        .unwrap_or_else(|| "<unknown>".to_string());
    printer.print_info(&format!("Process {pid}: {name} ({exe})"));
}

fn list(printer: &ConsolePrinter) -> Result<()> {
    let processes = list_processes().context("Failed to list processes")?;
    if processes.is_empty() {
        printer.print_warning(&format!("Process listing is not available on {}", platform_name()));
        return Ok(());
    }
    println!("PID\tName");
    for process in processes {
        println!("{}\t{}", process.pid, process.name);
    }
    Ok(())
}
