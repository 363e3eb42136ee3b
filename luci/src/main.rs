//! Command-line frontend of the loader.
//!
//! The binary doubles as the `PT_INTERP` interpreter of prepared binaries
//! and as a standalone tool: `luci [options] binary [args...]`.

mod logger;

use std::path::Path;
use std::sync::atomic::Ordering;

use code_redirect::TrapMode;
use getopts::Options;
use loader::{process, watch, Config, DetectOutdated, Loader, UpdateMode};
use log::{error, info};
use object_metadata::{ObjectFlags, NAMESPACE_BASE};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {} [options] binary [args...]", program);
    print!("{}", opts.usage(&brief));
}

/// An option may also arrive through the environment (`LD_*` variables),
/// as the loader is usually invoked implicitly as an interpreter.
fn from_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optmulti("L", "library-path", "add directory to library search path", "DIR");
    opts.optmulti("p", "preload", "preload the given library", "LIB");
    opts.optmulti("x", "exclude", "never load the given library", "LIB");
    opts.optflag("n", "bind-now", "resolve all relocations at load time");
    opts.optflag("u", "update", "enable dynamic updates of modified files");
    opts.optflag("f", "force", "force updates even if they seem incompatible");
    opts.optflag("w", "dynamic-weak", "support weak symbol semantics during resolution");
    opts.optflag(
        "",
        "relocate-outdated",
        "on updates, rewrite relocations in outdated versions as well",
    );
    opts.optflag(
        "",
        "relocate-check",
        "skip rewriting data relocations whose values were altered by the program",
    );
    opts.optopt(
        "d",
        "detect-outdated",
        "detect execution of outdated code (disabled, userfaultfd, uprobes, uprobes_deps, ptrace)",
        "MODE",
    );
    opts.optopt(
        "",
        "detect-outdated-delay",
        "seconds between an update and disabling the old version",
        "N",
    );
    opts.optopt(
        "m",
        "update-mode",
        "how updates rewrite references (got, coderel, coderel-localint)",
        "MODE",
    );
    opts.optopt("t", "trap", "trap instruction for redirections (int1, int3, ud2, hlt)", "TRAP");
    opts.optflagopt(
        "",
        "dbgsym",
        "fingerprint from separate debug symbols (optionally rooted at DIR)",
        "DIR",
    );
    opts.optopt("", "debughash", "URI of the external debug hash oracle", "URI");
    opts.optopt("s", "statusinfo", "write one line per load attempt to FILE", "FILE");
    opts.optflag("", "stop-on-update", "stop all threads while patching code");
    opts.optflag("", "show-args", "show program arguments before start");
    opts.optflag("", "show-env", "show environment variables before start");
    opts.optflag("", "show-auxv", "show auxiliary vector before start");
    opts.optopt("", "entry", "overwrite the entry point (symbol, address or +offset)", "ENTRY");
    opts.optopt("l", "logfile", "write log output to FILE", "FILE");
    opts.optflag("", "logfile-append", "append to the log file instead of truncating");
    opts.optopt("v", "verbosity", "log verbosity (0 = errors ... 5 = trace)", "N");
    opts.optflag("h", "help", "print this help");
    opts.optflag("V", "version", "print version information");

    let matches = match opts.parse(&args[1..]) {
        Ok(matches) => matches,
        Err(failure) => {
            eprintln!("{}", failure);
            print_usage(&program, &opts);
            std::process::exit(1);
        }
    };
    if matches.opt_present("help") {
        print_usage(&program, &opts);
        return;
    }
    if matches.opt_present("version") {
        println!("luci {}", VERSION);
        return;
    }
    if matches.free.is_empty() {
        eprintln!("no binary given");
        print_usage(&program, &opts);
        std::process::exit(1);
    }

    let verbosity = matches
        .opt_str("verbosity")
        .or_else(|| from_env("LD_LOGLEVEL"))
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
    let logfile = matches.opt_str("logfile").or_else(|| from_env("LD_LOGFILE"));
    if let Err(message) = logger::setup(
        verbosity,
        logfile.as_deref(),
        matches.opt_present("logfile-append"),
    ) {
        eprintln!("{}", message);
    }

    let mut config = Config::default();
    config.dynamic_update =
        matches.opt_present("update") || from_env("LD_DYNAMIC_UPDATE").is_some();
    config.dynamic_dlupdate = config.dynamic_update;
    config.bind_now = matches.opt_present("bind-now") || from_env("LD_BIND_NOW").is_some();
    config.force_update = matches.opt_present("force");
    config.dynamic_weak =
        matches.opt_present("dynamic-weak") || from_env("LD_DYNAMIC_WEAK").is_some();
    config.update_outdated_relocations =
        matches.opt_present("relocate-outdated") || from_env("LD_RELOCATE_OUTDATED").is_some();
    config.check_relocation_content =
        matches.opt_present("relocate-check") || from_env("LD_RELOCATE_CHECK").is_some();
    config.skip_identical = config.dynamic_update;
    config.use_mtime = true;
    config.stop_on_update = matches.opt_present("stop-on-update");
    config.show_args = matches.opt_present("show-args");
    config.show_env = matches.opt_present("show-env");
    config.show_auxv = matches.opt_present("show-auxv");
    config.debug_hash = matches.opt_str("debughash").or_else(|| from_env("LD_DEBUG_HASH"));
    config.early_statusinfo = from_env("LD_EARLY_STATUS_INFO").is_some();
    config.find_debug_symbols = matches.opt_present("dbgsym");
    config.debug_symbols_root = matches.opt_str("dbgsym");

    if let Some(mode) = matches
        .opt_str("update-mode")
        .or_else(|| from_env("LD_UPDATE_MODE"))
    {
        config.update_mode = match mode.as_str() {
            "got" | "GOT" => UpdateMode::Got,
            "coderel" | "CODEREL" => UpdateMode::CodeRel,
            "coderel-localint" | "CODEREL_LOCALINT" => UpdateMode::CodeRelLocalInt,
            other => {
                eprintln!("invalid update mode '{}'", other);
                std::process::exit(1);
            }
        };
    }
    if let Some(mode) = matches
        .opt_str("detect-outdated")
        .or_else(|| from_env("LD_DETECT_OUTDATED"))
    {
        config.detect_outdated = match mode.as_str() {
            "disabled" => DetectOutdated::Disabled,
            "userfaultfd" => DetectOutdated::Userfaultfd,
            "uprobes" => DetectOutdated::Uprobes,
            "uprobes_deps" => DetectOutdated::UprobesDeps,
            "ptrace" => DetectOutdated::Ptrace,
            other => {
                eprintln!("invalid outdated detection mode '{}'", other);
                std::process::exit(1);
            }
        };
    }
    if let Some(delay) = matches
        .opt_str("detect-outdated-delay")
        .and_then(|value| value.parse().ok())
    {
        config.detect_outdated_delay = delay;
    }
    if let Some(trap) = matches.opt_str("trap") {
        config.trap_mode = match trap.as_str() {
            "int1" => TrapMode::Debug,
            "int3" => TrapMode::Breakpoint,
            "ud2" => TrapMode::InvalidOpcode,
            "hlt" => TrapMode::Halt,
            "none" => TrapMode::None,
            other => {
                eprintln!("invalid trap mode '{}'", other);
                std::process::exit(1);
            }
        };
    }

    // Search paths: command line first, then the environment.
    let mut runtime_paths = matches.opt_strs("library-path");
    if let Some(paths) = from_env("LD_LIBRARY_PATH") {
        runtime_paths.extend(paths.split(':').map(|path| path.to_string()));
    }
    config.library_path = runtime_paths;
    config.exclude = matches.opt_strs("exclude");

    let loader = Loader::initialize(config);

    if let Some(statusinfo) = matches.opt_str("statusinfo").or_else(|| from_env("LD_STATUS_INFO")) {
        open_statusinfo(loader, &statusinfo);
    }
    if let Some(uri) = loader.config.debug_hash.clone() {
        connect_debug_hash(loader, &uri);
    }

    // The target binary and its preloads.
    let mut flags = loader.default_flags;
    flags |= ObjectFlags::EXECUTED_BINARY;
    let binary = matches.free[0].clone();
    let target = match loader.open(Path::new(&binary), flags, NAMESPACE_BASE, None) {
        Some(target) => target,
        None => {
            error!("unable to load {}", binary);
            std::process::exit(1);
        }
    };

    let mut preloads = matches.opt_strs("preload");
    if let Some(list) = from_env("LD_PRELOAD") {
        preloads.extend(list.split(&[':', ' '][..]).map(|lib| lib.to_string()));
    }
    for preload in preloads {
        if loader
            .library(&preload, loader.default_flags, &[], &[], NAMESPACE_BASE)
            .is_none()
        {
            error!("unable to preload {}", preload);
            std::process::exit(1);
        }
    }

    if !watch::start_handler_thread(loader) {
        error!("starting the file modification handler failed");
    }

    if let Err(message) = process::prepare_execution(loader, &target) {
        error!("preparation for execution of {} failed: {}", binary, message);
        std::process::exit(1);
    }

    let entry = match process::entry_point(loader, &target, matches.opt_str("entry").as_deref()) {
        Ok(entry) => entry,
        Err(message) => {
            error!("{}", message);
            std::process::exit(1);
        }
    };

    let envs: Vec<String> = std::env::vars()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();
    let stack_pointer = match process::build_stack(&target, &matches.free, &envs) {
        Ok(stack_pointer) => stack_pointer,
        Err(message) => {
            error!("{}", message);
            std::process::exit(1);
        }
    };

    info!("handing over to {} at {:#x}", binary, entry);
    process::show_init_stack(loader, entry, stack_pointer);
    process::start_program(loader, entry, stack_pointer)
}

/// Opens the status-info stream.
fn open_statusinfo(loader: &Loader, path: &str) {
    match std::ffi::CString::new(path) {
        Ok(path) => {
            let fd = unsafe {
                libc::open(
                    path.as_ptr(),
                    libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_SYNC,
                    0o644,
                )
            };
            if fd < 0 {
                error!("opening status info file failed");
            } else {
                loader.statusinfo_fd.store(fd, Ordering::Release);
            }
        }
        Err(_) => error!("invalid status info path"),
    }
}

/// Connects the debug-hash oracle socket (`unix:/path` URIs).
fn connect_debug_hash(loader: &Loader, uri: &str) {
    let path = match uri.strip_prefix("unix:") {
        Some(path) => path,
        None => {
            error!("debug hashing not available (unsupported URI {})", uri);
            return;
        }
    };
    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            error!("creating debug hash socket failed");
            return;
        }
        let mut address: libc::sockaddr_un = core::mem::zeroed();
        address.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let bytes = path.as_bytes();
        if bytes.len() >= address.sun_path.len() {
            error!("debug hash socket path too long");
            libc::close(fd);
            return;
        }
        for (index, byte) in bytes.iter().enumerate() {
            address.sun_path[index] = *byte as libc::c_char;
        }
        if libc::connect(
            fd,
            &address as *const libc::sockaddr_un as *const libc::sockaddr,
            core::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        ) != 0
        {
            error!("debug hashing not available (cannot connect to {})", uri);
            libc::close(fd);
            return;
        }
        loader.debug_hash_fd.store(fd, Ordering::Release);
        info!("using {} for debug hashing", uri);
    }
}
