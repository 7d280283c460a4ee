use anyhow::Context;
use bpfcheck::program::{BpfProgType, MapDescriptor, ProgramInfo, RawProgram};
use bpfcheck::verifier::{
    self, domain_descriptions, parse_domain, DomainChoice, VerifierOptions,
};
use clap::ArgMatches;
use log::warn;
use std::path::Path;
use std::process;

mod cli;

const EXIT_USAGE: i32 = 64;
const EXIT_IO: i32 = 2;

fn main() {
    let matches = match cli::args().try_get_matches() {
        Ok(matches) => matches,
        Err(err)
            if matches!(
                err.kind(),
                clap::ErrorKind::DisplayHelp | clap::ErrorKind::DisplayVersion
            ) =>
        {
            let _ = err.print();
            process::exit(0);
        }
        Err(err) => {
            let _ = err.print();
            process::exit(EXIT_USAGE);
        }
    };

    let code = match matches.subcommand() {
        Some(("check", check)) => run_check(check),
        _ => EXIT_USAGE,
    };
    process::exit(code);
}

fn init_logging(matches: &ArgMatches) {
    let mut builder = env_logger::Builder::from_default_env();
    match matches.value_of("verbose").and_then(|v| v.parse().ok()) {
        Some(0) | None => builder.filter_level(log::LevelFilter::Warn),
        Some(1) => builder.filter_level(log::LevelFilter::Info),
        Some(2) => builder.filter_level(log::LevelFilter::Debug),
        Some(_) => builder.filter_level(log::LevelFilter::Trace),
    };
    if let Some(topic) = matches.value_of("log") {
        builder.parse_filters(&format!("bpfcheck::{}=trace", topic));
    }
    let _ = builder.try_init();
}

/// Program type from a `type<N>` argument, or from the numeric file
/// suffix the way fixture files are named (`prog.4` is XDP).
fn resolve_prog_type(explicit: Option<u32>, file: &str) -> BpfProgType {
    let from_suffix = || {
        Path::new(file)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
    };
    match explicit.or_else(from_suffix).and_then(BpfProgType::from_index) {
        Some(t) => t,
        None => {
            warn!("no program type given; defaulting to unspec");
            BpfProgType::Unspec
        }
    }
}

fn run_check(matches: &ArgMatches) -> i32 {
    init_logging(matches);

    let file = matches.value_of("file").expect("file is required").to_string();

    let mut prog_type = None;
    let mut map_sizes = Vec::new();
    let mut domain = DomainChoice::SdbmArr;
    for arg in matches.values_of("args").into_iter().flatten() {
        if let Some(n) = arg.strip_prefix("type").and_then(|n| n.parse().ok()) {
            prog_type = Some(n);
        } else if let Some(n) = arg.strip_prefix("map").and_then(|n| n.parse().ok()) {
            map_sizes.push(n);
        } else if let Some(choice) = parse_domain(arg) {
            domain = choice;
        } else {
            eprintln!("argument {} is not a valid domain", arg);
            eprintln!("available domains:");
            for (name, desc) in domain_descriptions() {
                eprintln!("\t{} - {}", name, desc);
            }
            return EXIT_USAGE;
        }
    }

    let quiet = matches.is_present("quiet");
    let options = VerifierOptions {
        domain,
        print_invariants: !matches.is_present("no-print-invariants") && !quiet,
        print_failures: !matches.is_present("disable-warnings") && !quiet,
        check_semantic_reachability: matches.is_present("semantic-reachability"),
        simplify: matches.is_present("simplify"),
        liveness: !matches.is_present("no-liveness"),
        stats: matches.is_present("stats"),
        ..VerifierOptions::default()
    };

    let bytes = match std::fs::read(&file).with_context(|| format!("cannot read {}", file)) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("{:#}", err);
            return EXIT_IO;
        }
    };

    let info = ProgramInfo::new(
        resolve_prog_type(prog_type, &file),
        map_sizes.into_iter().map(MapDescriptor::array_of).collect(),
    );
    let raw = RawProgram {
        filename: file,
        section: String::new(),
        bytes,
        relocations: vec![],
        info,
    };

    let mut out = std::io::stdout();
    match verifier::run_verification(&raw, &options, &mut out) {
        Ok(true) => 0,
        Ok(false) => {
            if !quiet {
                println!("verification failed");
            }
            1
        }
        Err(verifier::VerificationError::Io(err)) => {
            eprintln!("{}", err);
            EXIT_IO
        }
        Err(err) => {
            eprintln!("{}", err);
            1
        }
    }
}
