use clap::{crate_description, crate_name, crate_version, Arg, Command};

pub fn args() -> Command<'static> {
    Command::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("check")
                .about("Verify the eBPF code in a raw binary")
                .arg(
                    Arg::new("file")
                        .help("Raw eBPF program to verify")
                        .value_name("FILE")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::new("args")
                        .help(
                            "Program type (type<N>), map value sizes (map<N>), \
                             and/or the abstract domain to use",
                        )
                        .value_name("ARG")
                        .takes_value(true)
                        .multiple_values(true),
                )
                .arg(
                    Arg::new("log")
                        .long("log")
                        .help("Enable trace logging for one module")
                        .value_name("TOPIC")
                        .takes_value(true),
                )
                .arg(
                    Arg::new("verbose")
                        .long("verbose")
                        .help("Logging verbosity (0..=3)")
                        .value_name("N")
                        .takes_value(true),
                )
                .arg(
                    Arg::new("stats")
                        .long("stats")
                        .alias("stat")
                        .help("Print analysis counters and timing"),
                )
                .arg(
                    Arg::new("simplify")
                        .long("simplify")
                        .help("Merge straight-line chains before the analysis"),
                )
                .arg(
                    Arg::new("no-liveness")
                        .long("no-liveness")
                        .help("Keep dead registers in the tracked state"),
                )
                .arg(
                    Arg::new("semantic-reachability")
                        .long("semantic-reachability")
                        .help("Report blocks whose post-invariant is empty"),
                )
                .arg(
                    Arg::new("no-print-invariants")
                        .long("no-print-invariants")
                        .help("Do not print the per-block invariants"),
                )
                .arg(
                    Arg::new("disable-warnings")
                        .long("disable-warnings")
                        .help("Suppress the failure report (exit code still set)"),
                )
                .arg(
                    Arg::new("quiet")
                        .short('q')
                        .help("No invariants and no failure report"),
                ),
        )
}
