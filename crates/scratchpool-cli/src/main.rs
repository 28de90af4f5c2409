//! scratchpool command line

mod commands;
mod output;

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("scratchpool")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Shared pool of scratch environments")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Output as JSON"),
        )
        .arg(
            Arg::new("outputfile")
                .long("outputfile")
                .global(true)
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Also write the JSON result to FILE"),
        )
        .arg(
            Arg::new("apiversion")
                .long("apiversion")
                .global(true)
                .help("Override the API version"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Pool configuration (TOML)"),
        )
        .arg(
            Arg::new("loglevel")
                .long("loglevel")
                .global(true)
                .default_value("info")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Log level when RUST_LOG is not set"),
        )
        .subcommand(
            Command::new("pool")
                .about("Work with the environment pool")
                .subcommand_required(true)
                .subcommand(
                    Command::new("fetch")
                        .about("Claim environments from a pool")
                        .arg(tag_arg())
                        .arg(mypool_arg())
                        .arg(
                            Arg::new("count")
                                .long("count")
                                .default_value("1")
                                .value_parser(value_parser!(usize))
                                .help("Number of environments to fetch"),
                        )
                        .arg(
                            Arg::new("provision")
                                .long("provision")
                                .action(ArgAction::SetTrue)
                                .help("Provision fresh environments if the pool runs short"),
                        )
                        .arg(
                            Arg::new("email")
                                .long("email")
                                .help("Notify this address about freshly provisioned environments"),
                        ),
                )
                .subcommand(
                    Command::new("info")
                        .about("Show sandbox process details")
                        .arg(
                            Arg::new("name")
                                .long("name")
                                .short('n')
                                .required(true)
                                .help("Sandbox name"),
                        )
                        .arg(
                            Arg::new("showonlylatest")
                                .long("showonlylatest")
                                .short('s')
                                .action(ArgAction::SetTrue)
                                .help("Only the most recent process"),
                        ),
                )
                .subcommand(
                    Command::new("list")
                        .about("List active environments in a pool")
                        .arg(tag_arg())
                        .arg(mypool_arg())
                        .arg(
                            Arg::new("unassigned")
                                .long("unassigned")
                                .action(ArgAction::SetTrue)
                                .help("Only environments free to claim"),
                        ),
                )
                .subcommand(
                    Command::new("cleanup")
                        .about("Retire expired and failed environments, then reconcile")
                        .arg(tag_arg()),
                )
                .subcommand(Command::new("limits").about("Show hub capacity and usage")),
        )
}

fn tag_arg() -> Arg {
    Arg::new("tag")
        .long("tag")
        .short('t')
        .required(true)
        .help("Pool tag")
}

fn mypool_arg() -> Arg {
    Arg::new("mypool")
        .long("mypool")
        .short('m')
        .action(ArgAction::SetTrue)
        .help("Only environments created by the hub user")
}

/// Deepest subcommand matches; global args are read from here
fn leaf(matches: &ArgMatches) -> &ArgMatches {
    let mut current = matches;
    while let Some((_, sub)) = current.subcommand() {
        current = sub;
    }
    current
}

fn init_logging(args: &ArgMatches) {
    let level = args
        .get_one::<String>("loglevel")
        .map_or("info", String::as_str);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if args.get_flag("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    let args = leaf(&matches);
    init_logging(args);

    let code = match commands::run(&matches).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("Error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn fetch_arguments() {
        let matches = cli()
            .try_get_matches_from([
                "scratchpool", "pool", "fetch", "--tag", "core", "--count", "3", "--provision",
                "--json",
            ])
            .unwrap();
        let args = leaf(&matches);
        assert_eq!(args.get_one::<String>("tag").map(String::as_str), Some("core"));
        assert_eq!(args.get_one::<usize>("count"), Some(&3));
        assert!(args.get_flag("provision"));
        assert!(!args.get_flag("mypool"));
        assert!(args.get_flag("json"));
    }

    #[test]
    fn info_requires_name() {
        assert!(cli()
            .try_get_matches_from(["scratchpool", "pool", "info"])
            .is_err());

        let matches = cli()
            .try_get_matches_from(["scratchpool", "pool", "info", "-n", "sandboxA", "-s"])
            .unwrap();
        assert!(leaf(&matches).get_flag("showonlylatest"));
    }

    #[test]
    fn rejects_unknown_log_level() {
        assert!(cli()
            .try_get_matches_from(["scratchpool", "pool", "limits", "--loglevel", "chatty"])
            .is_err());
    }
}
