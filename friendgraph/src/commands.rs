use crate::CLAP_STYLING;
use clap::{arg, command};
use friendgraph_crawler::validate::{MAX_DEPTH, MAX_ORIGINS};

fn db_arg() -> clap::Arg {
    arg!(--"db" <PATH>)
        .required(false)
        .env("DATABASE_PATH")
        .help("Path of the friendgraph database (default: ~/.config/friendgraph/friendgraph.db)")
}

pub(crate) fn command_argument_builder() -> clap::Command {
    clap::Command::new("friendgraph")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("friendgraph")
        .styles(CLAP_STYLING)
        .arg(arg!(-q --"quiet" "Suppress banner and non-essential output").required(false))
        .arg(
            arg!(-v --"verbose" "Log debug output to stderr")
                .required(false)
                .global(true),
        )
        .subcommand_required(false)
        .subcommand(
            command!("init")
                .about("Initializes the friendgraph database on your filesystem")
                .arg(
                    arg!([PATH])
                        .required(false)
                        .help("Directory to store the friendgraph database in")
                        .default_value("~/.config/friendgraph/"),
                )
                .arg(
                    arg!(-f --"force")
                        .help("Overwrites any existing database at the specified location.")
                        .required(false),
                ),
        )
        .subcommand(command!("serve").about(
            "Runs the HTTP API. Settings come from the environment: STEAM_API_KEY, API_PORT, \
            NODE_NAME, NODE_DC, SERVICE and DATABASE_PATH are required.",
        ))
        .subcommand(
            command!("crawl")
                .about("Crawls the friend network around one or two profiles and waits for it to finish")
                .arg(
                    arg!(-o --"origin" <PROFILE_ID>)
                        .required(true)
                        .help(format!(
                            "17-digit profile ID to start from (up to {} origins)",
                            MAX_ORIGINS
                        ))
                        .action(clap::ArgAction::Append),
                )
                .arg(
                    arg!(-d --"depth" <DEPTH>)
                        .required(false)
                        .help(format!("How many friend hops to follow (1-{})", MAX_DEPTH))
                        .value_parser(clap::value_parser!(u32))
                        .default_value("1"),
                )
                .arg(
                    arg!(--"job-id" <JOB_ID>)
                        .required(false)
                        .help("Name for the new job (letters, digits, '-' and '_')"),
                )
                .arg(
                    arg!(--"force")
                        .required(false)
                        .help("Crawl again even if a finished job for the same input exists")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    arg!(-t --"threads" <NUM_WORKERS>)
                        .required(false)
                        .help("The number of async workers in the pool.")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("4"),
                )
                .arg(
                    arg!(--"timeout" <SECONDS>)
                        .required(false)
                        .help("Profile fetch timeout in seconds")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("10"),
                )
                .arg(
                    arg!(--"reuse-profiles" <SECONDS>)
                        .required(false)
                        .help("Reuse profiles any job fetched within this many seconds")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    arg!(--"api-key" <KEY>)
                        .required(true)
                        .env("STEAM_API_KEY")
                        .hide_env_values(true)
                        .help("Steam Web API key"),
                )
                .arg(db_arg()),
        )
        .subcommand(
            command!("status")
                .about("Shows one crawl job, or the most recent ones")
                .arg(arg!([JOB_ID]).required(false).help("The job to show"))
                .arg(
                    arg!(-n --"limit" <COUNT>)
                        .required(false)
                        .help("How many jobs to list when no job ID is given")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("20"),
                )
                .arg(db_arg()),
        )
        .subcommand(
            command!("graph")
                .about("Builds the graph of a finished crawl job and prints its report")
                .arg(arg!(<JOB_ID>).required(true).help("The finished job to aggregate"))
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Save report to file (default: display to screen)")
                        .value_parser(clap::value_parser!(std::path::PathBuf)),
                )
                .arg(
                    arg!(-f --"format" <FORMAT>)
                        .required(false)
                        .help("Report format: text, json, markdown")
                        .value_parser(["text", "json", "markdown"])
                        .default_value("text"),
                )
                .arg(db_arg()),
        )
        .subcommand(
            command!("cancel")
                .about(
                    "Marks a stored crawl job cancelled. Jobs running inside a server are \
                    cancelled through its HTTP API.",
                )
                .arg(arg!(<JOB_ID>).required(true).help("The job to cancel"))
                .arg(db_arg()),
        )
}
