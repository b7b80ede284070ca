use colored::Colorize;
use commands::command_argument_builder;
use friendgraph::handlers::{
    handle_cancel, handle_crawl, handle_graph, handle_init, handle_serve, handle_status,
};

mod commands;

fn print_banner() {
    println!(
        "{}",
        r#"
  ┌─┐┬─┐┬┌─┐┌┐┌┌┬┐┌─┐┬─┐┌─┐┌─┐┬ ┬
  ├┤ ├┬┘│├┤ │││ │││ ┬├┬┘├─┤├─┘├─┤
  └  ┴└─┴└─┘┘└┘─┴┘└─┘┴└─┴ ┴┴  ┴ ┴"#
            .bright_cyan()
            .bold()
    );
    println!(
        "  {} {}\n",
        "friendgraph".bright_white().bold(),
        env!("CARGO_PKG_VERSION").bright_black()
    );
}

#[tokio::main]
async fn main() {
    let cmd = command_argument_builder();
    let chosen_command = cmd.get_matches();
    let quiet = chosen_command.get_flag("quiet");

    // The server logs to stdout, so no banner there
    let serving = matches!(chosen_command.subcommand(), Some(("serve", _)));
    if !quiet && !serving {
        print_banner();
    }

    let result = match chosen_command.subcommand() {
        None => return,
        Some(("init", primary_command)) => handle_init(primary_command),
        Some(("serve", _)) => handle_serve().await,
        Some(("crawl", primary_command)) => handle_crawl(primary_command).await,
        Some(("status", primary_command)) => handle_status(primary_command),
        Some(("graph", primary_command)) => handle_graph(primary_command).await,
        Some(("cancel", primary_command)) => handle_cancel(primary_command),
        _ => unreachable!("clap should ensure we don't get here"),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "✗".red().bold(), e);
        std::process::exit(1);
    }
}

pub const CLAP_STYLING: clap::builder::styling::Styles = clap::builder::styling::Styles::styled()
    .header(clap_cargo::style::HEADER)
    .usage(clap_cargo::style::USAGE)
    .literal(clap_cargo::style::LITERAL)
    .placeholder(clap_cargo::style::PLACEHOLDER)
    .error(clap_cargo::style::ERROR)
    .valid(clap_cargo::style::VALID)
    .invalid(clap_cargo::style::INVALID);
