mod client;
mod config;
mod output;
mod query;
mod resources;

use crate::client::{DashboardClient, Session};
use crate::config::{
    CliOverrides, ConfigError, Operation, ResolvedConfig, SortOrder, resolve,
    select_operation,
};
use crate::output::{CSV_UNAVAILABLE, Output, OutputFormat, OutputSpec};
use crate::query::{FeedWindow, QuerySpec, SUPPORTED_TAGS, validate_tags};
use crate::resources::{ConfigResource, add_entries, delete_entries, load_entries};
use anyhow::{Context, Result};
use clap::{ArgGroup, CommandFactory, Parser, ValueEnum};
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "sigsci",
    version,
    about = "CLI for the Signal Sciences dashboard API",
    after_help = "Email, password, corp and site are read from SIGSCI_EMAIL, SIGSCI_PASSWORD, \
                  SIGSCI_CORP and SIGSCI_SITE (or the config file), never from flags."
)]
#[command(group(ArgGroup::new("operation").multiple(false)))]
struct Cli {
    #[arg(
        long = "from",
        value_name = "VALUE",
        allow_hyphen_values = true,
        help = "Filter results from a specified time (e.g. -6h)"
    )]
    from: Option<String>,

    #[arg(
        long,
        value_name = "VALUE",
        allow_hyphen_values = true,
        help = "Filter results until a specified time (e.g. -4h)"
    )]
    until: Option<String>,

    #[arg(long, num_args = 1.., value_name = "TAG", help = "Filter results on one or more tags")]
    tags: Option<Vec<String>>,

    #[arg(
        long,
        num_args = 1..,
        value_name = "TAG",
        help = "Filter results on one or more custom tags"
    )]
    ctags: Option<Vec<String>>,

    #[arg(long, value_name = "NAME", help = "Filter results by server name")]
    server: Option<String>,

    #[arg(
        long,
        value_name = "N",
        help = "Limit the number of results returned from the server (default: 100)"
    )]
    limit: Option<u32>,

    #[arg(
        long,
        value_parser = ["all", "totalCount", "next", "data"],
        help = "Top-level field of the search response to print (all prints everything)"
    )]
    field: Option<String>,

    #[arg(
        long,
        value_name = "PATH",
        help = "Append output to this file; input file for --*-add and --*-delete"
    )]
    file: Option<PathBuf>,

    #[arg(long, value_enum, help = "Output format (default: json)")]
    format: Option<FormatArg>,

    #[arg(long, value_enum, help = "Sort order by time")]
    sort: Option<SortArg>,

    #[arg(long, help = "List all supported tags and exit")]
    list: bool,

    #[arg(long, help = "Print the resolved configuration (password masked) and exit")]
    show_config: bool,

    #[arg(
        long,
        value_enum,
        value_name = "SHELL",
        help = "Generate a shell completion script and exit"
    )]
    completions: Option<CompletionShell>,

    #[arg(long, group = "operation", help = "Retrieve agent metrics")]
    agents: bool,
    #[arg(long, group = "operation", help = "Retrieve the request data feed")]
    feed: bool,

    #[arg(long, group = "operation", help = "Retrieve whitelist parameters")]
    whitelist_parameters: bool,
    #[arg(long, group = "operation", help = "Add whitelist parameters from --file")]
    whitelist_parameters_add: bool,
    #[arg(long, group = "operation", help = "Delete whitelist parameters listed in --file")]
    whitelist_parameters_delete: bool,

    #[arg(long, group = "operation", help = "Retrieve whitelist paths")]
    whitelist_paths: bool,
    #[arg(long, group = "operation", help = "Add whitelist paths from --file")]
    whitelist_paths_add: bool,
    #[arg(long, group = "operation", help = "Delete whitelist paths listed in --file")]
    whitelist_paths_delete: bool,

    #[arg(long, group = "operation", help = "Retrieve IP whitelist")]
    whitelist: bool,
    #[arg(long, group = "operation", help = "Add to IP whitelist from --file")]
    whitelist_add: bool,
    #[arg(long, group = "operation", help = "Delete IP whitelist entries listed in --file")]
    whitelist_delete: bool,

    #[arg(long, group = "operation", help = "Retrieve IP blacklist")]
    blacklist: bool,
    #[arg(long, group = "operation", help = "Add to IP blacklist from --file")]
    blacklist_add: bool,
    #[arg(long, group = "operation", help = "Delete IP blacklist entries listed in --file")]
    blacklist_delete: bool,

    #[arg(long, group = "operation", help = "Retrieve redactions")]
    redactions: bool,
    #[arg(long, group = "operation", help = "Add redactions from --file")]
    redactions_add: bool,
    #[arg(long, group = "operation", help = "Delete redactions listed in --file")]
    redactions_delete: bool,
}

impl Cli {
    fn operation(&self) -> Option<Operation> {
        use ConfigResource::*;
        [
            (self.agents, Operation::Agents),
            (self.feed, Operation::Feed),
            (self.whitelist_parameters, Operation::List(ParamWhitelist)),
            (self.whitelist_parameters_add, Operation::Add(ParamWhitelist)),
            (self.whitelist_parameters_delete, Operation::Delete(ParamWhitelist)),
            (self.whitelist_paths, Operation::List(PathWhitelist)),
            (self.whitelist_paths_add, Operation::Add(PathWhitelist)),
            (self.whitelist_paths_delete, Operation::Delete(PathWhitelist)),
            (self.whitelist, Operation::List(Whitelist)),
            (self.whitelist_add, Operation::Add(Whitelist)),
            (self.whitelist_delete, Operation::Delete(Whitelist)),
            (self.blacklist, Operation::List(Blacklist)),
            (self.blacklist_add, Operation::Add(Blacklist)),
            (self.blacklist_delete, Operation::Delete(Blacklist)),
            (self.redactions, Operation::List(Redactions)),
            (self.redactions_add, Operation::Add(Redactions)),
            (self.redactions_delete, Operation::Delete(Redactions)),
        ]
        .into_iter()
        .find_map(|(set, op)| set.then_some(op))
    }

    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            from: self.from.clone(),
            until: self.until.clone(),
            tags: self.tags.clone(),
            ctags: self.ctags.clone(),
            server: self.server.clone(),
            limit: self.limit,
            field: self.field.clone(),
            file: self.file.clone(),
            format: self.format.map(Into::into),
            sort: self.sort.map(Into::into),
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum FormatArg {
    Json,
    Csv,
}

impl From<FormatArg> for OutputFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Json => OutputFormat::Json,
            FormatArg::Csv => OutputFormat::Csv,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SortArg {
    Desc,
    Asc,
}

impl From<SortArg> for SortOrder {
    fn from(value: SortArg) -> Self {
        match value {
            SortArg::Desc => SortOrder::Desc,
            SortArg::Asc => SortOrder::Asc,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    if cli.list {
        println!("Supported tags:");
        for tag in SUPPORTED_TAGS {
            println!("\t{tag}");
        }
        return Ok(());
    }

    if let Some(shell) = cli.completions {
        use clap_complete::{generate, shells};
        let mut cmd = Cli::command();
        let bin = cmd.get_name().to_string();
        match shell {
            CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin, &mut std::io::stdout()),
            CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin, &mut std::io::stdout()),
            CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin, &mut std::io::stdout()),
            CompletionShell::PowerShell => {
                generate(shells::PowerShell, &mut cmd, bin, &mut std::io::stdout())
            }
        }
        return Ok(());
    }

    let cwd = std::env::current_dir().context("reading current directory")?;
    let env = |key: &str| std::env::var(key).ok();
    let operation = select_operation(cli.operation(), env);
    let resolved = resolve(&cwd, env, cli.overrides())?;

    if cli.show_config {
        let mut masked = resolved.clone();
        if !masked.client.password.is_empty() {
            masked.client.password = "*****".into();
        }
        print!("{}", serde_yaml::to_string(&masked)?);
        return Ok(());
    }

    run(&resolved, operation)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(resolved: &ResolvedConfig, operation: Operation) -> Result<()> {
    // Everything that can fail without the network is checked before login.
    if operation == Operation::Search
        && let Some(tags) = &resolved.filters.tags
    {
        validate_tags(tags)?;
    }
    let entries = if operation.requires_file() {
        let path = resolved
            .output
            .file
            .as_ref()
            .ok_or(ConfigError::MissingFile)?;
        Some(load_entries(path)?)
    } else {
        None
    };
    resolved.client.validate()?;

    let client = DashboardClient::new(&resolved.client)?;
    let session = client.authenticate(&resolved.client.email, &resolved.client.password)?;

    let result = dispatch(&client, &session, resolved, operation, entries.unwrap_or_default());

    if let Err(err) = client.logout(&session) {
        warn!("logout failed: {err:#}");
    }
    result
}

fn dispatch(
    client: &DashboardClient,
    session: &Session,
    resolved: &ResolvedConfig,
    operation: Operation,
    entries: Vec<serde_json::Map<String, serde_json::Value>>,
) -> Result<()> {
    match operation {
        Operation::Search => {
            let query = QuerySpec::for_search(&resolved.filters);
            let value = client.search(session, &query)?;
            Output::open(&resolved.output)?.search(&value)?;
        }
        Operation::Agents => {
            let value = client.agents(session)?;
            render_resource(&resolved.output, &value)?;
        }
        Operation::Feed => {
            let window = FeedWindow::from_filters(&resolved.filters, chrono::Utc::now());
            if resolved.output.format == OutputFormat::Csv {
                // Pages are still walked so API errors surface.
                client.feed(session, &window, |_| Ok(()))?;
                println!("{CSV_UNAVAILABLE}");
            } else {
                let mut output = Output::open(&resolved.output)?;
                client.feed(session, &window, |data| output.resource(data).map(|_| ()))?;
            }
        }
        Operation::List(resource) => {
            let value = client.list(session, resource)?;
            render_resource(&resolved.output, &value)?;
        }
        Operation::Add(resource) => {
            add_entries(client, session, resource, entries)?;
            println!("Post complete!");
        }
        Operation::Delete(resource) => {
            delete_entries(client, session, resource, entries)?;
            println!("Delete complete!");
        }
    }
    Ok(())
}

fn render_resource(spec: &OutputSpec, value: &serde_json::Value) -> Result<()> {
    // Nothing is opened for a format the resource cannot be written in.
    if spec.format == OutputFormat::Csv {
        println!("{CSV_UNAVAILABLE}");
        return Ok(());
    }
    Output::open(spec)?.resource(value)?;
    Ok(())
}
