extern crate clap;
#[macro_use] extern crate derive_more;
extern crate rir_stats_table;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use clap::App;
use clap::Arg;
use clap::ArgMatches;
use clap::SubCommand;
use rir_stats_table::config::Config;
use rir_stats_table::config::ConfigError;
use rir_stats_table::ip::IpAddress;
use rir_stats_table::lookup::LookupTable;
use rir_stats_table::publish::PublishError;
use rir_stats_table::publish::TablePublisher;
use rir_stats_table::refresh::RefreshError;
use rir_stats_table::refresh::Refresher;
use rir_stats_table::report::LookupReport;
use rir_stats_table::report::ReportFormat;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;


fn main() {
    match Options::create() {
        Err(e) => {
            eprintln!("{}", e);
            ::std::process::exit(1);
        },
        Ok(options) => {
            init_logging(options.verbose);
            if let Err(e) = options.execute() {
                eprintln!("{}", e);
                ::std::process::exit(1);
            }
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}


//------------ Options -------------------------------------------------------

enum Command {
    Refresh,
    Watch,
    Lookup(IpAddress),
}

struct Options {
    config: Config,
    format: ReportFormat,
    verbose: bool,
    command: Command,
}

impl Options {
    pub fn create() -> Result<Self, Error> {
        let matches = App::new("rirstats")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Builds one CIDR table from the delegated stats of the RIRs")
            .arg(Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON config file. Defaults apply without one.")
                .global(true)
                .required(false))
            .arg(Arg::with_name("output")
                .short("o")
                .long("output")
                .value_name("FILE")
                .help("Published table, overrides the config.")
                .global(true)
                .required(false))
            .arg(Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("json | text")
                .help("Specify output format, defaults to json")
                .global(true)
                .required(false))
            .arg(Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log at debug level unless RUST_LOG says otherwise")
                .global(true))
            .subcommand(SubCommand::with_name("refresh")
                .about("Run one refresh cycle and publish the table"))
            .subcommand(SubCommand::with_name("watch")
                .about("Refresh on the configured interval"))
            .subcommand(SubCommand::with_name("lookup")
                .about("Find the entries of the published table covering an address")
                .arg(Arg::with_name("address")
                    .value_name("ADDRESS")
                    .help("IPv4 or IPv6 address")
                    .required(true)))
            .get_matches();

        let (command, sub) = match matches.subcommand() {
            ("refresh", Some(sub)) => (Command::Refresh, sub),
            ("watch", Some(sub)) => (Command::Watch, sub),
            ("lookup", Some(sub)) => {
                let addr = sub.value_of("address").unwrap_or_default();
                let addr = IpAddress::from_str(addr)
                    .map_err(|_| Error::WithMessage(format!("Invalid address: {}", addr)))?;
                (Command::Lookup(addr), sub)
            }
            _ => return Err(Error::msg("No sub-command given. See --help for options."))
        };

        Self::from_matches(sub, command)
    }

    fn from_matches(matches: &ArgMatches, command: Command) -> Result<Self, Error> {
        let mut config = match matches.value_of("config") {
            Some(path) => Config::from_file(&PathBuf::from(path))?,
            None => Config::default()
        };
        if let Some(output) = matches.value_of("output") {
            config.output = PathBuf::from(output);
        }

        let format = match matches.value_of("format") {
            Some(format) => ReportFormat::from_str(format).map_err(Error::WithMessage)?,
            None => ReportFormat::default()
        };

        Ok(Options {
            config,
            format,
            verbose: matches.is_present("verbose"),
            command
        })
    }

    fn execute(self) -> Result<(), Error> {
        match self.command {
            Command::Refresh => {
                let runtime = tokio::runtime::Runtime::new()?;
                let report = runtime.block_on(async {
                    Refresher::new(&self.config)?.run_cycle().await
                })?;
                self.format.print(&report)?;
            }
            Command::Watch => {
                let runtime = tokio::runtime::Runtime::new()?;
                let every = self.config.refresh_interval();
                runtime.block_on(async {
                    let refresher = Arc::new(Refresher::new(&self.config)?);
                    refresher.watch(every).await;
                    Ok::<(), RefreshError>(())
                })?;
            }
            Command::Lookup(addr) => {
                let publisher = TablePublisher::new(&self.config.output);
                let table = publisher.load()?.ok_or_else(|| {
                    Error::WithMessage(format!(
                        "No table published at {}", publisher.path().display()
                    ))
                })?;
                let table = LookupTable::from(table);
                let report = LookupReport::new(addr.to_string(), &table.covering(addr));
                self.format.print(&report)?;
            }
        }
        Ok(())
    }
}


//------------ Error --------------------------------------------------------

#[derive(Debug, Display)]
pub enum Error {
    #[display(fmt = "{}", _0)]
    WithMessage(String),

    #[display(fmt = "{}", _0)]
    Config(ConfigError),

    #[display(fmt = "{}", _0)]
    Refresh(RefreshError),

    #[display(fmt = "{}", _0)]
    Publish(PublishError),

    #[display(fmt = "{}", _0)]
    Io(std::io::Error),

    #[display(fmt = "{}", _0)]
    Json(serde_json::Error),
}

impl Error {
    pub fn msg(s: &str) -> Self {
        Error::WithMessage(s.to_string())
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self { Error::Config(e) }
}

impl From<RefreshError> for Error {
    fn from(e: RefreshError) -> Self { Error::Refresh(e) }
}

impl From<PublishError> for Error {
    fn from(e: PublishError) -> Self { Error::Publish(e) }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self { Error::Io(e) }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self { Error::Json(e) }
}
