use std::{
    fmt::Display,
    io::{stdout, Write},
    time::Duration,
};

use anyhow::{anyhow, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use client::{Client, ClientError};
use config::{ClientConfig, Credentials, Endpoint, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_TIMEOUT};
use protocol::{ErrorCode, InstantCommand, Value, Variable};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use util::{exit_code_for, fatal};

mod client;
mod config;
#[cfg(test)]
mod mock_server;
mod protocol;
mod tcp_util;
mod transport;
mod util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageType {
    VoltageIn,
    VoltageOut,
    CurrentOut,
    Power,
}

impl UsageType {
    pub fn from_string(string: &str) -> Option<Self> {
        match string {
            "vin" | "volt_in" | "voltage_in" => Some(Self::VoltageIn),
            "vout" | "volt_out" | "voltage_out" => Some(Self::VoltageOut),
            "cout" | "cur_out" | "current_out" => Some(Self::CurrentOut),
            "pwr" | "power" => Some(Self::Power),
            _ => None,
        }
    }
    /// The variable read directly, `None` for power which may need two reads.
    pub fn variable(&self) -> Option<Variable> {
        match self {
            Self::VoltageIn => Some(Variable::InputVoltage),
            Self::VoltageOut => Some(Variable::OutputVoltage),
            Self::CurrentOut => Some(Variable::OutputCurrent),
            Self::Power => None,
        }
    }
}

impl Display for UsageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::VoltageIn => "voltage_in",
                Self::VoltageOut => "voltage_out",
                Self::CurrentOut => "current_out",
                Self::Power => "power",
            }
        )
    }
}

fn parse_usage_type(string: &str) -> Result<UsageType, String> {
    UsageType::from_string(string).ok_or_else(|| format!("invalid usage type value: {string}"))
}

pub enum Reading {
    Variable { variable: Variable, value: Value },
    RealPower(Value),
    /// Output voltage and current of a UPS that does not report real power.
    DerivedPower { voltage: Value, current: Value },
}

fn parse_number(variable: Variable, value: &Value) -> anyhow::Result<f64> {
    value
        .parse::<f64>()
        .with_context(|| format!("{variable} is not numeric: {:?}", value.as_str()))
}

impl Reading {
    pub fn render(&self) -> anyhow::Result<String> {
        Ok(match self {
            Self::Variable { variable, value } => format!("{variable}: {value}"),
            Self::RealPower(watts) => {
                format!("power: {:.2} W", parse_number(Variable::RealPower, watts)?)
            }
            Self::DerivedPower { voltage, current } => {
                let power: f64 = parse_number(Variable::OutputVoltage, voltage)?
                    * parse_number(Variable::OutputCurrent, current)?;
                format!("power: {power:.2} W")
            }
        })
    }
}

fn read_usage(
    client: &mut Client,
    ups: &str,
    usage_type: UsageType,
) -> Result<Reading, ClientError> {
    if let Some(variable) = usage_type.variable() {
        let value: Value = client.get_var(ups, variable.name())?;
        return Ok(Reading::Variable { variable, value });
    }
    match client.get_var(ups, Variable::RealPower.name()) {
        Ok(watts) => Ok(Reading::RealPower(watts)),
        Err(err) if err.code() == Some(&ErrorCode::VarNotSupported) => {
            debug!(ups, "real power not reported, deriving it from output voltage and current");
            Ok(Reading::DerivedPower {
                voltage: client.get_var(ups, Variable::OutputVoltage.name())?,
                current: client.get_var(ups, Variable::OutputCurrent.name())?,
            })
        }
        Err(err) => Err(err),
    }
}

fn usage(
    config: &ClientConfig,
    ups: &str,
    usage_types: &[UsageType],
    out: &mut impl Write,
) -> anyhow::Result<()> {
    Client::session(config, |client| {
        for usage_type in usage_types {
            let reading: Reading = read_usage(client, ups, *usage_type)?;
            writeln!(out, "{}", reading.render()?).context("cannot write to stdout")?;
        }
        Ok(())
    })
}

fn run_command(config: &ClientConfig, ups: &str, command: InstantCommand) -> anyhow::Result<()> {
    Client::session(config, |client| client.run_command(ups, command))
        .with_context(|| format!("{command} failed on {ups}"))
}

fn read_credentials(args: &ArgMatches) -> anyhow::Result<Option<Credentials>> {
    let Some(username) = args.get_one::<String>("username") else {
        return Ok(None);
    };
    let password: String = match args.get_one::<String>("password") {
        Some(password) => password.to_owned(),
        None => rpassword::prompt_password("Enter password: ").context("cannot read password")?,
    };
    Ok(Some(Credentials::new(username.as_str(), password)))
}

fn build_config(args: &ArgMatches) -> anyhow::Result<ClientConfig> {
    let host: &str = args
        .get_one::<String>("server")
        .map(String::as_str)
        .unwrap_or(DEFAULT_HOST);
    let port: u16 = args.get_one::<u16>("port").copied().unwrap_or(DEFAULT_PORT);
    let timeout: Duration = args
        .get_one::<u64>("timeout")
        .map(|timeout_ms: &u64| Duration::from_millis(*timeout_ms))
        .unwrap_or(DEFAULT_TIMEOUT);
    let credentials: Option<Credentials> = read_credentials(args)?;
    Ok(ClientConfig::new(Endpoint::new(host, port, timeout)).with_credentials(credentials))
}

fn cli() -> Command {
    Command::new("nutcon")
        .about("A simple Network UPS Tools client written in rust")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg(
            Arg::new("server")
                .help(format!("NUT server host name (default: {})", DEFAULT_HOST))
                .short('s')
                .long("server")
                .env("NUT_HOST"),
        )
        .arg(
            Arg::new("port")
                .help(format!("NUT server TCP port (default: {})", DEFAULT_PORT))
                .short('p')
                .long("port")
                .env("NUT_PORT")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("ups_name")
                .help("name of the UPS")
                .required(true)
                .short('u')
                .long("ups-name")
                .env("NUT_UPS"),
        )
        .arg(
            Arg::new("username")
                .help("NUT server user name that has the permission to run INSTCMD")
                .short('n')
                .long("username")
                .env("NUT_USERNAME"),
        )
        .arg(
            Arg::new("password")
                .help("NUT server password (prompted when a username is given without it)")
                .short('w')
                .long("password")
                .env("NUT_PASSWORD")
                .hide_env_values(true)
                .requires("username"),
        )
        .arg(
            Arg::new("timeout")
                .help(format!(
                    "timeout of each network operation in ms (default: {} ms)",
                    DEFAULT_TIMEOUT.as_millis()
                ))
                .short('t')
                .long("timeout")
                .value_parser(value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("debug")
                .help("enable debug output of network traffic")
                .short('d')
                .long("debug")
                .action(ArgAction::SetTrue),
        )
        .subcommand(Command::new("load-off").about("Turn load off on UPS"))
        .subcommand(Command::new("load-on").about("Turn load on on UPS"))
        .subcommand(
            Command::new("usage").about("Fetch usage data").arg(
                Arg::new("usage_types")
                    .help("allowed values: voltage_in, voltage_out, current_out, power")
                    .required(true)
                    .num_args(1..)
                    .value_parser(parse_usage_type),
            ),
        )
}

fn init_tracing(debug: bool) {
    let filter: &str = if debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(args: &ArgMatches) -> anyhow::Result<()> {
    let config: ClientConfig = build_config(args)?;
    let ups: &str = args
        .get_one::<String>("ups_name")
        .map(String::as_str)
        .ok_or_else(|| anyhow!("missing UPS name"))?;
    debug!(endpoint = %config.endpoint, ups, "starting");
    match args.subcommand() {
        Some(("load-on", _)) => run_command(&config, ups, InstantCommand::LoadOn),
        Some(("load-off", _)) => run_command(&config, ups, InstantCommand::LoadOff),
        Some(("usage", usage_args)) => {
            let usage_types: Vec<UsageType> = usage_args
                .get_many::<UsageType>("usage_types")
                .into_iter()
                .flatten()
                .copied()
                .collect();
            usage(&config, ups, &usage_types, &mut stdout().lock())
        }
        Some((other, _)) => Err(anyhow!("unknown command: {other}")),
        None => Err(anyhow!("no command given")),
    }
}

pub fn main() {
    let args: ArgMatches = cli().get_matches();
    init_tracing(args.get_flag("debug"));
    if let Err(err) = run(&args) {
        fatal(&format!("{err:#}"), exit_code_for(&err));
    }
}
