//! Application definition.

extern crate simplelog;

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Error, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;

use spindle_core::Op;
use spindle_net::{
    ConnectOutcome, ConnectionSetup, Deployment, DeploymentConfig, WorkerConnection, WorkerRole,
    WorkerUrl,
};

use crate::check;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");

pub fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("spindle")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .version(VERSION)
        .author(AUTHORS)
        .about("Run local spindle deployments and connect workers to them.")
        .arg(Arg::with_name("verbosity")
            .long("verbosity")
            .short("v")
            .takes_value(true)
            .default_value("info")
            .value_name("verb")
            .global(true)
            .help("Set the verbosity of the log output"))

        // deployment subcommand
        .subcommand(SubCommand::with_name("deployment")
            .display_order(10)
            .about("Start a local deployment")
            .arg(Arg::with_name("config")
                .value_name("path")
                .help("Path to the deployment config file (toml)"))
            .arg(Arg::with_name("name")
                .long("name")
                .short("n")
                .takes_value(true)
                .help("Set the name of the deployment"))
            .arg(Arg::with_name("receptionist")
                .long("receptionist")
                .short("r")
                .takes_value(true)
                .value_name("address")
                .help("Set the address workers connect to directly"))
            .arg(Arg::with_name("locator")
                .long("locator")
                .short("l")
                .takes_value(true)
                .value_name("address")
                .help("Start a locator on the given address"))
            .arg(Arg::with_name("login-token")
                .long("login-token")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Accepted login token, can be used multiple times"))
            .arg(Arg::with_name("player-identity-token")
                .long("pit")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Accepted player identity token, can be used multiple times"))
            .arg(Arg::with_name("flag")
                .long("flag")
                .short("f")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .value_name("name=value")
                .help("Deployment flag sent to every worker"))
            .arg(Arg::with_name("max-workers")
                .long("max-workers")
                .takes_value(true)
                .help("Maximum number of connected workers"))
            .arg(Arg::with_name("keep-alive")
                .long("keep-alive")
                .short("k")
                .takes_value(true)
                .value_name("millis")
                .help("Remove workers silent for longer than this, 0 keeps them forever")))

        // worker subcommand
        .subcommand(SubCommand::with_name("worker")
            .display_order(20)
            .about("Connect a worker echoing back all received commands")
            .arg(Arg::with_name("url")
                .value_name("url")
                .default_value("127.0.0.1")
                .help("Deployment url, e.g. `127.0.0.1:7777` or `locator.example.com?token=abc`"))
            .arg(Arg::with_name("type")
                .long("type")
                .short("t")
                .takes_value(true)
                .default_value("Managed")
                .help("Worker type"))
            .arg(Arg::with_name("role")
                .long("role")
                .takes_value(true)
                .possible_values(&["client", "server"])
                .default_value("server")
                .help("Worker role"))
            .arg(Arg::with_name("context-id")
                .long("context-id")
                .short("c")
                .takes_value(true)
                .default_value("0")
                .help("Number appended to the worker type to make up the worker id"))
            .arg(Arg::with_name("locatorHost")
                .long("locatorHost")
                .takes_value(true)
                .help("Override the locator host")))

        // check subcommand
        .subcommand(SubCommand::with_name("check")
            .display_order(30)
            .about("Connect with both roles and exercise entity requests")
            .arg(Arg::with_name("url")
                .value_name("url")
                .help("Deployment url, a local deployment is started if not provided"))
            .arg(Arg::with_name("type")
                .long("type")
                .short("t")
                .takes_value(true)
                .default_value("Managed")
                .help("Worker type"))
            .arg(Arg::with_name("timeout")
                .long("timeout")
                .takes_value(true)
                .value_name("secs")
                .default_value("10")
                .help("Time limit for every single step")))
}

pub fn init() -> ArgMatches<'static> {
    app().get_matches()
}

/// Runs based on specified subcommand.
pub fn start(matches: ArgMatches) -> Result<()> {
    match matches.subcommand() {
        ("deployment", Some(m)) => start_deployment(m),
        ("worker", Some(m)) => start_worker(m),
        ("check", Some(m)) => start_check(m),
        _ => Ok(()),
    }
}

/// Sets up a flag flipped on ctrl-c.
fn running_flag() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;
    Ok(running)
}

fn start_deployment(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);

    let mut config = match matches.value_of("config") {
        Some(path) => DeploymentConfig::from_path(path)?,
        None => DeploymentConfig::default(),
    };
    if let Some(name) = matches.value_of("name") {
        config.name = name.to_string();
    }
    if let Some(addr) = matches.value_of("receptionist") {
        config.receptionist_addr = addr.to_string();
    }
    if let Some(addr) = matches.value_of("locator") {
        config.locator_addr = Some(addr.to_string());
    }
    if let Some(tokens) = matches.values_of("login-token") {
        config.login_tokens.extend(tokens.map(|s| s.to_string()));
    }
    if let Some(tokens) = matches.values_of("player-identity-token") {
        config
            .player_identity_tokens
            .extend(tokens.map(|s| s.to_string()));
    }
    if let Some(flags) = matches.values_of("flag") {
        for flag in flags {
            let mut split = flag.splitn(2, '=');
            match (split.next(), split.next()) {
                (Some(name), Some(value)) if !name.is_empty() => {
                    config.flags.insert(name.to_string(), value.to_string());
                }
                _ => return Err(Error::msg(format!("invalid flag: {}, expected name=value", flag))),
            }
        }
    }
    if let Some(max) = matches.value_of("max-workers") {
        config.max_workers = Some(max.parse()?);
    }
    if let Some(millis) = matches.value_of("keep-alive") {
        config.worker_keepalive_ms = millis.parse()?;
    }

    let deployment = Deployment::start(config)?;
    if !deployment.wait_until_running(Duration::from_secs(5)) {
        return Err(Error::msg("deployment failed to start"));
    }
    println!(
        "deployment {} running, receptionist listening on: {}",
        deployment.name().bold(),
        deployment.receptionist_addr()
    );
    if let Some(addr) = deployment.locator_addr() {
        println!("locator listening on: {}", addr);
    }

    let running = running_flag()?;
    let mut last_report = Instant::now();
    while running.load(Ordering::SeqCst) && deployment.is_running() {
        thread::sleep(Duration::from_millis(100));
        if last_report.elapsed() > Duration::from_secs(10) {
            last_report = Instant::now();
            let status = deployment.status();
            info!(
                "uptime {}s, {} workers, {} entities",
                status.uptime.as_secs(),
                status.workers.len(),
                status.entity_count
            );
        }
    }

    println!("Initiating graceful shutdown...");
    deployment.stop();
    if !deployment.wait_until_stopped(Duration::from_secs(5)) {
        warn!("deployment didn't stop in time");
    }
    Ok(())
}

fn start_worker(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);

    let url: WorkerUrl = matches.value_of("url").unwrap_or_default().parse()?;
    let worker_type = matches.value_of("type").unwrap_or("Managed");
    let role: WorkerRole = matches.value_of("role").unwrap_or("server").parse()?;
    let context_id: u32 = matches.value_of("context-id").unwrap_or("0").parse()?;
    let args: Vec<String> = match matches.value_of("locatorHost") {
        Some(host) => vec!["-locatorHost".to_string(), host.to_string()],
        None => Vec::new(),
    };
    let setup = ConnectionSetup::from_url(&url, worker_type, &args)?;

    let mut connection = WorkerConnection::new(setup);
    print!("connecting as {}{} ({})... ", worker_type, context_id, role);
    std::io::stdout().flush()?;
    match connection.connect(role, context_id)?.wait() {
        ConnectOutcome::Connected => println!("{}", "connected".green()),
        ConnectOutcome::Failed { code, message } => {
            println!("{}", "failed".red());
            return Err(Error::msg(format!("{}: {}", code, message)));
        }
    }

    let running = running_flag()?;
    while running.load(Ordering::SeqCst) {
        for op_list in connection.get_op_list() {
            for op in op_list {
                match op {
                    Op::CommandRequest {
                        request_id,
                        payload,
                        caller_worker_id,
                        ..
                    } => {
                        debug!("echoing command {} from {}", request_id, caller_worker_id);
                        connection.send_command_response(request_id, payload)?;
                    }
                    Op::LogMessage { level, message } => {
                        log!(level.as_log_level(), "runtime: {}", message)
                    }
                    Op::Disconnect { code, reason } => {
                        println!("disconnected: {} ({})", reason, code);
                        return Ok(());
                    }
                    op => debug!("{:?}", op),
                }
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
    connection.disconnect();
    Ok(())
}

fn start_check(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);
    let url = match matches.value_of("url") {
        Some(u) => Some(u.parse::<WorkerUrl>()?),
        None => None,
    };
    let timeout = Duration::from_secs(matches.value_of("timeout").unwrap_or("10").parse()?);
    check::run(url, matches.value_of("type").unwrap_or("Managed"), timeout)
}

fn setup_log_verbosity(matches: &ArgMatches) {
    use self::simplelog::{LevelFilter, TermLogger};
    let level_filter = match matches.value_of("verbosity") {
        Some(s) => match s {
            "0" | "none" => LevelFilter::Off,
            "1" | "err" | "error" | "min" => LevelFilter::Error,
            "2" | "warn" | "warning" | "default" => LevelFilter::Warn,
            "3" | "info" => LevelFilter::Info,
            "4" | "debug" => LevelFilter::Debug,
            "5" | "trace" | "max" | "all" => LevelFilter::Trace,
            _ => LevelFilter::Warn,
        },
        _ => LevelFilter::Warn,
    };
    let mut config_builder = simplelog::ConfigBuilder::new();
    let logger_conf = config_builder
        .set_time_level(LevelFilter::Error)
        .set_target_level(LevelFilter::Debug)
        .set_location_level(LevelFilter::Off)
        .set_time_format_str("%H:%M:%S%.6f")
        .build();
    if TermLogger::init(level_filter, logger_conf, simplelog::TerminalMode::Mixed).is_err() {
        eprintln!("failed initializing logger");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subcommands_parse() {
        let matches = app()
            .get_matches_from_safe(vec![
                "spindle",
                "deployment",
                "--flag",
                "a=1",
                "--flag",
                "b=2",
                "--login-token",
                "secret",
            ])
            .unwrap();
        let (name, sub) = matches.subcommand();
        assert_eq!(name, "deployment");
        let flags: Vec<&str> = sub.unwrap().values_of("flag").unwrap().collect();
        assert_eq!(flags, vec!["a=1", "b=2"]);

        let matches = app()
            .get_matches_from_safe(vec!["spindle", "worker", "--role", "client"])
            .unwrap();
        let sub = matches.subcommand_matches("worker").unwrap();
        assert_eq!(sub.value_of("url"), Some("127.0.0.1"));
        assert_eq!(sub.value_of("role"), Some("client"));

        assert!(app()
            .get_matches_from_safe(vec!["spindle", "worker", "--role", "observer"])
            .is_err());
    }
}
