use std::collections::BTreeMap;

use async_nilan_nabto::{
    run_probe, run_setpoint_write, DeviceClient, Error, GatewayConfig, Overrides, Result,
    Settings,
};

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};

use log::trace;

use serde::Serialize;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            Ok(())
        }
        Err(err) => Err(Error::Config(format!("Unable to serialize report: {}", err))),
    }
}

fn overrides_from(matches: &ArgMatches<'_>) -> Result<Overrides> {
    let port = match matches.value_of("port") {
        Some(port) => match port.parse::<u16>() {
            Ok(port) => Some(port),
            Err(err) => return Err(Error::Config(format!("Unable to parse port number: {}", err))),
        },
        None => None,
    };

    Ok(Overrides {
        email: matches.value_of("email").map(str::to_string),
        host: matches.value_of("host").map(str::to_string),
        port,
        device_id: matches.value_of("device_id").map(str::to_string),
    })
}

async fn run() -> Result<i32> {
    let matches = App::new("nilan_nabto")
        .version("0.1")
        .author("Daniel Wippermann <daniel.wippermann@gmail.com>")
        .about("Discover, probe and configure Nilan / Genvex controllers")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(Arg::with_name("settings")
            .long("settings")
            .value_name("FILE")
            .help("Set a settings TOML filename")
            .takes_value(true))
        .arg(Arg::with_name("email")
            .long("email")
            .value_name("EMAIL")
            .help("Set the email authorized in the vendor app")
            .takes_value(true))
        .arg(Arg::with_name("host")
            .long("host")
            .value_name("HOST")
            .help("Set the host to communicate with, bypasses discovery")
            .takes_value(true))
        .arg(Arg::with_name("port")
            .long("port")
            .value_name("PORT")
            .help("Set the port to communicate with")
            .takes_value(true))
        .arg(Arg::with_name("device_id")
            .long("device-id")
            .value_name("DEVICE_ID")
            .help("Set the device id to connect to")
            .takes_value(true))
        .subcommand(SubCommand::with_name("discover")
            .about("List all controllers answering a discovery"))
        .subcommand(SubCommand::with_name("probe")
            .about("Connect and print all datapoints and setpoints"))
        .subcommand(SubCommand::with_name("set")
            .about("Write a setpoint and verify it")
            .arg(Arg::with_name("key")
                .required(true)
                .index(1))
            .arg(Arg::with_name("value")
                .required(true)
                .index(2)))
        .get_matches();

    let settings = match matches.value_of("settings") {
        Some(filename) => Settings::load(filename)?,
        None => Settings::default(),
    };

    let overrides = overrides_from(&matches)?;

    match matches.subcommand() {
        ("discover", _) => {
            let mut client = DeviceClient::new("", settings.client.clone());
            let result = client.discover(true).await;
            client.close().await;

            let devices = result?
                .into_iter()
                .map(|(id, addr)| (id, (addr.ip().to_string(), addr.port())))
                .collect::<BTreeMap<_, _>>();

            print_json(&devices)?;
            Ok(if devices.is_empty() { 2 } else { 0 })
        }
        ("probe", _) => {
            let gateway = GatewayConfig::resolve(&overrides, &settings)?;
            trace!("Probing with {:?}", gateway);

            let report = run_probe(&gateway, &settings.client).await;
            print_json(&report)?;
            Ok(if report.ok { 0 } else { 2 })
        }
        ("set", Some(sub_matches)) => {
            let gateway = GatewayConfig::resolve(&overrides, &settings)?;

            let key = sub_matches.value_of("key").unwrap_or_default();
            let value = match sub_matches.value_of("value").unwrap_or_default().parse::<f64>() {
                Ok(value) => value,
                Err(err) => return Err(Error::Config(format!("Unable to parse value: {}", err))),
            };

            trace!("Setting {} to {} with {:?}", key, value, gateway);
            let report = run_setpoint_write(&gateway, &settings.client, key, value).await;
            print_json(&report)?;

            Ok(match report.connection_error.as_deref() {
                None => 0,
                Some("setpoint_readback_mismatch") => 1,
                Some(_) => 2,
            })
        }
        _ => Err(Error::Config("No command given".into())),
    }
}

fn main() {
    env_logger::init();

    let code = match async_std::task::block_on(run()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {}", err);
            2
        }
    };

    std::process::exit(code);
}
