use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use spacepark::client::{ClientError, FeeReply};
use spacepark::config::{ServerConfig, DEFAULT_CONFIG_FILE, DEFAULT_DB_FILE};
use spacepark::ledger::LedgerStore;
use spacepark::{DockClient, SqliteLedger, Status};
use std::path::Path;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "5000";

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> CliResult {
    let matches = App::new("spacepark")
        .version("0.1.0")
        .author("Space Systems Engineering Team")
        .about("🚀 Spacepark - dock coordination client and provisioning tool")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Server host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Server port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("db")
                .short("d")
                .long("db")
                .value_name("PATH")
                .help("Ledger database file for provisioning commands")
                .takes_value(true)
                .default_value(DEFAULT_DB_FILE)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "json"])
                .default_value("table")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("query")
                .about("🔍 Ask the server for a free dock")
                .arg(Arg::with_name("weight").help("Ship weight").required(true).index(1)),
        )
        .subcommand(
            SubCommand::with_name("dock")
                .about("🛬 Dock a ship at a pad")
                .arg(Arg::with_name("dock_id").help("Pad id").required(true).index(1))
                .arg(Arg::with_name("weight").help("Ship weight").required(true).index(2))
                .arg(
                    Arg::with_name("license")
                        .help("Ship license (up to 64 bytes)")
                        .required(true)
                        .index(3),
                ),
        )
        .subcommand(
            SubCommand::with_name("undock")
                .about("🛫 Undock the ship at a pad and show the fee")
                .arg(Arg::with_name("dock_id").help("Pad id").required(true).index(1)),
        )
        .subcommand(
            SubCommand::with_name("fee")
                .about("💰 Show the current fee for a docked ship")
                .arg(Arg::with_name("dock_id").help("Pad id").required(true).index(1)),
        )
        .subcommand(
            SubCommand::with_name("default-config")
                .about("Write a default server configuration file")
                .arg(
                    Arg::with_name("path")
                        .help("Where to write the file")
                        .default_value(DEFAULT_CONFIG_FILE)
                        .index(1),
                ),
        )
        .subcommand(SubCommand::with_name("init").about("Create or upgrade the ledger schema"))
        .subcommand(
            SubCommand::with_name("add-terminal")
                .about("Add a terminal")
                .arg(Arg::with_name("name").required(true).index(1)),
        )
        .subcommand(
            SubCommand::with_name("add-pad")
                .about("Add a pad to a terminal")
                .arg(Arg::with_name("terminal_id").required(true).index(1))
                .arg(Arg::with_name("max_weight").required(true).index(2))
                .arg(Arg::with_name("cost_hour").required(true).index(3))
                .arg(Arg::with_name("cost_day").required(true).index(4)),
        )
        .subcommand(
            SubCommand::with_name("remove-pad")
                .about("Remove a pad and any ship docked there")
                .arg(Arg::with_name("pad_id").required(true).index(1)),
        )
        .subcommand(
            SubCommand::with_name("dump").about("📋 Print terminals, pads and docked ships"),
        )
        .subcommand(
            SubCommand::with_name("log")
                .about("📜 Print the docking log")
                .arg(Arg::with_name("pad_id").help("Only this pad").index(1)),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let db = matches.value_of("db").unwrap_or(DEFAULT_DB_FILE);
    let json = matches.value_of("format") == Some("json");

    match matches.subcommand() {
        ("query", Some(sub)) => handle_query(sub, host, port, json).await,
        ("dock", Some(sub)) => handle_dock(sub, host, port, json).await,
        ("undock", Some(sub)) => handle_undock(sub, host, port, json).await,
        ("fee", Some(sub)) => handle_fee(sub, host, port, json).await,
        ("default-config", Some(sub)) => {
            let path = sub.value_of("path").unwrap_or(DEFAULT_CONFIG_FILE);
            ServerConfig::write_default(path)?;
            println!("{} Default configuration written to {}", "✅".green(), path.bright_white());
            Ok(())
        }
        ("init", _) => {
            SqliteLedger::open(db)?;
            println!("{} Ledger initialized at {}", "✅".green(), db.bright_white());
            Ok(())
        }
        ("add-terminal", Some(sub)) => {
            let ledger = SqliteLedger::open(db)?;
            let id = ledger.add_terminal(required(sub, "name")?)?;
            println!("{} Added terminal {}", "✅".green(), id.to_string().bright_white());
            Ok(())
        }
        ("add-pad", Some(sub)) => {
            let ledger = SqliteLedger::open(db)?;
            let terminal_id: i64 = required(sub, "terminal_id")?.parse()?;
            let max_weight: f64 = required(sub, "max_weight")?.parse()?;
            let cost_hour: i64 = required(sub, "cost_hour")?.parse()?;
            let cost_day: i64 = required(sub, "cost_day")?.parse()?;
            let id = ledger.add_pad(terminal_id, max_weight, cost_hour, cost_day)?;
            println!("{} Added pad {}", "✅".green(), id.to_string().bright_white());
            Ok(())
        }
        ("remove-pad", Some(sub)) => {
            let ledger = SqliteLedger::open(db)?;
            let id: i32 = required(sub, "pad_id")?.parse()?;
            if ledger.remove_pad(id)? {
                println!("{} Removed pad {}", "✅".green(), id);
            } else {
                println!("{} No pad {}", "⚠️".yellow(), id);
            }
            Ok(())
        }
        ("dump", _) => handle_dump(db, json),
        ("log", Some(sub)) => handle_log(sub, db, json),
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            Ok(())
        }
    }
}

fn required<'a>(
    matches: &'a ArgMatches<'_>,
    name: &str,
) -> Result<&'a str, Box<dyn std::error::Error>> {
    matches
        .value_of(name)
        .ok_or_else(|| format!("missing argument <{}>", name).into())
}

async fn connect(host: &str, port: u16) -> Result<DockClient, Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", host, port);
    match DockClient::connect(addr.as_str()).await {
        Ok(client) => Ok(client),
        Err(ClientError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            eprintln!("{} Failed to connect to {}", "❌".red(), addr.bright_white());
            eprintln!("{} Server is not running. Start it with:", "💡".yellow());
            eprintln!("   {}", "spacepark-server".bright_cyan());
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_status(status: Status) {
    if status.is_ok() {
        println!("{} {}", "✅".green(), "OK".bright_green().bold());
    } else {
        println!("{} {}", "❌".red(), status.to_string().bright_red());
    }
}

async fn handle_query(sub: &ArgMatches<'_>, host: &str, port: u16, json: bool) -> CliResult {
    let weight: f32 = required(sub, "weight")?.parse()?;
    let mut client = connect(host, port).await?;
    let found = client.query(weight).await?;

    if json {
        println!("{}", serde_json::json!({ "weight": weight, "dock_id": found }));
        return Ok(());
    }
    match found {
        Some(id) => println!(
            "{} Free dock: {}",
            "🛰️".cyan(),
            id.to_string().bright_white().bold()
        ),
        None => println!("{} No free dock for weight {}", "⚠️".yellow(), weight),
    }
    Ok(())
}

async fn handle_dock(sub: &ArgMatches<'_>, host: &str, port: u16, json: bool) -> CliResult {
    let dock_id: i32 = required(sub, "dock_id")?.parse()?;
    let weight: f32 = required(sub, "weight")?.parse()?;
    let license = required(sub, "license")?;

    let mut client = connect(host, port).await?;
    let status = client.dock(dock_id, weight, license).await?;

    if json {
        println!("{}", serde_json::json!({ "dock_id": dock_id, "status": status }));
    } else {
        print_status(status);
    }
    Ok(())
}

async fn handle_undock(sub: &ArgMatches<'_>, host: &str, port: u16, json: bool) -> CliResult {
    let dock_id: i32 = required(sub, "dock_id")?.parse()?;
    let mut client = connect(host, port).await?;
    let reply = client.undock(dock_id).await?;
    print_fee_reply(dock_id, reply, json);
    Ok(())
}

async fn handle_fee(sub: &ArgMatches<'_>, host: &str, port: u16, json: bool) -> CliResult {
    let dock_id: i32 = required(sub, "dock_id")?.parse()?;
    let mut client = connect(host, port).await?;
    let reply = client.fee(dock_id).await?;
    print_fee_reply(dock_id, reply, json);
    Ok(())
}

fn print_fee_reply(dock_id: i32, reply: FeeReply, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::json!({ "dock_id": dock_id, "status": reply.status, "fee": reply.fee })
        );
        return;
    }
    print_status(reply.status);
    if let Some(fee) = reply.fee {
        println!("{} Fee: {}", "💰".yellow(), fee.to_string().bright_white().bold());
    }
}

fn open_existing(db: &str) -> Result<SqliteLedger, Box<dyn std::error::Error>> {
    if !Path::new(db).exists() {
        return Err(format!("ledger database {} does not exist; run `spacepark init`", db).into());
    }
    Ok(SqliteLedger::open(db)?)
}

fn handle_dump(db: &str, json: bool) -> CliResult {
    let ledger = open_existing(db)?;
    let terminals = ledger.terminals()?;
    let pads = ledger.pads()?;
    let ships = ledger.ships()?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "terminals": terminals,
                "pads": pads,
                "ships": ships,
            }))?
        );
        return Ok(());
    }

    println!("{}", "Terminals".bright_blue().bold());
    for terminal in &terminals {
        println!("  {:>4}  {}", terminal.id, terminal.name);
    }

    println!("{}", "Pads".bright_blue().bold());
    println!(
        "  {:>4}  {:>8}  {:>10}  {:>9}  {:>8}",
        "id", "terminal", "max_weight", "cost_hour", "cost_day"
    );
    for pad in &pads {
        let marker = if ships.iter().any(|s| s.pad_id == pad.id) {
            "●".red()
        } else {
            "○".green()
        };
        println!(
            "{} {:>4}  {:>8}  {:>10.1}  {:>9}  {:>8}",
            marker, pad.id, pad.terminal_id, pad.max_weight, pad.cost_hour, pad.cost_day
        );
    }

    println!("{}", "Ships".bright_blue().bold());
    for ship in &ships {
        println!(
            "  pad {:>4}  {:<20}  weight {:>8.1}  since {}",
            ship.pad_id, ship.license, ship.weight, ship.docked_at
        );
    }
    Ok(())
}

fn handle_log(sub: &ArgMatches<'_>, db: &str, json: bool) -> CliResult {
    let ledger = open_existing(db)?;
    let pad_id = sub.value_of("pad_id").map(str::parse::<i32>).transpose()?;
    let entries = ledger.docking_log(pad_id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for entry in &entries {
        println!(
            "{:>6}  {:>13}  pad {:>4}  {:<7}  {}",
            entry.id,
            entry.time,
            entry.pad_id,
            entry.event.as_str(),
            entry.license
        );
    }
    Ok(())
}
