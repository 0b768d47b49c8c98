//! Wattpilot Node - CLI for a single charger
//!
//! Connects, waits for the first full status and then inspects or changes
//! the charger state.
//!
//! # Usage
//!
//! ```bash
//! # Summary of the derived state
//! wattpilot-node --host 192.168.1.50 --password secret info
//!
//! # Through the cloud relay
//! wattpilot-node --cloud --serial 12345678 --password secret props nrg
//!
//! # Set the charging current
//! wattpilot-node --host 192.168.1.50 set amp 16
//!
//! # Follow property updates until Ctrl-C
//! WATTPILOT_PASSWORD=secret wattpilot-node --host 192.168.1.50 watch amp car nrg
//!
//! # Print raw deltaStatus and response messages
//! wattpilot-node --host 192.168.1.50 watch --messages deltaStatus,response
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use wattpilot_client::{
    ClientConfig, DerivedFields, Event, EventKind, ForceType, PropertyValue, WattpilotClient,
};

/// Wattpilot charger command-line node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Charger host or IP on the local network
    #[arg(long, required_unless_present = "cloud")]
    host: Option<String>,

    /// Connect through the cloud relay (requires --serial)
    #[arg(long, requires = "serial")]
    cloud: bool,

    /// Charger serial number
    #[arg(long)]
    serial: Option<String>,

    /// Charger password
    #[arg(long, env = "WATTPILOT_PASSWORD", hide_env_values = true)]
    password: String,

    /// Seconds to wait for the first full status
    #[arg(short, long, default_value = "15")]
    timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the derived charger state
    Info,
    /// Print one property as JSON
    Get { key: String },
    /// List properties, optionally only keys starting with a prefix
    Props { prefix: Option<String> },
    /// Set a property value
    Set {
        key: String,
        value: String,
        /// Force the value type (bool, int, float, str)
        #[arg(long)]
        force_type: Option<ForceType>,
        /// Send even if the charger never reported the key
        #[arg(long)]
        force: bool,
    },
    /// Print property updates until Ctrl-C
    Watch {
        /// Keys to follow (all when empty)
        keys: Vec<String>,
        /// Print raw messages of these types (`all` for every type); only
        /// listed keys are still followed
        #[arg(long, value_delimiter = ',')]
        messages: Vec<String>,
    },
}

/// Application context
struct App {
    client: WattpilotClient,
    timeout: Duration,
}

impl App {
    fn new(args: &Args) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = match (&args.host, args.cloud) {
            (_, true) => ClientConfig::cloud(args.serial.clone().unwrap_or_default(), &args.password),
            (Some(host), false) => ClientConfig::local(host, &args.password),
            (None, false) => return Err("either --host or --cloud is required".into()),
        };
        if let Some(serial) = &args.serial {
            config = config.with_serial(serial);
        }
        let timeout = Duration::from_secs(args.timeout);
        config = config.with_init_timeout(timeout);

        Ok(Self {
            client: WattpilotClient::new(config)?,
            timeout,
        })
    }

    async fn start(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.client.connect()?;
        if !self.client.wait_for_init().await {
            self.client.disconnect(false);
            return Err(format!(
                "charger did not finish initialization within {:?}",
                self.timeout
            )
            .into());
        }
        info!(
            "Connected to {} ({})",
            self.client.name().unwrap_or_default(),
            self.client.serial().unwrap_or_default()
        );
        Ok(())
    }

    async fn run(&self, command: Command) -> Result<(), Box<dyn std::error::Error>> {
        match command {
            Command::Info => print_info(&self.client),
            Command::Get { key } => match self.client.get(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => return Err(format!("unknown property: {}", key).into()),
            },
            Command::Props { prefix } => {
                let props: BTreeMap<String, PropertyValue> = self
                    .client
                    .all_props()
                    .into_iter()
                    .filter(|(key, _)| prefix.as_deref().map_or(true, |p| key.starts_with(p)))
                    .collect();
                for (key, value) in props {
                    println!("{:<8} {}", key, serde_json::to_string(&value)?);
                }
            }
            Command::Set {
                key,
                value,
                force_type,
                force,
            } => {
                let request_id = self
                    .client
                    .set_property(&key, &value, force_type, force)
                    .await?;
                println!("Sent {}={} (request {})", key, value, request_id);
                // Give the charger a moment to answer before the socket closes
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Command::Watch { keys, messages } => {
                let follow_properties = !keys.is_empty() || messages.is_empty();
                if !messages.is_empty() {
                    self.client.on(EventKind::Message, move |event| {
                        if let Event::Message(raw) = event {
                            if wants_message(&messages, raw) {
                                println!("{}", raw);
                            }
                        }
                    });
                }
                if follow_properties {
                    self.client.on(EventKind::Property, move |event| {
                        if let Event::Property { key, value } = event {
                            if keys.is_empty() || keys.contains(key) {
                                println!("{} = {}", key, value);
                            }
                        }
                    });
                }
                self.client.on(EventKind::Response, |event| {
                    if let Event::Response(response) = event {
                        if !response.success {
                            error!("Request failed: {:?}", response.message);
                        }
                    }
                });
                tokio::signal::ctrl_c().await?;
            }
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.client.disconnect(false);
        if tokio::time::timeout(Duration::from_secs(2), self.client.join())
            .await
            .is_err()
        {
            error!("Connection task did not stop in time");
        }
    }
}

/// Whether a raw frame's `type` is one of `types`
fn wants_message(types: &[String], raw: &str) -> bool {
    let kind = serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|frame| frame.get("type")?.as_str().map(str::to_string));
    match kind {
        Some(kind) => types.iter().any(|t| t == "all" || *t == kind),
        None => false,
    }
}

fn print_info(client: &WattpilotClient) {
    let device = client.device();
    let d: DerivedFields = client.derived();
    let opt = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
    let num = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{:.2}", v));

    println!("Wattpilot: {}", opt(client.name()));
    println!("Serial:    {}", opt(client.serial()));
    println!("Firmware:  {}", opt(d.firmware.clone().or(device.version)));
    println!("Car:       {}", opt(d.car_connected.map(|c| c.to_string())));
    println!("Charging:  {}", opt(d.allow_charging.map(|a| a.to_string())));
    println!("Mode:      {}", opt(d.mode.map(|m| m.to_string())));
    println!("Current:   {}", opt(d.amp.map(|a| format!("{} A", a))));
    println!(
        "Power:     {} kW  ({} / {} / {} kW)",
        num(d.power),
        num(d.power1),
        num(d.power2),
        num(d.power3)
    );
    println!(
        "Voltage:   {} / {} / {} V",
        num(d.voltage1),
        num(d.voltage2),
        num(d.voltage3)
    );
    println!(
        "Amps:      {} / {} / {} A",
        num(d.amps1),
        num(d.amps2),
        num(d.amps3)
    );
    println!("Cable:     {}", opt(d.cable_lock.map(|c| c.to_string())));
    println!("State:     {}", opt(d.error_state.map(|e| e.to_string())));
    println!("Update:    {}", opt(d.update_available.map(|u| u.to_string())));
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let app = App::new(&args)?;
    app.start().await?;
    let result = app.run(args.command).await;
    app.shutdown().await;
    result
}
