use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use rpassword::prompt_password;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Builder;

use crate::console::Console;
use crate::http_api::{ConsoleApiConfig, ConsoleApiServer};
use crate::license::LicenseStatus;
use crate::model::{Actor, Instance, Role};
use crate::operator_log::{self, Level};
use crate::pairing::PairingPhase;
use crate::runtime_state::ConsolePaths;
use crate::store::EntityKind;
use crate::webhooks::DispatchOutcome;

#[derive(Parser)]
#[command(name = "gateway-console")]
#[command(about = "Messaging gateway operator console", version)]
pub struct Cli {
    /// State directory (defaults to the platform data dir).
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[arg(long, global = true, default_value = "local-admin")]
    user: String,
    #[arg(long, global = true)]
    user_name: Option<String>,
    #[arg(long, global = true, default_value = "super_admin")]
    role: Role,
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(subcommand)]
    Instances(InstancesCommand),
    #[command(subcommand)]
    License(LicenseCommand),
    #[command(subcommand)]
    Config(ConfigCommand),
    #[command(subcommand)]
    Entities(EntitiesCommand),
    #[command(subcommand)]
    Webhooks(WebhooksCommand),
    Serve(ServeArgs),
}

#[derive(Subcommand)]
enum InstancesCommand {
    /// List instances visible to the current user.
    List(FormatArgs),
    /// Create an instance (subject to the seat quota).
    Create { name: String },
    /// Delete an instance by id or name.
    Delete { instance: String },
    /// Pair a device; Ctrl-C cancels the session.
    Pair { instance: String },
}

#[derive(Subcommand)]
enum LicenseCommand {
    Status(FormatArgs),
}

#[derive(Subcommand)]
enum ConfigCommand {
    Show(FormatArgs),
    /// Merge a partial YAML document into the stored config.
    Import { path: PathBuf },
    SetMock { state: Toggle },
    #[command(
        about = "Point the console at a live gateway.",
        after_help = "The API key is prompted for when --api-key is omitted."
    )]
    SetGateway {
        #[arg(long)]
        url: String,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Subcommand)]
enum EntitiesCommand {
    List {
        kind: String,
        #[command(flatten)]
        format: FormatArgs,
    },
}

#[derive(Subcommand)]
enum WebhooksCommand {
    /// Send a sample payload for `event` to its configured URL.
    Test {
        event: String,
        /// JSON object sent as `data`.
        #[arg(long)]
        data: Option<String>,
    },
}

#[derive(Parser)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:8787")]
    bind: SocketAddr,
}

#[derive(Parser)]
struct FormatArgs {
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Text,
    Json,
    Yaml,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl Cli {
    pub fn run(self) -> anyhow::Result<()> {
        let paths = ConsolePaths::resolve(self.state_dir.as_deref());
        operator_log::init(paths.logs_dir(), Level::for_debug_flag(self.debug), self.debug)?;
        let actor = Actor::new(
            self.user.clone(),
            self.user_name.clone().unwrap_or_else(|| self.user.clone()),
            self.role,
        );
        let console = Arc::new(Console::open(&paths)?);
        let result = match self.command {
            Command::Serve(args) => args.run(console.clone()),
            command => {
                let runtime = Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context("build console runtime")?;
                runtime.block_on(command.run(&console, &actor))
            }
        };
        console.close()?;
        result
    }
}

impl Command {
    async fn run(self, console: &Console, actor: &Actor) -> anyhow::Result<()> {
        match self {
            Command::Instances(command) => command.run(console, actor).await,
            Command::License(LicenseCommand::Status(args)) => {
                let status = console.license.status().await?;
                render(args.format, &status, || license_text(&status))
            }
            Command::Config(command) => command.run(console),
            Command::Entities(EntitiesCommand::List { kind, format }) => {
                let kind = EntityKind::parse(&kind)
                    .ok_or_else(|| anyhow!("unknown entity kind '{kind}'"))?;
                let records = if kind == EntityKind::Instances {
                    console
                        .instances
                        .list(actor)
                        .await?
                        .iter()
                        .map(serde_json::to_value)
                        .collect::<Result<Vec<_>, _>>()?
                } else {
                    console.entities.list_json(kind).await?
                };
                render(format.format, &records, || {
                    records
                        .iter()
                        .map(|record| record.to_string())
                        .collect::<Vec<_>>()
                        .join("\n")
                })
            }
            Command::Webhooks(WebhooksCommand::Test { event, data }) => {
                let data: Value = match data {
                    Some(raw) => serde_json::from_str(&raw).context("parse --data as json")?,
                    None => serde_json::json!({"test": true}),
                };
                match console.webhooks.dispatch(&event, data).await? {
                    DispatchOutcome::Skipped => println!("no url configured for {event}"),
                    DispatchOutcome::Delivered { url, status } => {
                        println!("{event} delivered to {url} (status {status})")
                    }
                }
                Ok(())
            }
            Command::Serve(_) => Err(anyhow!("serve runs outside the command runtime")),
        }
    }
}

impl InstancesCommand {
    async fn run(self, console: &Console, actor: &Actor) -> anyhow::Result<()> {
        match self {
            InstancesCommand::List(args) => {
                let instances = console.instances.list(actor).await?;
                render(args.format, &instances, || instances_text(&instances))
            }
            InstancesCommand::Create { name } => {
                let instance = console.instances.create(&name, actor).await?;
                println!("created {} ({}) status={}", instance.name, instance.id, instance.status);
                Ok(())
            }
            InstancesCommand::Delete { instance } => {
                let instance = console.instances.find_any(&instance).await?;
                console.instances.delete(&instance, actor).await?;
                println!("deleted {} ({})", instance.name, instance.id);
                Ok(())
            }
            InstancesCommand::Pair { instance } => {
                let instance = console.instances.find_any(&instance).await?;
                pair(console, &instance, actor).await
            }
        }
    }
}

async fn pair(console: &Console, instance: &Instance, actor: &Actor) -> anyhow::Result<()> {
    let mut session = console.pairing.open(instance, actor);
    let mut phases = session.subscribe();
    loop {
        let phase = phases.borrow_and_update().clone();
        match &phase {
            PairingPhase::Displaying { payload } => {
                println!("scan this pairing payload on the device:\n{payload}")
            }
            other => println!("pairing {}: {}", instance.name, other.name()),
        }
        if phase.is_terminal() {
            break;
        }
        tokio::select! {
            changed = phases.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => session.cancel(),
        }
    }
    session.wait().await?;
    println!("{} connected", instance.name);
    Ok(())
}

impl ConfigCommand {
    fn run(self, console: &Console) -> anyhow::Result<()> {
        match self {
            ConfigCommand::Show(args) => {
                let config = console.config.get();
                render(args.format, &config, || {
                    serde_yaml_bw::to_string(&config).unwrap_or_default()
                })
            }
            ConfigCommand::Import { path } => {
                let config = console.config.import_yaml(&path)?;
                println!(
                    "imported {} (mock_mode={}, gateway configured={})",
                    path.display(),
                    config.mock_mode,
                    config.gateway.is_valid()
                );
                Ok(())
            }
            ConfigCommand::SetMock { state } => {
                let enabled = matches!(state, Toggle::On);
                console.config.update(|config| config.mock_mode = enabled)?;
                println!("mock mode {}", if enabled { "on" } else { "off" });
                Ok(())
            }
            ConfigCommand::SetGateway {
                url,
                api_key,
                timeout_ms,
            } => {
                let api_key = match api_key {
                    Some(key) => key,
                    None => prompt_password("gateway api key: ")
                        .map_err(|err| anyhow!("read api key: {err}"))?,
                };
                let config = console.config.update(|config| {
                    config.gateway.base_url = url.trim().to_string();
                    config.gateway.api_key = api_key.trim().to_string();
                    if let Some(timeout_ms) = timeout_ms {
                        config.gateway.timeout_ms = timeout_ms;
                    }
                })?;
                if let Err(err) = config.gateway.validate() {
                    eprintln!("warning: {err}; the live gateway tier will be skipped");
                }
                Ok(())
            }
        }
    }
}

impl ServeArgs {
    fn run(self, console: Arc<Console>) -> anyhow::Result<()> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .context("build console runtime")?;
        let server = ConsoleApiServer::start(ConsoleApiConfig {
            bind_addr: self.bind,
            console: console.clone(),
        })?;
        println!("console api listening on http://{}", server.local_addr());
        runtime.block_on(async {
            let forwarder = console
                .webhooks
                .forward_instance_events(console.instances.subscribe());
            let signal = tokio::signal::ctrl_c().await;
            forwarder.abort();
            signal.context("wait for ctrl-c")
        })?;
        server.stop()
    }
}

fn render<T: Serialize>(
    format: Format,
    value: &T,
    text: impl FnOnce() -> String,
) -> anyhow::Result<()> {
    let output = match format {
        Format::Text => text(),
        Format::Json => serde_json::to_string_pretty(value)?,
        Format::Yaml => serde_yaml_bw::to_string(value)?,
    };
    println!("{}", output.trim_end());
    Ok(())
}

fn instances_text(instances: &[Instance]) -> String {
    if instances.is_empty() {
        return "no instances".to_string();
    }
    instances
        .iter()
        .map(|instance| {
            format!(
                "{:<24} {:<16} {:<12} {:<16} {}",
                instance.id,
                instance.name,
                instance.status,
                instance.phone.as_deref().unwrap_or("-"),
                instance.owner_name
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn license_text(status: &LicenseStatus) -> String {
    let mut lines = vec![
        format!("tier: {} ({})", status.license.tier, status.license.status),
        format!(
            "seats: {} used of {} ({} remaining)",
            status.usage.used_instances, status.total_seats, status.remaining_seats
        ),
        format!(
            "messages this month: {} of {}",
            status.usage.used_messages_this_month, status.license.limits.max_messages_per_month
        ),
        format!("source: {}", status.source),
    ];
    if status.enforcement_bypassed {
        lines.push("quota enforcement bypassed (mock mode)".to_string());
    }
    lines.join("\n")
}
