//! Bluetooth Mesh provisioner binary.
//!
//! Derives key material, decodes captured network PDUs and runs a full
//! provisioning and configuration exchange against an in-process device.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use mesh_access::{
    ConfigAppKeyAdd, ConfigModelAppBind, ConfigModelSubscriptionAdd, GenericLevelSet, GenericOnOffSet,
    MeshMessage, MessageCatalog, ModelIdentifier,
};
use mesh_crypto::{derive_application_key, derive_network_keys, parse_key_hex};
use mesh_session::{LoopbackNode, MeshEvent, MeshHandle, MeshSession, SessionChannels};
use mesh_transport::{AccessKey, NetworkContext};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod inspect;
mod logging;

use config::{parse_address, MeshConfig};
use inspect::{decode_pdu, DecodeKeys};
use logging::MeshLogFormatter;

/// Bluetooth Mesh provisioner
#[derive(Parser, Debug)]
#[command(name = "mesh-provisioner", version, about = "Bluetooth Mesh provisioning and transport engine")]
struct Cli {
    /// Configuration file path
    #[arg(long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the material derived from network and application keys
    Derive(DeriveArgs),
    /// Decode a captured network PDU
    Decode(DecodeArgs),
    /// Provision and configure an in-process light
    Simulate(SimulateArgs),
    /// Print the stored network as JSON
    Show,
}

#[derive(Args, Debug)]
struct DeriveArgs {
    /// Network key, hex (defaults to the configured key)
    #[arg(long)]
    net_key: Option<String>,

    /// Application key, hex (repeatable)
    #[arg(long)]
    app_key: Vec<String>,
}

#[derive(Args, Debug)]
struct DecodeArgs {
    /// Network PDU, hex
    pdu: String,

    /// Network key, hex (defaults to the configured key)
    #[arg(long)]
    net_key: Option<String>,

    /// Application key, hex (repeatable; defaults to the configured key)
    #[arg(long)]
    app_key: Vec<String>,

    /// Device key, hex, for configuration messages
    #[arg(long)]
    device_key: Option<String>,

    /// Current IV index (defaults to the configured one)
    #[arg(long)]
    iv_index: Option<u32>,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Name of the simulated light
    #[arg(long, default_value = "lamp")]
    name: String,

    /// Group address the light subscribes to
    #[arg(long, default_value = "0xC000", value_parser = parse_address)]
    group: u16,

    /// Generic Level to set
    #[arg(long, default_value_t = 0x4000)]
    level: i16,

    /// Reset the node at the end
    #[arg(long)]
    reset: bool,

    /// Override the acknowledged request timeout, e.g. 5s
    #[arg(long)]
    request_timeout: Option<humantime::Duration>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(format!(
            "warn,mesh_provisioner={level},mesh_session={level},mesh_transport={level},\
             mesh_provisioning={level},mesh_access={level},mesh_storage={level}",
            level = cli.log_level
        ))
    })?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(MeshLogFormatter::new("mesh-provisioner"))
        .init();

    debug!("mesh-provisioner v{}", env!("CARGO_PKG_VERSION"));
    let config = MeshConfig::load_from_file(&cli.config)?;

    match cli.command {
        Command::Derive(args) => derive(&config, args),
        Command::Decode(args) => decode(&config, args),
        Command::Simulate(args) => simulate(&config, args).await,
        Command::Show => show(&config).await,
    }
}

fn derive(config: &MeshConfig, args: DeriveArgs) -> Result<()> {
    let net_key = parse_key_hex(args.net_key.as_deref().unwrap_or(&config.network.net_key))
        .context("--net-key")?;
    let material = derive_network_keys(&net_key)?;
    println!("net_key        {}", hex::encode(net_key));
    println!("nid            {:#04x}", material.nid);
    println!("encryption_key {}", hex::encode(material.encryption_key));
    println!("privacy_key    {}", hex::encode(material.privacy_key));
    println!("network_id     {}", hex::encode(material.network_id));
    println!("beacon_key     {}", hex::encode(material.beacon_key));
    println!("identity_key   {}", hex::encode(material.identity_key));

    let app_keys = if args.app_key.is_empty() {
        vec![config.network.app_key.clone()]
    } else {
        args.app_key
    };
    for app_key in &app_keys {
        let key = parse_key_hex(app_key).context("--app-key")?;
        println!("app_key        {} aid={:#04x}", hex::encode(key), derive_application_key(&key)?.aid);
    }
    Ok(())
}

fn decode(config: &MeshConfig, args: DecodeArgs) -> Result<()> {
    let pdu = hex::decode(args.pdu.trim()).context("PDU is not hex")?;
    let net_key = parse_key_hex(args.net_key.as_deref().unwrap_or(&config.network.net_key))
        .context("--net-key")?;
    let app_keys = if args.app_key.is_empty() {
        vec![parse_key_hex(&config.network.app_key)?]
    } else {
        args.app_key
            .iter()
            .map(|k| parse_key_hex(k).context("--app-key"))
            .collect::<Result<_>>()?
    };
    let device_key = args
        .device_key
        .as_deref()
        .map(parse_key_hex)
        .transpose()
        .context("--device-key")?;

    let keys = DecodeKeys {
        net_key,
        app_keys,
        device_key,
        iv_index: args.iv_index.unwrap_or(config.network.iv_index),
    };
    let decoded = decode_pdu(&pdu, &keys, &MessageCatalog::default())?;
    print!("{}", decoded);
    Ok(())
}

async fn show(config: &MeshConfig) -> Result<()> {
    let store = config.open_store().await?;
    match store.load_network::<NetworkContext>(&config.network.name).await? {
        Some(context) => println!("{}", serde_json::to_string_pretty(&context)?),
        None => bail!("no stored network named {:?}", config.network.name),
    }
    Ok(())
}

async fn simulate(config: &MeshConfig, args: SimulateArgs) -> Result<()> {
    let mut session_config = config.session_config()?;
    if let Some(timeout) = args.request_timeout {
        session_config.request_timeout = timeout.into();
    }

    let store = config.open_store().await?;
    let context = match store.load_network::<NetworkContext>(&config.network.name).await? {
        Some(context) => {
            info!("Resuming network {} with {} nodes", context.name, context.nodes().count());
            context
        }
        None => config.network_context()?,
    };
    let app_key_index = config.network.app_key_index;
    let app_key = *context.app_key(app_key_index)?.key();
    let net_key_index = context.app_key(app_key_index)?.bound_net_key();

    let (handle, channels) = MeshSession::spawn(session_config.clone(), context, store)?;
    let SessionChannels { mut events, outbound } = channels;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    let mut lamp = LoopbackNode::light(args.name.clone(), &session_config)?;
    if let Some(value) = session_config.provisioning.static_oob {
        lamp = lamp.with_static_oob(value);
    }
    let device = lamp.device();
    let bearer = lamp.spawn(handle.clone(), outbound);

    let node = handle.provision(device).await?;
    let addr = node.unicast_address;
    component_info!("simulate", "provisioned {} ({}) at {:#06x}", node.name, node.uuid, addr);

    let result = configure(&handle, addr, net_key_index, app_key_index, app_key, &args).await;
    if let Err(e) = &result {
        component_warn!("simulate", "configuration stopped: {}", e);
    }

    let snapshot = handle.snapshot().await?;
    handle.shutdown().await?;
    let lamp = bearer.await?;
    printer.await?;

    component_info!(
        "simulate",
        "{}: onoff={} level={} bindings={} subscriptions={}",
        args.name,
        lamp.onoff(),
        lamp.level(),
        lamp.bindings().len(),
        lamp.subscriptions().len()
    );
    let nodes: Vec<_> = snapshot.nodes().collect();
    println!("{}", serde_json::to_string_pretty(&nodes)?);
    result
}

async fn configure(
    handle: &MeshHandle,
    addr: u16,
    net_key_index: u16,
    app_key_index: u16,
    app_key: mesh_crypto::Key128,
    args: &SimulateArgs,
) -> Result<()> {
    let app = AccessKey::Application(app_key_index);

    let add = ConfigAppKeyAdd {
        net_key_index,
        app_key_index,
        app_key,
    };
    expect_success(handle.send_acknowledged(MeshMessage::AppKeyAdd(add), addr, AccessKey::Device).await?)?;

    let status = handle
        .send_acknowledged(MeshMessage::CompositionDataGet { page: 0 }, addr, AccessKey::Device)
        .await?;
    if let MeshMessage::CompositionDataStatus(data) = &status {
        let composition = data.page_zero()?;
        component_info!(
            "simulate",
            "composition: company={:#06x} product={:#06x} elements={} features={:?}",
            composition.company_id,
            composition.product_id,
            composition.elements.len(),
            composition.features
        );
    }

    for model in [ModelIdentifier::GENERIC_ONOFF_SERVER, ModelIdentifier::GENERIC_LEVEL_SERVER] {
        let bind = ConfigModelAppBind {
            element_address: addr,
            app_key_index,
            model,
        };
        expect_success(handle.send_acknowledged(MeshMessage::ModelAppBind(bind), addr, AccessKey::Device).await?)?;
    }

    let subscribe = ConfigModelSubscriptionAdd {
        element_address: addr,
        address: args.group,
        model: ModelIdentifier::GENERIC_ONOFF_SERVER,
    };
    expect_success(
        handle
            .send_acknowledged(MeshMessage::ModelSubscriptionAdd(subscribe), addr, AccessKey::Device)
            .await?,
    )?;

    let on = GenericOnOffSet {
        on: true,
        tid: 1,
        transition: None,
    };
    let status = handle.send_acknowledged(MeshMessage::GenericOnOffSet(on), addr, app).await?;
    component_info!("simulate", "onoff: {:?}", status);

    let level = GenericLevelSet {
        level: args.level,
        tid: 2,
        transition: None,
    };
    let status = handle.send_acknowledged(MeshMessage::GenericLevelSet(level), addr, app).await?;
    component_info!("simulate", "level: {:?}", status);

    let off = GenericOnOffSet {
        on: false,
        tid: 3,
        transition: None,
    };
    handle
        .send(MeshMessage::GenericOnOffSetUnacknowledged(off), args.group, app)
        .await?;
    let status = handle.send_acknowledged(MeshMessage::GenericOnOffGet, addr, app).await?;
    component_info!("simulate", "onoff after group message: {:?}", status);

    if args.reset {
        handle.send_acknowledged(MeshMessage::NodeReset, addr, AccessKey::Device).await?;
        component_info!("simulate", "node {:#06x} reset", addr);
    }
    Ok(())
}

fn expect_success(reply: MeshMessage) -> Result<()> {
    match reply.as_status() {
        Some(status) if !status.is_successful() => {
            bail!("{} reported {:?}", reply.name(), status.status())
        }
        _ => Ok(()),
    }
}

fn log_event(event: &MeshEvent) {
    match event {
        MeshEvent::Message { src, dst, message, .. } => {
            debug!("rx {} {:#06x} -> {:#06x}", message.name(), src, dst)
        }
        MeshEvent::ProvisioningState(state) => debug!("provisioning state {:?}", state),
        MeshEvent::NodeProvisioned(node) => info!("node {} provisioned at {:#06x}", node.name, node.unicast_address),
        MeshEvent::NodeUpdated(node) => debug!("node {:#06x} updated", node.unicast_address),
        MeshEvent::NodeRemoved(addr) => info!("node {:#06x} removed", addr),
        MeshEvent::AuthValueRequired { method, .. } => {
            warn!("device asks for {:?} authentication, which the simulation cannot enter", method)
        }
        MeshEvent::DisplayAuthValue(value) => info!("enter {} on the device", value),
        MeshEvent::UnprovisionedDevice { uuid, .. } => info!("unprovisioned device {}", uuid),
        MeshEvent::IvIndexUpdated(iv) => info!("IV index now {:?}", iv),
        MeshEvent::Failure(e) => warn!("{} ({})", e, e.kind()),
        MeshEvent::Disconnected => debug!("session disconnected"),
    }
}
