//! avp-loopback - exercise the AVP transport without hardware
//!
//! Commands:
//! - `avp-loopback ping` - RPC round trips from the CPU to a simulated AVP service
//! - `avp-loopback stress` - push raw messages through a shallow AVP queue
//! - `avp-loopback info` - show the effective configuration
//!
//! Both processors run in this process, joined by the loopback mailbox.

mod service;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use avp_rpc::{RpcConfig, RpcMessage, RpcSession};
use avp_transport::{
    Processor, Timeout, Transport, TransportConfig, TransportError, MAX_MESSAGE_LEN,
    RPC_AVP_PORT,
};
use avp_xpc::loopback::{self, LoopbackLoader, LoopbackSide};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Deserialize;

use crate::service::AvpService;

const FIRMWARE_IMAGE: &str = "nvrm_avp.axf";
const FIRMWARE_ENTRY: u32 = 0x1000_0000;

#[derive(Parser)]
#[command(name = "avp-loopback")]
#[command(version)]
#[command(about = "Boot a loopback CPU/AVP pair and drive the transport", long_about = None)]
struct Cli {
    /// TOML file with [transport] and [rpc] sections
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log protocol-level detail
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Round-trip RPC calls to the AVP service
    Ping {
        /// Number of calls
        #[arg(short = 'n', long, default_value_t = 10)]
        count: u32,
    },

    /// Send many messages into a shallow AVP queue
    Stress {
        /// Messages to send
        #[arg(short = 'n', long, default_value_t = 1000)]
        messages: u32,

        /// Receive queue depth on the AVP port
        #[arg(short, long, default_value_t = 2)]
        depth: usize,
    },

    /// Show the effective configuration
    Info,
}

/// Layout of the `--config` file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    transport: TransportConfig,
    rpc: RpcConfig,
}

fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Invalid config file {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Ping { count } => ping(&config, count)?,
        Commands::Stress { messages, depth } => stress(&config, messages, depth)?,
        Commands::Info => show_info(&config),
    }

    Ok(())
}

/// Both transports of a booted loopback pair
struct Loopback {
    cpu: Arc<Transport>,
    avp: Arc<Transport>,
    _sides: (LoopbackSide, LoopbackSide),
}

fn boot(config: &TransportConfig) -> Result<Loopback> {
    let (cpu_side, avp_side) = loopback::pair();
    let avp = Transport::init(config.clone(), Processor::Avp, Some(avp_side.platform()))
        .context("Failed to start the AVP transport")?;
    let cpu = Transport::init(config.clone(), Processor::Cpu, Some(cpu_side.platform()))
        .context("Failed to start the CPU transport")?;

    let entry = cpu
        .boot_remote(&LoopbackLoader::new(FIRMWARE_ENTRY), FIRMWARE_IMAGE)
        .context("Failed to boot the AVP")?;
    log::debug!("{} loaded, entry {:#x}", FIRMWARE_IMAGE, entry);

    let start = Instant::now();
    while !cpu.is_mailbox_ready() {
        if start.elapsed() > Duration::from_secs(1) {
            bail!("AVP never picked up the mailbox");
        }
        thread::sleep(Duration::from_millis(1));
    }

    Ok(Loopback {
        cpu,
        avp,
        _sides: (cpu_side, avp_side),
    })
}

fn ping(config: &FileConfig, count: u32) -> Result<()> {
    println!("{} Booting loopback CPU/AVP pair...", "🔌".green());
    let pair = boot(&config.transport)?;

    let avp = Arc::clone(&pair.avp);
    let rpc_config = config.rpc.clone();
    let server = thread::spawn(move || -> avp_rpc::Result<AvpService> {
        let session = RpcSession::accept(avp, RPC_AVP_PORT, rpc_config, Timeout::Infinite)?;
        let mut service = AvpService::new();
        session.serve(&mut service)?;
        Ok(service)
    });

    let client = RpcSession::init(Arc::clone(&pair.cpu), RPC_AVP_PORT, config.rpc.clone())
        .context("Failed to connect to the AVP RPC service")?;
    println!("{} Connected to {}", "✓".green(), RPC_AVP_PORT.bold());

    let mut slowest = Duration::ZERO;
    let start = Instant::now();
    for i in 0..count {
        let call_start = Instant::now();
        let handle = match client.call(&RpcMessage::MemHandleCreate { size: 4096 * (i + 1) })? {
            RpcMessage::MemHandleCreateResponse { status: 0, handle } => handle,
            other => bail!("Unexpected answer to MemHandleCreate: {:?}", other),
        };
        let address = match client.call(&RpcMessage::MemHandlePin { handle })? {
            RpcMessage::MemHandlePinResponse { address } => address,
            other => bail!("Unexpected answer to MemHandlePin: {:?}", other),
        };
        client.post(&RpcMessage::MemHandleUnpin { handle })?;
        client.post(&RpcMessage::MemHandleFree { handle })?;
        slowest = slowest.max(call_start.elapsed());
        log::debug!("handle {} pinned at {:#x}", handle, address);
    }
    client.post(&RpcMessage::RemotePrintf {
        text: format!("ping done after {} rounds\n", count),
    })?;
    let elapsed = start.elapsed();
    drop(client);

    let service = match server.join() {
        Ok(result) => result.context("AVP service failed")?,
        Err(_) => bail!("AVP service thread panicked"),
    };

    println!();
    println!("{}", "Ping summary:".bold());
    println!("  Rounds:          {}", count);
    println!("  Requests served: {}", service.requests);
    println!("  Total time:      {:?}", elapsed);
    println!("  Slowest round:   {:?}", slowest);
    Ok(())
}

fn stress(config: &FileConfig, messages: u32, depth: usize) -> Result<()> {
    println!("{} Booting loopback CPU/AVP pair...", "🔌".green());
    let pair = boot(&config.transport)?;

    let sink = pair.avp.open(Some("stress"))?;
    pair.avp
        .set_queue_depth(sink, depth, MAX_MESSAGE_LEN)
        .context("Failed to resize the AVP queue")?;

    let avp = Arc::clone(&pair.avp);
    let receiver = thread::spawn(move || -> Result<u32> {
        avp.wait_for_connect(sink, Timeout::millis(5_000))?;
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let mut expected = 0u32;
        while expected < messages {
            match avp.recv(sink, &mut buf) {
                Ok(4) => {
                    let seq = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                    if seq != expected {
                        bail!("Message {} arrived out of order (expected {})", seq, expected);
                    }
                    expected += 1;
                }
                Ok(len) => bail!("Unexpected {}-byte message", len),
                Err(TransportError::MailboxEmpty) => {
                    let _ = avp.wait_message(sink, Timeout::millis(100));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(expected)
    });

    let source = pair.cpu.open(Some("stress"))?;
    pair.cpu
        .connect(source, Timeout::millis(5_000))
        .context("Failed to connect to the AVP stress port")?;

    let start = Instant::now();
    let mut busy = 0u32;
    for seq in 0..messages {
        loop {
            match pair.cpu.send(source, &seq.to_le_bytes(), Timeout::millis(10)) {
                Ok(()) => break,
                Err(TransportError::Timeout) => busy += 1,
                Err(e) => return Err(e).context("Send failed"),
            }
        }
    }

    let received = match receiver.join() {
        Ok(result) => result?,
        Err(_) => bail!("Receiver thread panicked"),
    };
    let elapsed = start.elapsed();
    pair.cpu.close(source)?;

    println!();
    println!("{}", "Stress summary:".bold());
    println!("  Messages:          {} sent, {} received in order", messages, received);
    println!("  AVP queue depth:   {}", depth);
    println!("  Parked on full:    {}", pair.avp.backpressure_events());
    println!("  Busy-mailbox waits: {}", busy);
    println!("  Total time:        {:?}", elapsed);
    Ok(())
}

fn show_info(config: &FileConfig) {
    let t = &config.transport;
    println!("{}", "Transport:".bold());
    println!("  Default queue depth:   {}", t.default_queue_depth);
    println!("  Max message size:      {} bytes", MAX_MESSAGE_LEN);
    println!("  Poll / sleep step:     {} ms / {} ms", t.poll_time_ms, t.sleep_step_ms);
    println!("  Connect retry:         {} ms", t.connect_retry_ms);
    println!("  Min response wait:     {} ms", t.min_response_wait_ms);
    println!("  Disconnect timeout:    {} ms", t.disconnect_timeout_ms);
    println!("  Fixed-depth ports:     {}", t.fixed_depth_ports.join(", "));
    println!("  Reset port:            {}", t.reset_port);

    let fmt = |ms: Option<u64>| ms.map_or_else(|| "infinite".to_string(), |ms| format!("{} ms", ms));
    let r = &config.rpc;
    println!();
    println!("{}", "RPC:".bold());
    println!("  Connect timeout:       {}", fmt(r.connect_timeout_ms));
    println!("  Send timeout:          {}", fmt(r.send_timeout_ms));
    println!("  Response timeout:      {}", fmt(r.response_timeout_ms));
}
