//! ert-sched: run a command workload against a simulated device

use std::env;
use std::sync::Arc;

use anyhow::{bail, Context};
use ert_sched::command::{CmdState, CmdType, ConfigureCmd, ConfigureFlags, ErtPacket, Opcode, MAX_CUS};
use ert_sched::cu::AP_CTRL_CHAIN;
use ert_sched::device::{DeviceCaps, SimDevice, SimErtMode};
use ert_sched::{DeviceRegistry, SchedConfig};

const SLOT_SIZE: u32 = 0x1000;
const CU_STRIDE: u64 = 0x1_0000;
const WAIT_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Penguin,
    Ert,
    Poll,
}

#[derive(Debug)]
struct Options {
    mode: Mode,
    cus: usize,
    jobs: usize,
}

impl Options {
    fn parse(args: &[String]) -> anyhow::Result<Self> {
        let mut opts = Self {
            mode: Mode::Penguin,
            cus: 2,
            jobs: 8,
        };

        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let mut value = || iter.next().with_context(|| format!("{} needs a value", arg));
            match arg.as_str() {
                "--mode" => {
                    opts.mode = match value()?.as_str() {
                        "penguin" => Mode::Penguin,
                        "ert" => Mode::Ert,
                        "poll" => Mode::Poll,
                        other => bail!("unknown mode '{}' (penguin, ert, poll)", other),
                    }
                }
                "--cus" => opts.cus = value()?.parse().context("--cus")?,
                "--jobs" => opts.jobs = value()?.parse().context("--jobs")?,
                other => bail!("unknown argument '{}'", other),
            }
        }

        if opts.cus == 0 || opts.cus >= MAX_CUS {
            bail!("--cus must be between 1 and {}", MAX_CUS - 1);
        }
        Ok(opts)
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }
    if args.iter().any(|a| a == "--print-config") {
        print_config();
        return Ok(());
    }

    let opts = Options::parse(&args[1..])?;
    run(&opts)
}

fn print_usage() {
    println!("Usage: ert-sched [--mode penguin|ert|poll] [--cus N] [--jobs M] [--print-config]");
    println!();
    println!("Runs M start-kernel commands over N simulated compute units and");
    println!("prints each completion. Logging is controlled by RUST_LOG.");
}

fn print_config() {
    let config = SchedConfig::get();
    println!("Effective configuration");
    println!("=======================");
    println!("poll interval:  {:?}", config.poll_interval());
    println!("cq size:        0x{:x}", config.cq_size());
    println!("force penguin:  {}", config.force_penguin());
    println!("xgq slot size:  {}", config.xgq_slot_size());
    println!("xgq timeout:    {:?}", config.xgq_timeout());
    if let Some(path) = SchedConfig::user_config_path() {
        println!("user config:    {}", path.display());
    }
    println!();
    println!("Sample config file:");
    println!("-------------------");
    print!("{}", SchedConfig::sample_config());
}

fn run(opts: &Options) -> anyhow::Result<()> {
    let caps = match opts.mode {
        Mode::Penguin => DeviceCaps::penguin(),
        Mode::Ert | Mode::Poll => DeviceCaps::embedded(30),
    };
    let dev = SimDevice::new(caps);
    dev.set_auto_complete(true);
    dev.set_ert_mode(match opts.mode {
        Mode::Penguin => SimErtMode::Off,
        Mode::Ert => SimErtMode::SlotDoorbell,
        Mode::Poll => SimErtMode::CuPoll,
    });

    let handshake = if opts.mode == Mode::Poll { AP_CTRL_CHAIN } else { 0 };
    let addrs: Vec<u32> = (0..opts.cus)
        .map(|i| ((i as u64 + 1) * CU_STRIDE) as u32 | handshake)
        .collect();
    for addr in &addrs {
        dev.add_cu(*addr as u64);
    }

    let config = SchedConfig::get();
    let mut registry = DeviceRegistry::new();
    let sched = registry
        .open(0, Arc::new(dev.clone()), config)
        .context("failed to start scheduler")?;

    let mut cfg = ConfigureCmd::new(SLOT_SIZE, &addrs);
    cfg.flags = ConfigureFlags {
        ert: opts.mode != Mode::Penguin,
        dataflow: opts.mode == Mode::Poll,
        cq_int: opts.mode == Mode::Ert,
        ..ConfigureFlags::default()
    };
    let handle = sched.submit(cfg.to_packet()?.words())?;
    let done = sched.wait(&[handle], 1, 1, WAIT_MS)?;
    match done.first() {
        Some(c) if c.state == CmdState::Completed => {}
        Some(c) => bail!("configure finished in {:?}", c.state),
        None => bail!("configure did not finish within {} ms", WAIT_MS),
    }
    println!("Configured {} cus ({:?} mode)", opts.cus, opts.mode);

    let mut masks = vec![0u32; opts.cus.div_ceil(32)];
    for cu in 0..opts.cus {
        masks[cu >> 5] |= 1 << (cu & 31);
    }
    let handles = (0..opts.jobs)
        .map(|job| -> ert_sched::Result<_> {
            let packet = ErtPacket::start_cu(&masks, &[job as u32])?;
            sched.submit(packet.words())
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut completions = if handles.is_empty() {
        Vec::new()
    } else {
        sched.wait(&handles, handles.len(), handles.len(), WAIT_MS)?
    };
    completions.sort_by_key(|c| c.uid);

    println!();
    println!("{:>6}  {:<10} {:>4}", "cmd", "state", "cu");
    for c in &completions {
        let cu = c.cu_idx.map_or_else(|| "-".to_string(), |idx| idx.to_string());
        println!("{:>6}  {:<10} {:>4}", c.uid, format!("{:?}", c.state), cu);
    }
    let ok = completions.iter().filter(|c| c.state == CmdState::Completed).count();
    println!();
    println!("{}/{} commands completed", ok, opts.jobs);

    let stat = sched.submit(ErtPacket::simple(Opcode::CuStat, CmdType::Ctrl).words())?;
    if let Some(custat) = sched
        .wait(&[stat], 1, 1, WAIT_MS)?
        .into_iter()
        .next()
        .and_then(|c| c.custat)
    {
        println!("cu usage: {:?}", custat.cu_usage);
    }

    registry.close(0);
    if ok != opts.jobs {
        bail!("{} commands did not complete", opts.jobs - ok);
    }
    Ok(())
}
