// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Drive an emulated CXL switch endpoint over a simulated I2C bus.
 *
 * Copyright (c) 2025 Code Construct
 */
#[allow(unused)]
use log::{debug, error, info, trace, warn};

use anyhow::{bail, Context, Result};
use std::io::BufRead;

use argh::FromArgs;
use deku::DekuContainerRead;
use mctp::Eid;

use mctp_cxl_switch::config::{self, SwitchConfig};
use mctp_cxl_switch::fmapi::{
    CciMessageHeader, CommandSet, IdentifySwitchResp, PhysicalSwitchCmd,
    PortStateInfoBlock, PortStateRespHeader,
};
use mctp_cxl_switch::sim::{transact, Reply, Requester, SimBus};
use mctp_cxl_switch::{MctpI2cSwitch, PecPolicy};

/// I2C address used for requests
const OWNER_ADDR: u8 = 0x10;
const OWNER_EID: Eid = Eid(8);

#[derive(FromArgs, Debug)]
#[argh(description = "Emulated CXL switch FM-API endpoint")]
struct Args {
    #[argh(switch, short = 'd')]
    /// debug logging
    debug: bool,

    #[argh(switch)]
    /// trace logging
    trace: bool,

    /// switch 7-bit I2C address
    #[argh(option, default = "config::DEFAULT_I2C_ADDR", from_str_fn(parse_u8))]
    addr: u8,

    /// initial switch EID, 0 if unassigned
    #[argh(option, default = "0", from_str_fn(parse_u8))]
    eid: u8,

    /// drop requests with a missing or incorrect PEC
    #[argh(switch)]
    strict_pec: bool,

    /// only accept Set Endpoint ID for normal EIDs
    #[argh(switch)]
    strict_eid: bool,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Send(SendCommand),
    Script(ScriptCommand),
    Ports(PortsCommand),
    Version(VersionCommand),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "ports", description = "List the switch ports")]
struct PortsCommand {}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "version", description = "Print version")]
struct VersionCommand {}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "send",
    description = "Send a request. get-eid, set-eid <eid>, uuid, version, \
    msg-types, vdm, identify, port-state <ids...>, port-control <ppb> <op>, \
    raw <hex...>"
)]
struct SendCommand {
    /// request
    #[argh(positional)]
    request: Vec<String>,
}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "script",
    description = "Send requests from a file, one per line"
)]
struct ScriptCommand {
    /// file of requests, or - for stdin
    #[argh(positional)]
    file: String,
}

fn parse_u8(s: &str) -> Result<u8, String> {
    let r = if let Some(h) = s.strip_prefix("0x") {
        u8::from_str_radix(h, 16)
    } else {
        s.parse()
    };
    r.map_err(|e| format!("Bad value '{s}': {e}"))
}

fn parse_hex(s: &str) -> Result<u8> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u8::from_str_radix(s, 16).with_context(|| format!("Bad hex byte '{s}'"))
}

fn hex(b: &[u8]) -> String {
    b.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
}

struct Session {
    switch: MctpI2cSwitch,
    bus: SimBus,
    owner: Requester,
}

impl Session {
    fn new(args: &Args) -> Result<Self> {
        let config = SwitchConfig {
            eid: Eid(args.eid),
            pec: if args.strict_pec {
                PecPolicy::Enforce
            } else {
                PecPolicy::Ignore
            },
            strict_eid: args.strict_eid,
            ..SwitchConfig::new(args.addr)
        };
        let switch = MctpI2cSwitch::new(config).context("Bad switch configuration")?;
        Ok(Self {
            switch,
            bus: SimBus::new(),
            owner: Requester::new(OWNER_ADDR, OWNER_EID),
        })
    }

    fn build(&mut self, words: &[&str]) -> Result<Vec<u8>> {
        let Some((cmd, rest)) = words.split_first() else {
            bail!("Empty request");
        };
        let addr = self.switch.addr();
        let eid = self.switch.eid();
        let ps = CommandSet::PhysicalSwitch as u8;

        let nums = || {
            rest.iter()
                .map(|w| parse_u8(w).map_err(anyhow::Error::msg))
                .collect::<Result<Vec<u8>>>()
        };
        let no_args = || {
            if !rest.is_empty() {
                bail!("'{cmd}' takes no arguments");
            }
            Ok(())
        };

        let f = match *cmd {
            "get-eid" => {
                no_args()?;
                self.owner.control(addr, eid, 0x02, &[])
            }
            "set-eid" => {
                let n = nums()?;
                let [new] = n.as_slice() else {
                    bail!("set-eid <eid>");
                };
                self.owner.control(addr, eid, 0x01, &[0x00, *new])
            }
            "uuid" => {
                no_args()?;
                self.owner.control(addr, eid, 0x03, &[])
            }
            "version" => {
                no_args()?;
                self.owner.control(addr, eid, 0x04, &[0xff])
            }
            "msg-types" => {
                no_args()?;
                self.owner.control(addr, eid, 0x05, &[])
            }
            "vdm" => {
                no_args()?;
                self.owner.control(addr, eid, 0x06, &[0x00])
            }
            "identify" => {
                no_args()?;
                let c = PhysicalSwitchCmd::IdentifySwitch as u8;
                self.owner.fmapi(addr, eid, ps, c, &[])
            }
            "port-state" => {
                let ids = nums()?;
                let mut p = vec![ids.len() as u8];
                p.extend_from_slice(&ids);
                let c = PhysicalSwitchCmd::GetPhysicalPortState as u8;
                self.owner.fmapi(addr, eid, ps, c, &p)
            }
            "port-control" => {
                let n = nums()?;
                if n.len() != 2 {
                    bail!("port-control <ppb> <op>");
                }
                let c = PhysicalSwitchCmd::PhysicalPortControl as u8;
                self.owner.fmapi(addr, eid, ps, c, &n)
            }
            "raw" => {
                let b = rest.iter().map(|w| parse_hex(w)).collect::<Result<Vec<u8>>>()?;
                if b.is_empty() {
                    bail!("raw <hex...>");
                }
                self.owner.raw(addr, &b)
            }
            _ => bail!("Unknown request '{cmd}'"),
        };
        Ok(f)
    }

    fn run(&mut self, words: &[&str]) -> Result<()> {
        let frame = self.build(words)?;
        println!("> {}", hex(&frame));

        let Some(raw) = transact(&mut self.switch, &mut self.bus, &frame) else {
            println!("< (no reply)");
            return Ok(());
        };
        println!("< {}", hex(&raw));
        let reply = self.owner.decode_reply(&raw).context("Bad reply")?;
        print_reply(&reply)
    }
}

fn print_reply(r: &Reply) -> Result<()> {
    println!(
        "  EID {} -> {} tag {} type {}",
        r.header.src, r.header.dest, r.header.tag, r.msg_type
    );
    match r.msg_type {
        mctp::MCTP_TYPE_CONTROL => print_control(&r.body),
        mctp::MCTP_TYPE_CXL_FM => print_fmapi(&r.body)?,
        t => println!("  unknown type {t}"),
    }
    Ok(())
}

fn print_control(body: &[u8]) {
    let [iid, cmd, cc, data @ ..] = body else {
        println!("  short control reply");
        return;
    };
    println!("  instance {iid} command {cmd:#04x} cc {cc:#04x}");
    match (cmd, data) {
        (0x01, [_status, eid, ..]) => println!("  assigned EID {eid}"),
        (0x02, [eid, ..]) => println!("  EID {eid}"),
        _ => println!("  {}", hex(data)),
    }
}

fn print_fmapi(body: &[u8]) -> Result<()> {
    let ((rest, _), h) = CciMessageHeader::from_bytes((body, 0))
        .map_err(|e| anyhow::anyhow!("Bad CCI header: {e:?}"))?;
    println!(
        "  CCI set {:#04x} command {:#04x} rc {} tag {} len {}",
        h.command_set,
        h.command,
        h.return_code,
        h.tag,
        h.payload_length()
    );

    if h.command_set != CommandSet::PhysicalSwitch as u8 {
        println!("  {}", hex(rest));
        return Ok(());
    }
    if h.command == PhysicalSwitchCmd::IdentifySwitch as u8 {
        let (_, id) = IdentifySwitchResp::from_bytes((rest, 0))
            .map_err(|e| anyhow::anyhow!("Bad identify response: {e:?}"))?;
        println!(
            "  ingress {} ports {} VCSs {} vPPBs {}/{}",
            id.ingress_port_id,
            id.num_physical_ports,
            id.num_vcs,
            id.num_active_vppb,
            id.num_total_vppb
        );
        println!("  active ports {}", hex(&id.active_port_bitmask));
    } else if h.command == PhysicalSwitchCmd::GetPhysicalPortState as u8 {
        let ((mut rest, _), ph) = PortStateRespHeader::from_bytes((rest, 0))
            .map_err(|e| anyhow::anyhow!("Bad port state response: {e:?}"))?;
        println!("  {} ports", ph.num_ports);
        for _ in 0..ph.num_ports {
            let ((r, _), b) = PortStateInfoBlock::from_bytes((rest, 0))
                .map_err(|e| anyhow::anyhow!("Bad port info block: {e:?}"))?;
            rest = r;
            println!(
                "  port {:3} state {} device {} width x{} speed {} ltssm {} LDs {}",
                b.port_id,
                b.config_state,
                b.connected_device_type,
                b.negotiated_link_width,
                b.current_link_speed,
                b.ltssm_state,
                b.supported_ld_count
            );
        }
    } else {
        println!("  {}", hex(rest));
    }
    Ok(())
}

fn print_ports(switch: &MctpI2cSwitch) {
    for p in switch.topology().ports() {
        let role = if p.is_upstream() { "upstream" } else { "downstream" };
        println!(
            "port {:2} {:10} {:?} x{} {:?} LDs {}",
            p.id,
            role,
            p.connected_device,
            p.negotiated_link_width,
            p.current_speed,
            p.supported_ld_count
        );
    }
}

fn run_script(session: &mut Session, file: &str) -> Result<()> {
    let input: Box<dyn BufRead> = if file == "-" {
        Box::new(std::io::stdin().lock())
    } else {
        let f = std::fs::File::open(file).with_context(|| format!("Opening {file}"))?;
        Box::new(std::io::BufReader::new(f))
    };

    for (n, line) in input.lines().enumerate() {
        let line = line?;
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        session
            .run(&words)
            .with_context(|| format!("{file} line {}", n + 1))?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();

    let level = if args.trace {
        log::LevelFilter::Trace
    } else if args.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .init();

    match &args.command {
        Command::Version(_) => info!("cxl-switch-sim {}", env!("VERSION")),
        Command::Send(s) => {
            let mut session = Session::new(&args)?;
            let words: Vec<&str> = s.request.iter().map(|w| w.as_str()).collect();
            session.run(&words)?;
        }
        Command::Script(s) => {
            let mut session = Session::new(&args)?;
            run_script(&mut session, &s.file)?;
        }
        Command::Ports(_) => {
            let session = Session::new(&args)?;
            print_ports(&session.switch);
        }
    }
    Ok(())
}
