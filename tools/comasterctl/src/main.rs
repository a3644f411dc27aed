// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::too_many_lines)]

use comaster::logging::{init_logger, ConsoleOutput};
use comaster::protocol::describe;
use comaster::transport::Direction;
use comaster::{
    Dictionary, DriverKind, Master, PortConfig, ReadStatus, RegisterId, Result, MINIMAL_MODEL,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const USAGE: &str = "\
comasterctl: CANopen master toolbox

Usage:
  comasterctl dump   <schema.eds>
  comasterctl lookup <schema.eds> <index> <subindex>
  comasterctl read   <ifname> <node> <index> <subindex> [schema.eds]
  comasterctl sniff  <ifname> [seconds]

Numbers accept decimal or 0x-prefixed hex. Set COMASTER_LOG=debug for
stack logs on stderr.";

fn main() {
    let args: Vec<String> = std::env::args().collect();
    install_logger();

    let outcome = match args.get(1).map(String::as_str) {
        Some("dump") if args.len() == 3 => dump(&args[2]),
        Some("lookup") if args.len() == 5 => lookup(&args[2], &args[3], &args[4]),
        Some("read") if args.len() == 6 || args.len() == 7 => {
            read(&args[2], &args[3], &args[4], &args[5], args.get(6))
        }
        Some("sniff") if args.len() == 3 || args.len() == 4 => sniff(&args[2], args.get(3)),
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    };

    if let Err(e) = outcome {
        eprintln!("[FAIL] {}", e);
        std::process::exit(1);
    }
}

fn install_logger() {
    let level = match std::env::var("COMASTER_LOG").as_deref() {
        Ok("trace") => log::Level::Trace,
        Ok("debug") => log::Level::Debug,
        Ok("info") => log::Level::Info,
        _ => log::Level::Warn,
    };
    init_logger(Arc::new(ConsoleOutput::new(level)), level.to_level_filter());
}

/// Decimal or `0x` hex.
fn parse_number(text: &str) -> Option<u32> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn parse_register(index: &str, sub: &str) -> Result<RegisterId> {
    let index = parse_number(index).and_then(|v| u16::try_from(v).ok());
    let sub = parse_number(sub).and_then(|v| u8::try_from(v).ok());
    match (index, sub) {
        (Some(index), Some(sub)) => Ok(RegisterId::new(index, sub)),
        _ => Err(comaster::Error::Config(
            "register must be <index 0..0xFFFF> <subindex 0..0xFF>".to_string(),
        )),
    }
}

fn dump(path: &str) -> Result<()> {
    let dict = Dictionary::from_file(path)?;
    let info = dict.info();
    println!(
        "{}: vendor 0x{:08X} product 0x{:08X} revision 0x{:08X}, {} registers",
        path,
        info.vendor,
        info.product,
        info.revision,
        dict.len()
    );
    println!("---");
    for (_, desc) in dict.iter() {
        println!(
            "{}  {:8} {:6} {:3}  {}",
            desc.id,
            desc.kind.to_string(),
            desc.access.to_string(),
            if desc.pdo_mappable { "map" } else { "" },
            desc.name
        );
    }
    Ok(())
}

fn lookup(path: &str, index: &str, sub: &str) -> Result<()> {
    let dict = Dictionary::from_file(path)?;
    let id = parse_register(index, sub)?;
    let key = dict.find(id.index(), id.subindex())?;
    let desc = dict.entry(key)?;
    println!("register   {}", desc.id);
    println!("name       {}", desc.name);
    println!("kind       {}", desc.kind);
    println!("access     {}", desc.access);
    println!("mappable   {}", desc.pdo_mappable);
    match &desc.default {
        Some(value) => println!("default    {}", value),
        None => println!("default    -"),
    }
    Ok(())
}

fn open_bus(master: &Master, ifname: &str) -> Result<()> {
    master.open_port(&PortConfig {
        name: "bus".to_string(),
        driver: DriverKind::SocketCan,
        channel: ifname.to_string(),
        bitrate: None,
    })?;
    Ok(())
}

fn read(ifname: &str, node: &str, index: &str, sub: &str, schema: Option<&String>) -> Result<()> {
    let node = parse_number(node)
        .and_then(|v| u8::try_from(v).ok())
        .ok_or_else(|| comaster::Error::Config(format!("bad node id '{}'", node)))?;
    let id = parse_register(index, sub)?;

    let master = Master::new();
    let model = match schema {
        Some(path) => {
            master.registry().create("cli", path)?;
            "cli"
        }
        None => MINIMAL_MODEL,
    };
    open_bus(&master, ifname)?;
    let device = master.create_device(1, node, "bus", model)?;

    let start = Instant::now();
    let sample = device.read_and_get(id, Duration::from_millis(500))?;
    match (sample.status, &sample.value) {
        (ReadStatus::New, Some(value)) => {
            println!("{} = {} ({:?})", id, value, start.elapsed());
            Ok(())
        }
        (status, _) => {
            eprintln!("{}: no answer ({:?})", id, status);
            std::process::exit(1);
        }
    }
}

fn sniff(ifname: &str, seconds: Option<&String>) -> Result<()> {
    let limit = seconds
        .and_then(|s| parse_number(s))
        .map(|s| Duration::from_secs(u64::from(s)));

    let master = Master::new();
    open_bus(&master, ifname)?;
    let port = master.port("bus")?;
    port.trace_enable(true);

    println!("comasterctl: sniffing {} (Ctrl+C to stop)", ifname);
    println!("---");
    let start = Instant::now();
    loop {
        if let Some(limit) = limit {
            if start.elapsed() >= limit {
                break;
            }
        }
        let Some(record) = port.trace_pop(Duration::from_millis(200)) else {
            continue;
        };
        let arrow = match record.direction {
            Direction::Rx => "<-",
            Direction::Tx => "->",
        };
        println!(
            "{:>10.3} {} {:<32} {}",
            record.at.duration_since(start).as_secs_f64(),
            arrow,
            record.frame.to_string(),
            describe(&record.frame)
        );
    }
    port.trace_enable(false);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("0x1018"), Some(0x1018));
        assert_eq!(parse_number("0X1a"), Some(0x1A));
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number("0xZZ"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn test_parse_register() {
        assert_eq!(
            parse_register("0x6041", "0").unwrap(),
            RegisterId::new(0x6041, 0)
        );
        assert!(parse_register("0x10000", "0").is_err());
        assert!(parse_register("0x1018", "256").is_err());
    }
}
