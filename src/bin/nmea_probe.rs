//! NMEA Receiver Probe
//!
//! Dumps sentences from a serial GPS receiver with checksum verification.
//! Useful for confirming wiring and baud rate before pointing the monitor
//! at a device.

use clap::Parser;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_serial::SerialPortBuilderExt;

const KNOTS_TO_KMH: f64 = 1.852;

// A sentence is at most 82 bytes; anything longer without a newline
// means the baud rate is wrong and the buffer is filling with garbage.
const MAX_LINE: usize = 4096;

#[derive(Parser, Debug)]
#[command(name = "nmea_probe", about = "NMEA receiver probe")]
struct Args {
    #[arg(long, default_value = "/dev/ttyUSB0")]
    device: String,

    #[arg(long, default_value = "9600")]
    baud: u32,

    /// Print lines as received, without checksum verification
    #[arg(long)]
    raw: bool,

    /// Stop after this many sentences (0 = run until interrupted)
    #[arg(long, default_value = "0")]
    count: u64,
}

/// Verify the checksum of a framed sentence. None means the line is not
/// framed as `$payload*HH` at all.
fn verify_checksum(line: &str) -> Option<bool> {
    let body = line.strip_prefix('$')?;
    let star = body.rfind('*')?;
    let given = u8::from_str_radix(body.get(star + 1..star + 3)?, 16).ok()?;
    let computed = body[..star].bytes().fold(0u8, |acc, b| acc ^ b);
    Some(computed == given)
}

/// Pull status and speed out of an RMC sentence without full parsing.
fn describe_rmc(line: &str) -> Option<String> {
    let body = line.strip_prefix('$')?;
    let payload = &body[..body.rfind('*')?];
    let fields: Vec<&str> = payload.split(',').collect();
    if fields.len() < 10 || !fields[0].ends_with("RMC") {
        return None;
    }
    let status = match fields[2] {
        "A" => "fix",
        "V" => "void",
        other => other,
    };
    match fields[7].parse::<f64>() {
        Ok(knots) => Some(format!("{} {:.1}km/h", status, knots * KNOTS_TO_KMH)),
        Err(_) => Some(format!("{} no-speed", status)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    println!("NMEA receiver probe");
    println!("  device: {} @ {}baud", args.device, args.baud);
    println!();

    let mut port = tokio_serial::new(&args.device, args.baud)
        .timeout(Duration::from_millis(100))
        .open_native_async()?;

    let mut read_buf = vec![0u8; 512];
    let mut line_buf: Vec<u8> = Vec::with_capacity(1024);

    let mut total = 0u64;
    let mut bad = 0u64;
    let mut rmc = 0u64;

    'outer: loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            result = port.read(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        eprintln!("device closed");
                        break;
                    }
                    Ok(n) => {
                        line_buf.extend_from_slice(&read_buf[..n]);
                        while let Some(pos) = line_buf.iter().position(|&b| b == b'\n') {
                            let line: Vec<u8> = line_buf.drain(..=pos).collect();
                            let Ok(text) = std::str::from_utf8(&line) else {
                                bad += 1;
                                continue;
                            };
                            let text = text.trim_end();
                            if text.is_empty() {
                                continue;
                            }
                            total += 1;

                            let stamp = chrono::Local::now().format("%H:%M:%S%.3f");
                            if args.raw {
                                println!("[{stamp}]     {text}");
                            } else {
                                match verify_checksum(text) {
                                    Some(true) => match describe_rmc(text) {
                                        Some(desc) => {
                                            rmc += 1;
                                            println!("[{stamp}] ok  {text}  ({desc})");
                                        }
                                        None => println!("[{stamp}] ok  {text}"),
                                    },
                                    Some(false) => {
                                        bad += 1;
                                        println!("[{stamp}] BAD {text}");
                                    }
                                    None => {
                                        bad += 1;
                                        println!("[{stamp}] --- {text}");
                                    }
                                }
                            }

                            if args.count > 0 && total >= args.count {
                                break 'outer;
                            }
                        }
                        if line_buf.len() > MAX_LINE {
                            bad += 1;
                            line_buf.clear();
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::TimedOut => {}
                    Err(e) => {
                        eprintln!("read error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    println!();
    println!("sentences: {}  bad: {}  rmc: {}", total, bad, rmc);
    Ok(())
}
