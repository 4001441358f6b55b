//! Open a Kinect v2, print its calibration, and count streamed packets.
//!
//! Usage: cargo run --example stream -- [serial] [-norgb | -nodepth] [-frames N]
//! Ctrl+C stops and closes the device. To pause and unpause:
//! pkill -USR1 stream

use crossbeam_channel::Sender;
use kinect2::{DeviceCommand, DeviceConfig, Driver, Kinect2Error, PacketStream, Streams};
use std::time::{Duration, Instant};

fn usage() -> ! {
    eprintln!("Usage: stream [<device serial>] [-norgb | -nodepth] [-frames <count>]");
    eprintln!("To pause and unpause: pkill -USR1 stream");
    std::process::exit(1);
}

#[cfg(unix)]
fn forward_signals(commands: Sender<DeviceCommand>) -> std::io::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGUSR1])?;
    std::thread::Builder::new()
        .name("stream-signals".into())
        .spawn(move || {
            let mut paused = false;
            for signal in signals.forever() {
                let command = match signal {
                    SIGUSR1 => {
                        paused = !paused;
                        if paused {
                            DeviceCommand::Pause
                        } else {
                            DeviceCommand::Resume
                        }
                    }
                    _ => DeviceCommand::Shutdown,
                };
                if commands.send(command).is_err() || command == DeviceCommand::Shutdown {
                    break;
                }
            }
        })?;
    Ok(())
}

#[cfg(not(unix))]
fn forward_signals(_commands: Sender<DeviceCommand>) -> std::io::Result<()> {
    Ok(())
}

/// Count packets until both streams close or `max_packets` arrive.
fn consume(
    color: PacketStream,
    ir: PacketStream,
    max_packets: Option<u64>,
    commands: Sender<DeviceCommand>,
) {
    let start = Instant::now();
    let mut color_packets: u64 = 0;
    let mut ir_packets: u64 = 0;
    let mut last_report = Instant::now();
    let mut requested_shutdown = false;

    loop {
        while let Some(_packet) = color.try_recv() {
            color_packets += 1;
        }
        match ir.recv_timeout(Duration::from_millis(100)) {
            Ok(_) => ir_packets += 1,
            Err(Kinect2Error::Timeout) => {}
            Err(_) => break,
        }

        let total = color_packets + ir_packets;
        if !requested_shutdown && max_packets.is_some_and(|max| total >= max) {
            let _ = commands.send(DeviceCommand::Shutdown);
            requested_shutdown = true;
        }

        if last_report.elapsed() >= Duration::from_secs(3) {
            println!(
                "--- colour {} ({} dropped), ir {} ({} dropped) in {:.1}s ---",
                color_packets,
                color.dropped(),
                ir_packets,
                ir.dropped(),
                start.elapsed().as_secs_f64(),
            );
            last_report = Instant::now();
        }
    }

    println!(
        "Received {} colour and {} ir packets",
        color_packets, ir_packets
    );
}

fn main() {
    env_logger::init();

    let mut serial: Option<String> = None;
    let mut streams = Streams::COLOR | Streams::DEPTH;
    let mut max_packets: Option<u64> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-norgb" | "--norgb" => streams.remove(Streams::COLOR),
            "-nodepth" | "--nodepth" => streams.remove(Streams::DEPTH),
            "-frames" => match args.next().and_then(|n| n.parse().ok()) {
                Some(n) => max_packets = Some(n),
                None => usage(),
            },
            "-h" | "-help" | "--help" => usage(),
            s if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
                serial = Some(s.to_string())
            }
            _ => usage(),
        }
    }
    if streams.is_empty() {
        eprintln!("Disabling both streams leaves nothing to do.");
        std::process::exit(1);
    }

    let driver = match Driver::new() {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Failed to initialise libusb: {}", e);
            std::process::exit(1);
        }
    };

    let config = DeviceConfig::from_env();
    let opened = match &serial {
        Some(s) => driver.open_serial(s, config),
        None => driver.open_first(config),
    };
    let mut device = match opened {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Failed to open device: {}", e);
            std::process::exit(1);
        }
    };

    let color = device.color_stream(kinect2::stream::DEFAULT_CAPACITY);
    let ir = device.ir_stream(kinect2::stream::DEFAULT_CAPACITY);
    let (color, ir) = match (color, ir) {
        (Ok(c), Ok(i)) => (c, i),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("Failed to attach streams: {}", e);
            std::process::exit(1);
        }
    };

    let (commands, receiver) = crossbeam_channel::unbounded();
    if let Err(e) = forward_signals(commands.clone()) {
        eprintln!("Failed to install signal handlers: {}", e);
        std::process::exit(1);
    }

    println!("Serial:   {}", device.serial_number());
    println!("Streaming (Ctrl+C to stop, SIGUSR1 to pause/resume)...");

    let consumer = {
        let commands = commands.clone();
        std::thread::spawn(move || consume(color, ir, max_packets, commands))
    };
    drop(commands);

    // Calibration is read by the first start; print it once streaming runs.
    let result = device.run(streams, &receiver);
    println!("Firmware: {}", device.firmware_version());
    println!("IR:       {:?}", device.ir_camera_params());
    let colour = device.color_camera_params();
    println!(
        "Colour:   fx={:.2} cx={:.2} cy={:.2}",
        colour.fx, colour.cx, colour.cy
    );

    // Dropping the device drops the pools' sinks, which ends the consumer.
    drop(device);
    if consumer.join().is_err() {
        eprintln!("Packet consumer panicked");
    }
    if let Err(e) = result {
        eprintln!("Streaming failed: {}", e);
        std::process::exit(1);
    }
}
