//! List connected Kinect v2 devices.
//!
//! Usage: cargo run --example enumerate

fn main() {
    env_logger::init();

    let driver = match kinect2::Driver::new() {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Failed to initialise libusb: {}", e);
            std::process::exit(1);
        }
    };

    let devices = match driver.list_devices() {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Enumeration failed: {}", e);
            std::process::exit(1);
        }
    };

    if devices.is_empty() {
        println!("No Kinect v2 devices found.");
        return;
    }

    for (i, info) in devices.iter().enumerate() {
        println!(
            "[{}] serial={} bus={:03} address={:03} pid=0x{:04x}{}",
            i,
            info.serial,
            info.bus_number,
            info.address,
            info.product_id,
            if info.is_preview() { " (preview)" } else { "" },
        );
    }
}
