use serde::Serialize;
use serde_json::json;
use usbhost::{ConfigDescriptor, DeviceDescriptor};

#[derive(Serialize)]
struct Entry {
    bus: u8,
    address: u8,
    ports: Vec<u8>,
    device: DeviceDescriptor,
    configurations: Vec<ConfigDescriptor>,
}

#[derive(Serialize)]
struct Listing {
    devices: Vec<Entry>,
}

fn main() -> usbhost::Result<()> {
    let ctx = usbhost::init()?;
    let mut listing = Listing { devices: Vec::new() };
    for device in ctx.devices()?.iter() {
        let desc = device.device_descriptor();
        let configurations = (0..desc.num_configurations)
            .filter_map(|i| device.config_descriptor(i).ok())
            .collect();
        listing.devices.push(Entry {
            bus: device.bus_number(),
            address: device.device_address(),
            ports: device.port_path(),
            device: desc,
            configurations,
        });
    }

    match toml::to_string(&listing) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("toml: {}", e),
    }
    println!("{}", json!(listing));
    ctx.exit()
}
