use usbhost::Error;

fn string_or(handle: &usbhost::DeviceHandle, index: u8) -> String {
    if index == 0 {
        return "-".into();
    }
    handle
        .read_string_descriptor(index)
        .unwrap_or_else(|e| format!("? ({})", e))
}

fn main() -> usbhost::Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .map_err(|_| Error::Other)?;

    let ctx = usbhost::init()?;
    for device in ctx.devices()?.iter() {
        let desc = device.device_descriptor();
        let handle = match device.open() {
            Ok(h) => h,
            Err(e) => {
                log::warn!("{}: open failed: {}", device, e);
                continue;
            }
        };
        println!("{}", device);
        println!("  Manufacturer: {}", string_or(&handle, desc.imanufacturer));
        println!("  Product: {}", string_or(&handle, desc.iproduct));
        println!("  Serial: {}", string_or(&handle, desc.iserial_number));
        match handle.get_configuration() {
            Ok(config) => println!("  Configuration: {}", config),
            Err(e) => println!("  Configuration: ? ({})", e),
        }
        handle.close();
    }
    ctx.exit()
}
