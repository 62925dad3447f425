use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use usbhost::{Capabilities, Error, HotplugFilter};

fn main() -> usbhost::Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .init()
        .map_err(|_| Error::Other)?;

    let term = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGQUIT, SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&term))?;
    }

    let ctx = usbhost::init()?;
    if ctx.has_capability(Capabilities::HAS_HOTPLUG) {
        ctx.register_hotplug_callback(HotplugFilter::default().enumerate(), |_, device, event| {
            println!("{:?} {}", event, device);
            false
        })?;
        while !term.load(Ordering::Relaxed) {
            match ctx.handle_events_timeout(Duration::from_millis(200)) {
                Ok(()) | Err(Error::Interrupted) => {}
                Err(e) => return Err(e),
            }
        }
    } else {
        // no hotplug support, poll the device list instead
        log::info!("{} has no hotplug, polling", ctx.backend().name());
        let mut known = HashSet::new();
        while !term.load(Ordering::Relaxed) {
            let now: HashSet<u64> = ctx.devices()?.iter().map(|d| d.session_id()).collect();
            for id in now.difference(&known) {
                if let Some(device) = ctx.device_by_session_id(*id) {
                    println!("Arrived {}", device);
                }
            }
            for id in known.difference(&now) {
                println!("Left {:03}:{:03}", id >> 8, id & 0xff);
            }
            known = now;
            std::thread::sleep(Duration::from_millis(500));
        }
    }
    ctx.exit()
}
