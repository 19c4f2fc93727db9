//! Runs a simulated coupler with digital and analog terminals through a
//! full open/close cycle, including a cable loss and reconnect.
//!
//! usage: simulated_bus [MAPPING-FILE]
use ethercat_bus::{
    beckhoff::{Ek1100, El1008, El2008, El3104, El4132},
    sim::{InputMode, SimBus, SimDevice},
    BusBuilder, PdoMapping, ReconnectPolicy, SlavePos,
};
use std::{env, io, sync::Arc, thread, time::Duration};

pub fn main() -> Result<(), io::Error> {
    env_logger::init();
    let args: Vec<_> = env::args().collect();
    let mapping = match args.len() {
        1 => PdoMapping::new(),
        2 => PdoMapping::load(&args[1])?,
        _ => {
            println!("usage: {} [MAPPING-FILE]", env!("CARGO_PKG_NAME"));
            return Ok(());
        }
    };

    let sim = SimBus::new()
        .with_device(SimDevice::ek1100())
        .with_device(SimDevice::el1008().input_mode(InputMode::Counter))
        .with_device(SimDevice::el2008())
        .with_device(SimDevice::el3104().input_mode(InputMode::Counter))
        .with_device(SimDevice::el4132());

    let bus = BusBuilder::new()
        .adapter("sim0")
        .mapping(mapping)
        .reconnect(ReconnectPolicy {
            loss_threshold: 2,
            initial_backoff: Duration::from_millis(200),
            ..ReconnectPolicy::default()
        })
        .build(sim.clone())?;

    for slave in bus.discover(None, None)? {
        println!(
            "{:>2}: {:<8} vendor 0x{:08X} product 0x{:08X}  in {}B out {}B",
            slave.position,
            slave.name,
            slave.id.vendor_id,
            slave.id.product_code,
            slave.input_bytes(),
            slave.output_bytes()
        );
    }

    let din = Arc::new(El1008::new(1));
    let dout = Arc::new(El2008::new(2));
    let ain = Arc::new(El3104::new(3));
    let aout = Arc::new(El4132::new(4));
    bus.register_slave(Arc::new(Ek1100::new(0)))?;
    bus.register_slave(din.clone())?;
    bus.register_slave(dout.clone())?;
    bus.register_slave(ain.clone())?;
    bus.register_slave(aout.clone())?;

    bus.open()?;
    for i in 0..10u8 {
        dout.set_outputs(1 << (i % 8));
        aout.set_value(1, i16::from(i) * 1000);
        thread::sleep(Duration::from_millis(100));
        log::info!(
            "inputs 0b{:08b}, analog ch1 {}, outputs on wire {:?}",
            din.inputs(),
            ain.channel(1).map_or(0, |ch| ch.value),
            sim.transmitted(SlavePos::new(2))
        );
    }

    log::info!("pulling the cable");
    sim.disconnect();
    thread::sleep(Duration::from_millis(1500));
    log::info!("bus is {} while disconnected", bus.state());
    sim.reconnect();
    while !bus.state().is_operational() {
        if bus.state().fault().is_some() {
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }

    let status = bus.status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    bus.close();
    Ok(())
}
