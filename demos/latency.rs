//! Measures SDO round trips on a simulated slave.
//!
//! usage: latency [SAMPLES] [DELAY-US]
use ethercat_bus::{
    sim::{SimBus, SimDevice},
    BusBuilder, SlavePos,
};
use std::{env, io, time::Duration};

pub fn main() -> Result<(), io::Error> {
    env_logger::init();
    let args: Vec<_> = env::args().collect();
    let parse = |i: usize, default: u64| {
        args.get(i)
            .map(|a| a.parse::<u64>())
            .unwrap_or(Ok(default))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    };
    let samples = parse(1, 1000)? as usize;
    let delay = Duration::from_micros(parse(2, 200)?);

    let sim = SimBus::new()
        .with_device(SimDevice::ek1100())
        .with_device(SimDevice::el3104());
    sim.set_sdo_delay(delay);

    let bus = BusBuilder::new().adapter("sim0").build(sim)?;
    bus.open()?;
    let stats = bus.probe_latency(SlavePos::new(1), samples)?;
    bus.close();

    println!("samples  {}", stats.count);
    println!("errors   {}", stats.errors);
    println!("min      {:.3} ms", stats.min_ms);
    println!("mean     {:.3} ms", stats.mean_ms);
    println!("median   {:.3} ms", stats.median_ms);
    println!("p95      {:.3} ms", stats.p95_ms);
    println!("p99      {:.3} ms", stats.p99_ms);
    println!("max      {:.3} ms", stats.max_ms);
    println!("std      {:.3} ms", stats.std_ms);
    Ok(())
}
