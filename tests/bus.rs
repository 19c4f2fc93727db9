// Part of ethercat-bus. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

use ethercat_bus::beckhoff::{El1008, El2008};
use ethercat_bus::sim::{InputMode, SimBus, SimDevice};
use ethercat_bus::{
    AlState, AlStatusCode, Bus, BusBuilder, BusState, ErrorKind, GenericSlave, PdoMapping,
    ReconnectPolicy, SlaveHandle, SlavePos,
};
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

const SCENARIO: &str = r#"{
    "network": { "adapter": "sim0", "cycle_ms": 1.0 },
    "slaves": { "0": { "rx_pdo": ["0x1600"], "tx_pdo": ["0x1A00"] } }
}"#;

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn pos(p: u16) -> SlavePos {
    SlavePos::new(p)
}

fn bus_on(sim: &SimBus) -> Bus<SimBus> {
    BusBuilder::new()
        .adapter("sim0")
        .state_timeout(Duration::from_millis(500))
        .build(sim.clone())
        .unwrap()
}

fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn scenario_outputs_reach_the_wire() {
    init_log();
    let sim = SimBus::new().with_device(SimDevice::io_module());
    let bus = BusBuilder::new()
        .mapping(PdoMapping::from_json_str(SCENARIO).unwrap())
        .build(sim.clone())
        .unwrap();
    let io = Arc::new(GenericSlave::new(0, 1, 1));
    bus.register_slave(io.clone()).unwrap();

    bus.open().unwrap();
    assert_eq!(bus.state(), BusState::Operational);
    assert_eq!(sim.slave_state(pos(0)), Some(AlState::Op));

    io.set_output(&[0xFF]).unwrap();
    assert!(wait_for(Duration::from_secs(1), || sim.transmitted(pos(0)) == vec![0xFF]));

    bus.close();
    assert_eq!(bus.state(), BusState::Idle);
    assert_eq!(sim.open_links(), 0);
    assert_eq!(sim.slave_state(pos(0)), Some(AlState::Init));
    // close() zeroes outputs before the last frame
    assert_eq!(sim.transmitted(pos(0)), vec![0]);
}

#[test]
fn repeated_open_close() {
    init_log();
    let sim = SimBus::new()
        .with_device(SimDevice::ek1100())
        .with_device(SimDevice::el1008())
        .with_device(SimDevice::el2008());
    let bus = bus_on(&sim);
    bus.register_slave(Arc::new(El1008::new(1))).unwrap();
    bus.register_slave(Arc::new(El2008::new(2))).unwrap();
    for _ in 0..3 {
        bus.open().unwrap();
        assert!(bus.state().is_operational());
        assert_eq!(sim.open_links(), 1);
        bus.close();
        assert_eq!(bus.state(), BusState::Idle);
        assert_eq!(sim.open_links(), 0);
    }
}

#[test]
fn close_is_idempotent_and_thread_safe() {
    init_log();
    let sim = SimBus::new().with_device(SimDevice::io_module());
    let bus = Arc::new(bus_on(&sim));
    bus.close();
    bus.open().unwrap();
    let other = bus.clone();
    thread::spawn(move || other.close()).join().unwrap();
    assert_eq!(bus.state(), BusState::Idle);
    bus.close();
    assert_eq!(bus.state(), BusState::Idle);
    assert_eq!(sim.open_links(), 0);
}

#[test]
fn discovery_is_idempotent() {
    init_log();
    let sim = SimBus::new()
        .with_device(SimDevice::ek1100())
        .with_device(SimDevice::el1008())
        .with_device(SimDevice::io_module());
    let bus = bus_on(&sim);
    let first = bus.discover(None, None).unwrap();
    let second = bus.discover(None, None).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
    assert_eq!(first[1].input_bytes(), 1);
    assert_eq!((first[2].input_bytes(), first[2].output_bytes()), (1, 1));
    assert_eq!(bus.slaves(), first);
    assert_eq!(bus.state(), BusState::Idle);
    assert_eq!(sim.open_links(), 0);
}

#[test]
fn discovery_applies_a_mapping() {
    init_log();
    let sim = SimBus::new().with_device(SimDevice::io_module());
    let bus = bus_on(&sim);
    let mapping = PdoMapping::from_json_str(
        r#"{"default": {"rx_pdo": ["0x1601"], "tx_pdo": ["0x1A00", "0x1A01"]}}"#,
    )
    .unwrap();
    let slaves = bus.discover(Some("sim0"), Some(&mapping)).unwrap();
    assert_eq!((slaves[0].input_bytes(), slaves[0].output_bytes()), (3, 2));
}

#[test]
fn connection_errors() {
    init_log();
    let sim = SimBus::new().with_device(SimDevice::io_module());
    let bus = BusBuilder::new().adapter("eth9").build(sim.clone()).unwrap();
    let err = bus.open().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(err.to_string().contains("eth9"));
    assert_eq!(bus.state(), BusState::Idle);

    let empty = SimBus::new();
    let bus = bus_on(&empty);
    assert_eq!(bus.open().unwrap_err().kind(), ErrorKind::Connection);
    assert_eq!(bus.discover(None, None).unwrap_err().kind(), ErrorKind::Connection);
    assert_eq!(bus.state(), BusState::Idle);
    assert_eq!(empty.open_links(), 0);
}

#[test]
fn empty_scan_is_a_connection_error() {
    use ethercat_bus::sim::SimLink;
    use ethercat_bus::{
        Adapter, ImageSize, Link, LinkError, LinkProvider, LinkResult, PdoIdx, SlaveInfo,
        SlaveState,
    };

    // a master that reports an empty ring as a successful scan
    struct SilentRing(SimBus);
    struct SilentLink(SimLink);

    impl LinkProvider for SilentRing {
        type Link = SilentLink;

        fn open(&self, adapter: &str) -> LinkResult<SilentLink> {
            self.0.open(adapter).map(SilentLink)
        }

        fn adapters(&self) -> LinkResult<Vec<Adapter>> {
            self.0.adapters()
        }
    }

    impl Link for SilentLink {
        fn scan(&mut self) -> LinkResult<Vec<SlaveInfo>> {
            match self.0.scan() {
                Err(LinkError::NoSlaves) => Ok(Vec::new()),
                other => other,
            }
        }
        fn apply_pdo_assignment(
            &mut self,
            slave: SlavePos,
            rx: &[PdoIdx],
            tx: &[PdoIdx],
        ) -> LinkResult<()> {
            self.0.apply_pdo_assignment(slave, rx, tx)
        }
        fn map_process_data(&mut self) -> LinkResult<Vec<ImageSize>> {
            self.0.map_process_data()
        }
        fn request_state(&mut self, state: AlState) -> LinkResult<()> {
            self.0.request_state(state)
        }
        fn read_states(&mut self) -> LinkResult<Vec<SlaveState>> {
            self.0.read_states()
        }
        fn request_slave_state(
            &mut self,
            slave: SlavePos,
            state: AlState,
            ack: bool,
        ) -> LinkResult<()> {
            self.0.request_slave_state(slave, state, ack)
        }
        fn reconfigure_slave(&mut self, slave: SlavePos) -> LinkResult<bool> {
            self.0.reconfigure_slave(slave)
        }
        fn recover_slave(&mut self, slave: SlavePos) -> LinkResult<bool> {
            self.0.recover_slave(slave)
        }
        fn exchange(&mut self) -> LinkResult<u16> {
            self.0.exchange()
        }
        fn expected_wkc(&self) -> u16 {
            self.0.expected_wkc()
        }
        fn inputs(&self, slave: SlavePos) -> &[u8] {
            self.0.inputs(slave)
        }
        fn outputs_mut(&mut self, slave: SlavePos) -> &mut [u8] {
            self.0.outputs_mut(slave)
        }
        fn sdo_read(
            &mut self,
            slave: SlavePos,
            index: u16,
            subindex: u8,
            buf: &mut [u8],
        ) -> LinkResult<usize> {
            self.0.sdo_read(slave, index, subindex, buf)
        }
        fn close(&mut self) {
            self.0.close()
        }
    }

    init_log();
    let empty = SimBus::new();
    let bus = BusBuilder::new()
        .adapter("sim0")
        .state_timeout(Duration::from_millis(200))
        .build(SilentRing(empty.clone()))
        .unwrap();

    let err = bus.discover(None, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(err.to_string().contains("No slaves responding on 'sim0'"));
    assert_eq!(empty.open_links(), 0);

    let err = bus.open().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(bus.state(), BusState::Idle);
    assert_eq!(empty.open_links(), 0);
    assert_eq!(empty.exchanges(), 0);
}

#[test]
fn buffer_length_mismatch() {
    init_log();
    let sim = SimBus::new().with_device(SimDevice::io_module());
    let bus = bus_on(&sim);
    bus.register_slave(Arc::new(GenericSlave::new(0, 2, 1))).unwrap();
    assert_eq!(bus.open().unwrap_err().kind(), ErrorKind::Configuration);
    assert_eq!(bus.state(), BusState::Idle);
    assert_eq!(sim.open_links(), 0);
}

#[test]
fn handle_beyond_the_segment() {
    init_log();
    let sim = SimBus::new().with_device(SimDevice::io_module());
    let bus = bus_on(&sim);
    bus.register_slave(Arc::new(GenericSlave::new(4, 1, 1))).unwrap();
    assert_eq!(bus.open().unwrap_err().kind(), ErrorKind::Configuration);
    assert_eq!(bus.state(), BusState::Idle);
}

#[test]
fn rejected_mapping() {
    init_log();
    let sim = SimBus::new().with_device(SimDevice::io_module());
    let bus = BusBuilder::new()
        .mapping(PdoMapping::from_json_str(SCENARIO).unwrap())
        .build(sim.clone())
        .unwrap();
    bus.register_slave(Arc::new(GenericSlave::new(0, 1, 1))).unwrap();
    sim.reject_mapping(pos(0), true);
    assert_eq!(bus.open().unwrap_err().kind(), ErrorKind::Configuration);
    assert_eq!(bus.state(), BusState::Idle);
    assert_eq!(sim.open_links(), 0);

    sim.reject_mapping(pos(0), false);
    bus.open().unwrap();
    assert!(bus.state().is_operational());
}

#[test]
fn registration_rules() {
    init_log();
    let sim = SimBus::new()
        .with_device(SimDevice::io_module())
        .with_device(SimDevice::io_module());
    let bus = BusBuilder::new()
        .mapping(PdoMapping::from_json_str(SCENARIO).unwrap())
        .build(sim.clone())
        .unwrap();
    // the document names slave 0 only and has no default
    let err = bus.register_slave(Arc::new(GenericSlave::new(1, 1, 1))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    bus.register_slave(Arc::new(GenericSlave::new(0, 1, 1))).unwrap();
    let err = bus.register_slave(Arc::new(GenericSlave::new(0, 1, 1))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    bus.open().unwrap();
    let err = bus.register_slave(Arc::new(GenericSlave::new(1, 1, 1))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(bus.unregister_slave(pos(0)).is_err());
    bus.close();

    assert!(bus.unregister_slave(pos(0)).unwrap().is_some());
    assert!(bus.unregister_slave(pos(0)).unwrap().is_none());
}

#[test]
fn refused_state_carries_diagnostics() {
    init_log();
    let sim = SimBus::new()
        .with_device(SimDevice::ek1100())
        .with_device(SimDevice::io_module());
    let bus = bus_on(&sim);
    sim.reject_state(Some((AlState::SafeOp, AlStatusCode::INVALID_OUTPUT_MAPPING)));

    let err = bus.open().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    let diag = err.diagnostics().unwrap();
    let slave = diag.slave(pos(1)).unwrap();
    assert_eq!(slave.al_status, AlStatusCode::INVALID_OUTPUT_MAPPING);
    assert!(slave.error);
    assert!(err.to_string().contains("Slave details:"));

    match bus.state() {
        BusState::Error(fault) => assert_eq!(&fault.diagnostics, diag),
        other => panic!("expected error state, got {}", other),
    }
    assert_eq!(sim.open_links(), 0);
    assert_eq!(bus.open().unwrap_err().kind(), ErrorKind::Configuration);

    bus.close();
    assert_eq!(bus.state(), BusState::Idle);
    sim.reject_state(None);
    bus.open().unwrap();
    assert!(bus.state().is_operational());
}

#[test]
fn inputs_are_never_torn() {
    init_log();
    let sim = SimBus::new().with_device(SimDevice::io_module().input_mode(InputMode::Counter));
    let mapping = PdoMapping::from_json_str(
        r#"{"slaves": {"0": {"rx_pdo": ["0x1600"], "tx_pdo": ["0x1A00", "0x1A01"]}}}"#,
    )
    .unwrap();
    let bus = BusBuilder::new()
        .adapter("sim0")
        .mapping(mapping)
        .build(sim.clone())
        .unwrap();
    let io = Arc::new(GenericSlave::new(0, 3, 1));
    bus.register_slave(io.clone()).unwrap();
    bus.open().unwrap();

    let mut distinct = std::collections::BTreeSet::new();
    let deadline = Instant::now() + Duration::from_millis(300);
    while Instant::now() < deadline {
        let input = io.input();
        assert!(input.iter().all(|b| *b == input[0]), "torn input {:?}", input);
        distinct.insert(input[0]);
    }
    assert!(distinct.len() > 1);
}

#[test]
fn operational_only_after_a_cycle_in_op() {
    init_log();
    // inputs only: the working counter is already complete in SAFE-OP
    let sim = SimBus::new()
        .with_device(SimDevice::ek1100())
        .with_device(SimDevice::el1008());
    let bus = bus_on(&sim);
    for _ in 0..5 {
        let before = sim.op_exchanges();
        bus.open().unwrap();
        assert!(sim.op_exchanges() > before);
        assert_eq!(sim.slave_state(pos(1)), Some(AlState::Op));
        bus.close();
    }
}

#[test]
fn slave_fault_is_recovered_in_place() {
    init_log();
    let sim = SimBus::new()
        .with_device(SimDevice::io_module())
        .with_device(SimDevice::io_module());
    let bus = bus_on(&sim);
    bus.open().unwrap();

    sim.fault_slave(pos(1), AlStatusCode::SM_WATCHDOG);
    assert_eq!(sim.slave_state(pos(1)), Some(AlState::SafeOp));
    assert!(wait_for(Duration::from_secs(3), || sim.slave_state(pos(1)) == Some(AlState::Op)));
    assert!(bus.state().is_operational());
    assert_eq!(bus.status().counters.reconnects, 0);
}

#[test]
fn reconnects_after_cable_loss() {
    init_log();
    let sim = SimBus::new().with_device(SimDevice::io_module());
    let bus = BusBuilder::new()
        .adapter("sim0")
        .state_timeout(Duration::from_millis(500))
        .reconnect(ReconnectPolicy {
            loss_threshold: 2,
            max_attempts: 50,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(200),
        })
        .build(sim.clone())
        .unwrap();
    let io = Arc::new(GenericSlave::new(0, 1, 1));
    bus.register_slave(io.clone()).unwrap();
    bus.open().unwrap();

    sim.disconnect();
    assert!(wait_for(Duration::from_secs(5), || bus.status().reconnecting));
    assert!(wait_for(Duration::from_secs(1), || bus.state() == BusState::Idle));
    sim.reconnect();
    assert!(wait_for(Duration::from_secs(10), || bus.state().is_operational()));
    assert_eq!(bus.status().counters.reconnects, 1);

    io.set_output(&[0x42]).unwrap();
    assert!(wait_for(Duration::from_secs(1), || sim.transmitted(pos(0)) == vec![0x42]));
    bus.close();
    assert_eq!(sim.open_links(), 0);
}

#[test]
fn reconnect_budget_exhausted() {
    init_log();
    let sim = SimBus::new().with_device(SimDevice::io_module());
    let bus = BusBuilder::new()
        .adapter("sim0")
        .reconnect(ReconnectPolicy {
            loss_threshold: 1,
            max_attempts: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(10),
        })
        .build(sim.clone())
        .unwrap();
    bus.open().unwrap();

    sim.disconnect();
    assert!(wait_for(Duration::from_secs(5), || bus.state().fault().is_some()));
    let status = bus.status();
    assert!(!status.reconnecting);
    assert!(status.state.fault().unwrap().reason.contains("reconnect"));
    assert_eq!(sim.open_links(), 0);
    assert_eq!(bus.open().unwrap_err().kind(), ErrorKind::Configuration);

    bus.close();
    assert_eq!(bus.state(), BusState::Idle);
    sim.reconnect();
    bus.open().unwrap();
    assert!(bus.state().is_operational());
}

fn reconnecting_bus(sim: &SimBus, max_attempts: u32) -> Arc<Bus<SimBus>> {
    let bus = BusBuilder::new()
        .adapter("sim0")
        .state_timeout(Duration::from_millis(200))
        .reconnect(ReconnectPolicy {
            loss_threshold: 1,
            max_attempts,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(50),
        })
        .build(sim.clone())
        .unwrap();
    Arc::new(bus)
}

#[test]
fn refused_reconnect_attempt_is_not_an_error() {
    init_log();
    let sim = SimBus::new().with_device(SimDevice::io_module());
    let bus = reconnecting_bus(&sim, 1000);
    bus.open().unwrap();

    sim.disconnect();
    assert!(wait_for(Duration::from_secs(5), || bus.status().reconnecting));
    sim.reject_state(Some((AlState::SafeOp, AlStatusCode::INVALID_OUTPUT_MAPPING)));
    sim.reconnect();

    let watched = bus.clone();
    let watcher = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_millis(1500);
        let mut faults = 0;
        while Instant::now() < deadline {
            if watched.state().fault().is_some() {
                faults += 1;
            }
            thread::yield_now();
        }
        faults
    });
    assert_eq!(watcher.join().unwrap(), 0);
    assert!(bus.status().reconnecting);

    sim.reject_state(None);
    assert!(wait_for(Duration::from_secs(5), || bus.state().is_operational()));
    assert_eq!(bus.status().counters.reconnects, 1);
    bus.close();
    assert_eq!(sim.open_links(), 0);
}

#[test]
fn close_during_reconnect() {
    init_log();
    let sim = SimBus::new().with_device(SimDevice::io_module());
    let bus = reconnecting_bus(&sim, 1000);
    bus.register_slave(Arc::new(GenericSlave::new(0, 1, 1))).unwrap();
    bus.open().unwrap();

    sim.disconnect();
    assert!(wait_for(Duration::from_secs(5), || bus.status().reconnecting));
    let other = bus.clone();
    thread::spawn(move || other.close()).join().unwrap();

    assert_eq!(bus.state(), BusState::Idle);
    assert!(!bus.status().reconnecting);
    assert_eq!(sim.open_links(), 0);
    // nothing reopens the link behind a closed bus
    sim.reconnect();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(bus.state(), BusState::Idle);
    assert_eq!(sim.open_links(), 0);
}

#[test]
fn close_from_reconnect_callback() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, Weak};

    struct Closer {
        bus: Mutex<Option<Weak<Bus<SimBus>>>>,
        calls: AtomicUsize,
    }

    impl SlaveHandle for Closer {
        fn position(&self) -> SlavePos {
            SlavePos::new(0)
        }
        fn input_len(&self) -> usize {
            1
        }
        fn output_len(&self) -> usize {
            1
        }
        fn accept_inputs(&self, _: &[u8]) {}
        fn yield_outputs(&self, _: &mut [u8]) {}
        fn on_reconnect(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let bus = self.bus.lock().unwrap().as_ref().and_then(Weak::upgrade);
            if let Some(bus) = bus {
                bus.close();
            }
        }
    }

    init_log();
    let sim = SimBus::new().with_device(SimDevice::io_module());
    let bus = reconnecting_bus(&sim, 1000);
    let closer = Arc::new(Closer {
        bus: Mutex::new(Some(Arc::downgrade(&bus))),
        calls: AtomicUsize::new(0),
    });
    bus.register_slave(closer.clone()).unwrap();
    bus.open().unwrap();

    sim.disconnect();
    assert!(wait_for(Duration::from_secs(5), || bus.status().reconnecting));
    sim.reconnect();
    assert!(wait_for(Duration::from_secs(5), || {
        closer.calls.load(Ordering::SeqCst) >= 1 && bus.state() == BusState::Idle
    }));
    assert_eq!(closer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(sim.open_links(), 0);
    assert!(!bus.status().reconnecting);
}

#[test]
fn status_snapshot() {
    init_log();
    let sim = SimBus::new().with_device(SimDevice::io_module());
    let bus = bus_on(&sim);
    bus.open().unwrap();
    assert!(wait_for(Duration::from_secs(1), || bus.status().counters.good > 10));
    let status = bus.status();
    assert_eq!(status.adapter.as_deref(), Some("sim0"));
    assert_eq!(status.cycle_time_us, 1000);
    assert_eq!(status.slaves.len(), 1);
    assert_eq!(status.counters.expected_wkc, 3);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["state"]["state"], "Operational");
    assert_eq!(json["slaves"][0]["image"]["inputs"], 1);
}

#[test]
fn latency_probe() {
    init_log();
    let sim = SimBus::new().with_device(SimDevice::io_module());
    let bus = bus_on(&sim);
    let err = bus.probe_latency(pos(0), 10).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Communication);

    bus.open().unwrap();
    let stats = bus.probe_latency(pos(0), 200).unwrap();
    assert_eq!(stats.count, 200);
    assert_eq!(stats.samples_ms.len(), 200);
    assert!(stats.min_ms <= stats.median_ms && stats.median_ms <= stats.max_ms);
    assert!(stats.p95_ms <= stats.p99_ms);
    assert_eq!(stats.errors, 0);

    assert_eq!(bus.probe_latency(pos(5), 10).unwrap_err().kind(), ErrorKind::Configuration);
}

#[test]
fn latency_probe_interrupted() {
    init_log();
    let sim = SimBus::new().with_device(SimDevice::io_module());
    let bus = Arc::new(bus_on(&sim));
    bus.open().unwrap();
    sim.set_sdo_delay(Duration::from_millis(1));

    let runner = bus.clone();
    let run = thread::spawn(move || runner.probe_latency(pos(0), 5000));
    thread::sleep(Duration::from_millis(50));
    sim.disconnect();
    let err = run.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Communication);
    bus.close();
}

#[test]
fn safe_stop_runs_once_per_session() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Watch {
        stops: AtomicUsize,
    }

    impl SlaveHandle for Watch {
        fn position(&self) -> SlavePos {
            SlavePos::new(0)
        }
        fn input_len(&self) -> usize {
            1
        }
        fn output_len(&self) -> usize {
            1
        }
        fn accept_inputs(&self, _: &[u8]) {}
        fn yield_outputs(&self, data: &mut [u8]) {
            data[0] = 0x11;
        }
        fn safe_stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    init_log();
    let sim = SimBus::new().with_device(SimDevice::io_module());
    let bus = bus_on(&sim);
    let watch = Arc::new(Watch { stops: AtomicUsize::new(0) });
    bus.register_slave(watch.clone()).unwrap();
    bus.open().unwrap();
    assert!(wait_for(Duration::from_secs(1), || sim.transmitted(pos(0)) == vec![0x11]));
    bus.close();
    bus.close();
    assert_eq!(watch.stops.load(Ordering::SeqCst), 1);
}
