// Part of ethercat-bus. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! The cyclic exchange: frame pump, PDO update and health monitor.
//!
//! All three run on their own thread and share one stop channel.  Nothing
//! is ever sent on it; dropping the sender wakes every activity, which then
//! leaves at the top of its tick.

use crate::bus::{BusState, Inner};
use crate::link::{Link, LinkProvider};
use crate::slave::{lock, SlaveHandle};
use crate::types::AlState;
use crossbeam_channel::{self as channel, select, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::*;
use serde::Serialize;
use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// Period of the frame pump, independent of the configured cycle time.
pub const FRAME_PERIOD: Duration = Duration::from_millis(1);
/// Period of the health monitor.
pub const HEALTH_PERIOD: Duration = Duration::from_millis(300);

/// Counters of the frame pump, readable while the bus runs.
#[derive(Debug, Default)]
pub(crate) struct CycleCounters {
    good: AtomicU64,
    missed: AtomicU64,
    wkc: AtomicU16,
    expected: AtomicU16,
    check_state: AtomicBool,
    reconnects: AtomicU64,
}

/// Snapshot of [`CycleCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleCounts {
    pub good: u64,
    pub missed: u64,
    pub working_counter: u16,
    pub expected_wkc: u16,
    pub reconnects: u64,
}

impl CycleCounters {
    fn record(&self, wkc: u16, expected: u16) {
        self.wkc.store(wkc, Ordering::Relaxed);
        self.expected.store(expected, Ordering::Relaxed);
        if wkc >= expected {
            self.good.fetch_add(1, Ordering::Release);
        } else {
            self.missed.fetch_add(1, Ordering::Relaxed);
            self.check_state.store(true, Ordering::Relaxed);
        }
    }

    /// Clears the cycle counts of the previous session.
    pub fn reset(&self) {
        self.good.store(0, Ordering::Release);
        self.missed.store(0, Ordering::Relaxed);
        self.wkc.store(0, Ordering::Relaxed);
        self.expected.store(0, Ordering::Relaxed);
        self.check_state.store(false, Ordering::Relaxed);
    }

    pub fn good(&self) -> u64 {
        self.good.load(Ordering::Acquire)
    }

    fn take_check_state(&self) -> bool {
        self.check_state.swap(false, Ordering::Relaxed)
    }

    pub fn count_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CycleCounts {
        CycleCounts {
            good: self.good.load(Ordering::Acquire),
            missed: self.missed.load(Ordering::Relaxed),
            working_counter: self.wkc.load(Ordering::Relaxed),
            expected_wkc: self.expected.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Running periodic activities of one open/close session.
pub(crate) struct Scheduler {
    stop: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start<P: LinkProvider>(inner: &Arc<Inner<P>>) -> io::Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let mut sched = Scheduler {
            stop: Some(stop_tx),
            threads: Vec::with_capacity(3),
        };

        let (bus, stop) = (inner.clone(), stop_rx.clone());
        sched.spawn("ethercat-frames", move || {
            if bus.config().realtime {
                set_realtime_priority();
            }
            every(FRAME_PERIOD, &stop, || pump_frame(&bus));
        })?;

        let (bus, stop) = (inner.clone(), stop_rx.clone());
        sched.spawn("ethercat-pdo", move || {
            let mut images = Images::new(bus.handles());
            every(bus.config().cycle_time, &stop, || update_pdos(&bus, &mut images));
        })?;

        let (bus, stop) = (inner.clone(), stop_rx);
        sched.spawn("ethercat-health", move || {
            let mut lost = 0;
            every(HEALTH_PERIOD, &stop, || check_health(&bus, &mut lost, &stop));
        })?;

        debug!(
            "BUS: cyclic exchange started (frames {:?}, PDO {:?}, health {:?})",
            FRAME_PERIOD,
            inner.config().cycle_time,
            HEALTH_PERIOD
        );
        Ok(sched)
    }

    fn spawn(&mut self, name: &str, f: impl FnOnce() + Send + 'static) -> io::Result<()> {
        let handle = thread::Builder::new().name(name.into()).spawn(f)?;
        self.threads.push(handle);
        Ok(())
    }

    /// Signals all activities and waits for them to finish.  A thread that
    /// shuts down its own scheduler is not waited for.
    pub fn shutdown(&mut self) {
        drop(self.stop.take());
        let me = thread::current().id();
        for handle in self.threads.drain(..) {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                warn!("BUS: a cyclic task panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub(crate) fn stopped(stop: &Receiver<()>) -> bool {
    matches!(stop.try_recv(), Err(TryRecvError::Disconnected))
}

/// Waits for `timeout` unless the stop signal arrives first.  Returns
/// whether the wait ran out normally.
pub(crate) fn pause(stop: &Receiver<()>, timeout: Duration) -> bool {
    matches!(stop.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
}

fn every(period: Duration, stop: &Receiver<()>, mut tick: impl FnMut()) {
    let ticker = channel::tick(period);
    loop {
        select! {
            recv(stop) -> _ => return,
            recv(ticker) -> _ => {}
        }
        if stopped(stop) {
            return;
        }
        tick();
    }
}

#[cfg(target_os = "linux")]
fn set_realtime_priority() {
    let param = libc::sched_param { sched_priority: 80 };
    let res = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if res != 0 {
        warn!(
            "BUS: could not switch frame pump to SCHED_FIFO: {}",
            io::Error::from_raw_os_error(res)
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn set_realtime_priority() {
    warn!("BUS: realtime scheduling is only supported on Linux");
}

fn pump_frame<P: LinkProvider>(bus: &Inner<P>) {
    let mut guard = lock(bus.link());
    let link = match guard.as_mut() {
        Some(link) => link,
        None => return,
    };
    let expected = link.expected_wkc();
    match link.exchange() {
        Ok(wkc) => bus.counters().record(wkc, expected),
        Err(e) => {
            trace!("BUS: frame exchange failed: {}", e);
            bus.counters().record(0, expected);
        }
    }
}

/// Per-slave scratch images of the PDO thread.
struct Images {
    handles: Vec<Arc<dyn SlaveHandle>>,
    inputs: Vec<Vec<u8>>,
    outputs: Vec<Vec<u8>>,
}

impl Images {
    fn new(handles: Vec<Arc<dyn SlaveHandle>>) -> Self {
        Images {
            inputs: handles.iter().map(|h| vec![0; h.input_len()]).collect(),
            outputs: handles.iter().map(|h| vec![0; h.output_len()]).collect(),
            handles,
        }
    }
}

fn update_pdos<P: LinkProvider>(bus: &Inner<P>, images: &mut Images) {
    if bus.is_reconnecting() {
        return;
    }
    if !matches!(bus.state(), BusState::SafeOperational | BusState::Operational) {
        return;
    }

    for (handle, out) in images.handles.iter().zip(images.outputs.iter_mut()) {
        handle.yield_outputs(out);
    }
    {
        let mut guard = lock(bus.link());
        let link = match guard.as_mut() {
            Some(link) => link,
            None => return,
        };
        let slots = images.handles.iter().zip(&images.outputs).zip(images.inputs.iter_mut());
        for ((handle, out), inp) in slots {
            let pos = handle.position();
            let image = link.outputs_mut(pos);
            if image.len() == out.len() {
                image.copy_from_slice(out);
            }
            let image = link.inputs(pos);
            if image.len() == inp.len() {
                inp.copy_from_slice(image);
            }
        }
    }
    for (handle, inp) in images.handles.iter().zip(&images.inputs) {
        handle.accept_inputs(inp);
    }
}

/// Inspects all slaves and nudges the ones that left OP back.  Returns
/// whether every slave was operational.
fn recover_slaves<L: Link + ?Sized>(link: &mut L) -> bool {
    let states = match link.read_states() {
        Ok(states) => states,
        Err(e) => {
            debug!("HEALTH: cannot read slave states: {}", e);
            return false;
        }
    };
    let mut healthy = true;
    for st in states.iter().filter(|st| !st.is(AlState::Op)) {
        healthy = false;
        let pos = st.position;
        let result = match st.state {
            Some(state @ AlState::SafeOp) | Some(state @ AlState::Op) if st.error => {
                warn!("HEALTH: slave {} in {}+ERROR, AL {}; acknowledging", pos, state, st.al_status);
                link.request_slave_state(pos, state, true).map(|_| true)
            }
            Some(AlState::SafeOp) => {
                warn!("HEALTH: slave {} in SAFE-OP, requesting OP", pos);
                link.request_slave_state(pos, AlState::Op, false).map(|_| true)
            }
            Some(state) => {
                warn!("HEALTH: slave {} fell back to {}, reconfiguring", pos, state);
                link.reconfigure_slave(pos)
            }
            None => {
                warn!("HEALTH: slave {} lost", pos);
                link.recover_slave(pos)
            }
        };
        match result {
            Ok(true) => {}
            Ok(false) => debug!("HEALTH: slave {} did not recover yet", pos),
            Err(e) => debug!("HEALTH: recovery of slave {} failed: {}", pos, e),
        }
    }
    healthy
}

fn check_health<P: LinkProvider>(bus: &Inner<P>, lost: &mut u32, stop: &Receiver<()>) {
    if bus.is_reconnecting() || !bus.state().is_operational() {
        return;
    }
    let short_wkc = bus.counters().take_check_state();
    let healthy = match lock(bus.link()).as_mut() {
        Some(link) => recover_slaves(link),
        None => false,
    };
    if healthy {
        if *lost > 0 {
            info!("HEALTH: all slaves back in OP");
        } else if short_wkc {
            trace!("HEALTH: working counter was short, slaves are fine");
        }
        *lost = 0;
        return;
    }

    *lost += 1;
    let threshold = bus.config().reconnect.loss_threshold;
    warn!("HEALTH: bus degraded ({}/{})", lost, threshold);
    if *lost >= threshold {
        *lost = 0;
        reconnect(bus, stop);
    }
}

fn reconnect<P: LinkProvider>(bus: &Inner<P>, stop: &Receiver<()>) {
    let policy = bus.config().reconnect;
    warn!("HEALTH: connection lost, reconnecting");
    bus.set_reconnecting(true);
    bus.shutdown_link();

    let mut last_error = None;
    for attempt in 1..=policy.max_attempts {
        if stopped(stop) {
            return;
        }
        info!("HEALTH: reconnect attempt {}/{}", attempt, policy.max_attempts);
        match bus.restore() {
            Ok(()) => {
                bus.counters().count_reconnect();
                for handle in bus.handles() {
                    handle.on_reconnect();
                }
                info!("HEALTH: reconnected after {} attempt(s)", attempt);
                return;
            }
            Err(e) => {
                warn!("HEALTH: reconnect attempt {} failed: {}", attempt, e);
                bus.shutdown_link();
                last_error = Some(e);
            }
        }
        if attempt < policy.max_attempts && !pause(stop, policy.backoff(attempt)) {
            return;
        }
    }

    error!("HEALTH: giving up after {} reconnect attempt(s)", policy.max_attempts);
    let diagnostics = last_error
        .as_ref()
        .and_then(|e| e.diagnostics().cloned())
        .unwrap_or_default();
    let reason = match last_error {
        Some(e) => format!(
            "connection lost, {} reconnect attempt(s) failed; last error: {}",
            policy.max_attempts, e
        ),
        None => "connection lost, reconnecting is disabled".to_owned(),
    };
    bus.set_reconnecting(false);
    bus.fail(reason, diagnostics);
}
