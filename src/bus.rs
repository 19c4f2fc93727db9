// Part of ethercat-bus. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! The bus state machine.
//!
//! A [`Bus`] walks its segment from idle over PRE-OP and SAFE-OP to OP,
//! applying the PDO mapping on the way, and runs the cyclic exchange while
//! operational.  Every operation takes `&self`; a bus can be shared between
//! threads and closed from any of them.

use crate::adapter::{self, Adapter};
use crate::link::{Link, LinkError, LinkProvider, SlaveInfo};
use crate::mapping::PdoMapping;
use crate::probe::{CycleStats, LatencyProbe};
use crate::scheduler::{CycleCounters, CycleCounts, Scheduler};
use crate::slave::{lock, SlaveHandle};
use crate::types::{
    AlState, Diagnostics, Error, ImageSize, Result, SlaveDescriptor, SlavePos, SlaveStatus,
};
use crate::util;
use log::*;
use serde::Serialize;
use std::{
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    thread,
    time::{Duration, Instant},
};

pub const DEFAULT_CYCLE_TIME: Duration = Duration::from_micros(1000);
pub const DEFAULT_STATE_TIMEOUT: Duration = Duration::from_secs(5);

const STATE_POLL: Duration = Duration::from_millis(1);

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

/// Why the bus stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusFault {
    pub reason: String,
    pub diagnostics: Diagnostics,
}

/// Lifecycle state of a [`Bus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "fault")]
pub enum BusState {
    Idle,
    PreOperational,
    SafeOperational,
    Operational,
    Error(BusFault),
}

impl BusState {
    pub fn is_operational(&self) -> bool {
        *self == BusState::Operational
    }

    pub fn fault(&self) -> Option<&BusFault> {
        match self {
            BusState::Error(fault) => Some(fault),
            _ => None,
        }
    }

    fn rank(&self) -> Option<u8> {
        match self {
            BusState::Idle => Some(0),
            BusState::PreOperational => Some(1),
            BusState::SafeOperational => Some(2),
            BusState::Operational => Some(3),
            BusState::Error(_) => None,
        }
    }

    /// Transitions go one step at a time in either direction.  Error can
    /// be entered from anywhere and only be left towards Idle.
    pub fn permits(&self, next: &BusState) -> bool {
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (None, Some(to)) => to == 0,
            (Some(from), Some(to)) => from == to || from + 1 == to || to + 1 == from,
        }
    }
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            BusState::Idle => "IDLE",
            BusState::PreOperational => "PRE-OPERATIONAL",
            BusState::SafeOperational => "SAFE-OPERATIONAL",
            BusState::Operational => "OPERATIONAL",
            BusState::Error(_) => "ERROR",
        })
    }
}

/// Limits of the automatic reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive unhealthy health-monitor ticks before reconnecting.
    pub loss_threshold: u32,
    /// Reconnect attempts before the bus gives up; 0 disables reconnecting.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            loss_threshold: 7,
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay after the given failed attempt (counted from 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Adapter to open; the first usable one if unset.
    pub adapter: Option<String>,
    /// Period of the PDO update.
    pub cycle_time: Duration,
    pub mapping: Option<PdoMapping>,
    pub reconnect: ReconnectPolicy,
    /// Upper bound for every wait on a state transition.
    pub state_timeout: Duration,
    /// Run the frame pump with realtime priority.
    pub realtime: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            adapter: None,
            cycle_time: DEFAULT_CYCLE_TIME,
            mapping: None,
            reconnect: ReconnectPolicy::default(),
            state_timeout: DEFAULT_STATE_TIMEOUT,
            realtime: false,
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cycle_time == Duration::from_secs(0) {
            return Err(Error::Configuration("cycle time must be positive".into()));
        }
        if self.state_timeout == Duration::from_secs(0) {
            return Err(Error::Configuration("state timeout must be positive".into()));
        }
        if self.reconnect.loss_threshold == 0 {
            return Err(Error::Configuration("reconnect loss threshold must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct BusBuilder {
    adapter: Option<String>,
    cycle_time: Option<Duration>,
    mapping: Option<PdoMapping>,
    reconnect: Option<ReconnectPolicy>,
    state_timeout: Option<Duration>,
    realtime: bool,
}

impl BusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adapter(mut self, name: impl Into<String>) -> Self {
        self.adapter = Some(name.into());
        self
    }

    pub fn cycle_time(mut self, cycle_time: Duration) -> Self {
        self.cycle_time = Some(cycle_time);
        self
    }

    pub fn cycle_time_us(self, us: u32) -> Self {
        self.cycle_time(Duration::from_micros(us.into()))
    }

    /// The mapping's network section fills in adapter and cycle time
    /// unless they are set explicitly.
    pub fn mapping(mut self, mapping: PdoMapping) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub fn mapping_file(self, path: impl AsRef<Path>) -> Result<Self> {
        Ok(self.mapping(PdoMapping::load(path)?))
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    pub fn state_timeout(mut self, timeout: Duration) -> Self {
        self.state_timeout = Some(timeout);
        self
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn build<P: LinkProvider>(self, provider: P) -> Result<Bus<P>> {
        let network = self
            .mapping
            .as_ref()
            .map(|m| m.network().clone())
            .unwrap_or_default();
        let cycle_time = self
            .cycle_time
            .or_else(|| network.cycle_time())
            .unwrap_or(DEFAULT_CYCLE_TIME);
        let config = BusConfig {
            adapter: self.adapter.or(network.adapter),
            cycle_time,
            mapping: self.mapping,
            reconnect: self.reconnect.unwrap_or_default(),
            state_timeout: self.state_timeout.unwrap_or(DEFAULT_STATE_TIMEOUT),
            realtime: self.realtime,
        };
        Bus::with_config(provider, config)
    }
}

/// Point-in-time view of a bus, meant for polling by a user interface.
#[derive(Debug, Clone, Serialize)]
pub struct BusStatus {
    pub state: BusState,
    pub adapter: Option<String>,
    pub cycle_time_us: u64,
    pub reconnecting: bool,
    pub slaves: Vec<SlaveDescriptor>,
    pub counters: CycleCounts,
}

#[derive(Debug, Default)]
struct Layout {
    infos: Vec<SlaveInfo>,
    sizes: Vec<ImageSize>,
}

fn collect_diagnostics<L: Link + ?Sized>(
    link: &mut L,
    infos: &[SlaveInfo],
    sizes: &[ImageSize],
) -> Diagnostics {
    let states = link.read_states().unwrap_or_default();
    Diagnostics(
        infos
            .iter()
            .enumerate()
            .map(|(i, info)| {
                let st = states.iter().find(|s| s.position == info.position);
                let size = sizes.get(i).copied().unwrap_or_default();
                SlaveStatus {
                    position: info.position,
                    name: info.name.clone(),
                    state: st.and_then(|s| s.state),
                    error: st.map_or(false, |s| s.error),
                    al_status: st.map(|s| s.al_status).unwrap_or_default(),
                    input_bytes: size.inputs,
                    output_bytes: size.outputs,
                }
            })
            .collect(),
    )
}

fn check_handles(handles: &[Arc<dyn SlaveHandle>], sizes: &[ImageSize]) -> Result<()> {
    for handle in handles {
        let pos = handle.position();
        let size = sizes.get(pos.index()).copied().unwrap_or_default();
        if handle.input_len() != size.inputs || handle.output_len() != size.outputs {
            return Err(Error::Configuration(format!(
                "slave {}: handle has {}B inputs / {}B outputs, PDO mapping yields {}B / {}B",
                pos,
                handle.input_len(),
                handle.output_len(),
                size.inputs,
                size.outputs
            )));
        }
    }
    Ok(())
}

/// State shared between the bus and its cyclic tasks.
pub(crate) struct Inner<P: LinkProvider> {
    provider: P,
    config: BusConfig,
    adapter: Mutex<Option<String>>,
    link: Mutex<Option<P::Link>>,
    state: RwLock<BusState>,
    layout: RwLock<Layout>,
    slaves: RwLock<Vec<SlaveDescriptor>>,
    handles: RwLock<Vec<Arc<dyn SlaveHandle>>>,
    counters: CycleCounters,
    reconnecting: AtomicBool,
    restoring: AtomicBool,
}

impl<P: LinkProvider> Inner<P> {
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn link(&self) -> &Mutex<Option<P::Link>> {
        &self.link
    }

    pub fn counters(&self) -> &CycleCounters {
        &self.counters
    }

    pub fn handles(&self) -> Vec<Arc<dyn SlaveHandle>> {
        read(&self.handles).clone()
    }

    pub fn state(&self) -> BusState {
        read(&self.state).clone()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    pub fn set_reconnecting(&self, on: bool) {
        self.reconnecting.store(on, Ordering::Release);
    }

    pub fn has_slave(&self, slave: SlavePos) -> bool {
        read(&self.layout).infos.iter().any(|info| info.position == slave)
    }

    fn set_state(&self, next: BusState) {
        let mut state = write(&self.state);
        if !state.permits(&next) {
            error!("BUS: illegal transition {} -> {}", *state, next);
        }
        if *state != next {
            info!("BUS: {} -> {}", *state, next);
        }
        *state = next;
    }

    /// Walks the state back to Idle one step at a time, asking the link to
    /// follow if there is one.
    fn step_down(&self, mut link: Option<&mut P::Link>) {
        loop {
            let (next, al) = match self.state() {
                BusState::Idle => return,
                BusState::Operational => (BusState::SafeOperational, AlState::SafeOp),
                BusState::SafeOperational => (BusState::PreOperational, AlState::PreOp),
                BusState::PreOperational | BusState::Error(_) => (BusState::Idle, AlState::Init),
            };
            if let Some(link) = link.as_deref_mut() {
                if let Err(e) = link.request_state(al) {
                    debug!("BUS: could not request {}: {}", al, e);
                }
            }
            self.set_state(next);
        }
    }

    /// Takes the link out of the shared slot, steps down and releases it.
    pub fn shutdown_link(&self) {
        let link = lock(&self.link).take();
        match link {
            Some(mut link) => {
                self.step_down(Some(&mut link));
                link.close();
            }
            None => self.step_down(None),
        }
    }

    /// Releases the link and enters the Error state.
    pub fn fail(&self, reason: String, diagnostics: Diagnostics) {
        if let Some(mut link) = lock(&self.link).take() {
            link.close();
        }
        error!("BUS: {}", reason);
        self.set_state(BusState::Error(BusFault { reason, diagnostics }));
    }

    fn resolve_adapter(&self, explicit: Option<&str>) -> Result<String> {
        let adapters = self
            .provider
            .adapters()
            .map_err(|e| Error::connection(format!("Cannot enumerate adapters: {}", e)))?;
        let name = explicit.or_else(|| self.config.adapter.as_deref());
        Ok(adapter::resolve(&adapters, name)?.name)
    }

    fn await_state(&self, link: &mut P::Link, target: AlState) -> bool {
        let deadline = Instant::now() + self.config.state_timeout;
        loop {
            match link.read_states() {
                Ok(states) => {
                    if states.iter().all(|s| s.is(target)) {
                        return true;
                    }
                    if states.iter().any(|s| s.error) {
                        return false;
                    }
                }
                Err(e) => debug!("BUS: reading slave states failed: {}", e),
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(STATE_POLL);
        }
    }

    /// A transition was refused: report, release the link, enter Error.
    /// During a reconnect attempt it steps down to Idle instead; only an
    /// exhausted reconnect budget enters Error.
    fn refuse(&self, mut link: P::Link, target: AlState, cause: Option<LinkError>) -> Error {
        let diagnostics = {
            let layout = read(&self.layout);
            collect_diagnostics(&mut link, &layout.infos, &layout.sizes)
        };
        let mut message = format!("Slaves did not reach {}", target);
        if let Some(e) = cause {
            message = format!("{}: {}", message, e);
        }
        if self.restoring.load(Ordering::Acquire) {
            warn!("BUS: {}\n{}", message, diagnostics);
            self.step_down(Some(&mut link));
            link.close();
        } else {
            if let Err(e) = link.request_state(AlState::Init) {
                debug!("BUS: could not request INIT: {}", e);
            }
            link.close();
            error!("BUS: {}\n{}", message, diagnostics);
            self.set_state(BusState::Error(BusFault {
                reason: message.clone(),
                diagnostics: diagnostics.clone(),
            }));
        }
        Error::Connection {
            message,
            diagnostics: Some(diagnostics),
        }
    }

    /// Configuration failed: release the link and go back to Idle.
    fn abandon(&self, mut link: P::Link, err: Error) -> Error {
        warn!("BUS: {}", err);
        self.step_down(Some(&mut link));
        link.close();
        err
    }

    fn apply_mapping(
        &self,
        link: &mut P::Link,
        infos: &[SlaveInfo],
        handles: &[Arc<dyn SlaveHandle>],
    ) -> Result<()> {
        for handle in handles {
            let pos = handle.position();
            if !infos.iter().any(|info| info.position == pos) {
                return Err(Error::Configuration(format!(
                    "a handle is registered for slave {}, but only {} slave(s) responded",
                    pos,
                    infos.len()
                )));
            }
            let assignment = match self.config.mapping.as_ref().and_then(|m| m.assignment(pos)) {
                Some(a) => a,
                None => continue,
            };
            link.apply_pdo_assignment(pos, &assignment.rx_pdo, &assignment.tx_pdo)
                .map_err(|e| {
                    Error::Configuration(format!("PDO mapping of slave {} rejected: {}", pos, e))
                })?;
            debug!(
                "BUS: slave {}: rx {:?}, tx {:?}",
                pos, assignment.rx_pdo, assignment.tx_pdo
            );
        }
        Ok(())
    }

    /// The inner phase of `open()`: link, PRE-OP, mapping, SAFE-OP.  On
    /// success the link is stored for the cyclic tasks.
    fn configure(&self, adapter: &str) -> Result<()> {
        let mut link = self
            .provider
            .open(adapter)
            .map_err(|e| Error::connection(format!("Cannot open adapter '{}': {}", adapter, e)))?;
        let infos = match link.scan() {
            Ok(infos) => infos,
            Err(e) => {
                link.close();
                return Err(Error::connection(format!(
                    "No slaves responding on '{}': {}",
                    adapter, e
                )));
            }
        };
        if infos.is_empty() {
            link.close();
            return Err(Error::connection(format!("No slaves responding on '{}'", adapter)));
        }
        info!("BUS: {} slave(s) found on {}", infos.len(), adapter);
        *write(&self.layout) = Layout {
            infos: infos.clone(),
            sizes: Vec::new(),
        };

        if !self.await_state(&mut link, AlState::PreOp) {
            return Err(self.refuse(link, AlState::PreOp, None));
        }
        self.set_state(BusState::PreOperational);

        let handles = self.handles();
        if let Err(e) = self.apply_mapping(&mut link, &infos, &handles) {
            return Err(self.abandon(link, e));
        }
        let sizes = match link.map_process_data() {
            Ok(sizes) => sizes,
            Err(e) => {
                let e = Error::Configuration(format!("Cannot map process data: {}", e));
                return Err(self.abandon(link, e));
            }
        };
        write(&self.layout).sizes = sizes.clone();
        if let Err(e) = check_handles(&handles, &sizes) {
            return Err(self.abandon(link, e));
        }

        if let Err(e) = link.request_state(AlState::SafeOp) {
            return Err(self.refuse(link, AlState::SafeOp, Some(e)));
        }
        if !self.await_state(&mut link, AlState::SafeOp) {
            return Err(self.refuse(link, AlState::SafeOp, None));
        }
        self.set_state(BusState::SafeOperational);

        for handle in &handles {
            handle.yield_outputs(link.outputs_mut(handle.position()));
        }
        self.update_descriptors(&infos, &sizes);
        *lock(&self.link) = Some(link);
        Ok(())
    }

    /// Requests OP and waits until the frame pump has completed a cycle
    /// with every slave operational.
    fn go_operational(&self) -> Result<()> {
        let requested = match lock(&self.link).as_mut() {
            Some(link) => link.request_state(AlState::Op),
            None => return Err(Error::connection("Link lost before reaching OP")),
        };
        if let Err(e) = requested {
            return Err(self.refuse_shared(Some(e)));
        }

        // good cycle count when all slaves were first seen in OP
        let mut since_op = None;
        let deadline = Instant::now() + self.config.state_timeout;
        loop {
            // the frame pump records under the link lock, so `good` is
            // consistent with the states read here
            let (reached, refused, good) = match lock(&self.link).as_mut() {
                Some(link) => match link.read_states() {
                    Ok(states) => (
                        states.iter().all(|s| s.is(AlState::Op)),
                        states.iter().any(|s| s.error),
                        self.counters.good(),
                    ),
                    Err(_) => (false, false, 0),
                },
                None => return Err(Error::connection("Link lost before reaching OP")),
            };
            if !reached {
                since_op = None;
            } else {
                match since_op {
                    Some(baseline) if good > baseline => {
                        self.set_state(BusState::Operational);
                        return Ok(());
                    }
                    Some(_) => {}
                    None => since_op = Some(good),
                }
            }
            if refused || Instant::now() >= deadline {
                return Err(self.refuse_shared(None));
            }
            thread::sleep(STATE_POLL);
        }
    }

    fn refuse_shared(&self, cause: Option<LinkError>) -> Error {
        let link = lock(&self.link).take();
        match link {
            Some(link) => self.refuse(link, AlState::Op, cause),
            None => Error::connection("Link lost before reaching OP"),
        }
    }

    /// Re-runs the inner phase of `open()` on the adapter of the session.
    /// A failed attempt leaves the bus Idle and still reconnecting.
    pub fn restore(&self) -> Result<()> {
        let adapter = lock(&self.adapter)
            .clone()
            .ok_or_else(|| Error::connection("No adapter to reconnect to"))?;
        self.restoring.store(true, Ordering::Release);
        let result = self.configure(&adapter).and_then(|()| {
            self.set_reconnecting(false);
            self.go_operational()
        });
        if result.is_err() {
            self.set_reconnecting(true);
        }
        self.restoring.store(false, Ordering::Release);
        result
    }

    fn update_descriptors(&self, infos: &[SlaveInfo], sizes: &[ImageSize]) {
        let mut slaves = write(&self.slaves);
        let known = std::mem::take(&mut *slaves);
        *slaves = infos
            .iter()
            .enumerate()
            .map(|(i, info)| {
                let image = sizes.get(i).copied().unwrap_or_default();
                match known
                    .iter()
                    .find(|d| d.position == info.position && d.id == info.id)
                {
                    Some(d) => SlaveDescriptor {
                        image,
                        al_state: Some(AlState::SafeOp),
                        ..d.clone()
                    },
                    None => SlaveDescriptor {
                        position: info.position,
                        name: info.name.clone(),
                        id: info.id,
                        rev: info.rev,
                        al_state: Some(AlState::SafeOp),
                        device_name: None,
                        hw_version: None,
                        sw_version: None,
                        image,
                        rx_assignment: Vec::new(),
                        tx_assignment: Vec::new(),
                        available_rx: Vec::new(),
                        available_tx: Vec::new(),
                    },
                }
            })
            .collect();
    }

    fn scan_descriptors(
        &self,
        link: &mut P::Link,
        adapter: &str,
        mapping: Option<&PdoMapping>,
    ) -> Result<Vec<SlaveDescriptor>> {
        let infos = link.scan().map_err(|e| {
            Error::connection(format!("No slaves responding on '{}': {}", adapter, e))
        })?;
        if infos.is_empty() {
            return Err(Error::connection(format!("No slaves responding on '{}'", adapter)));
        }
        if !self.await_state(link, AlState::PreOp) {
            return Err(Error::Connection {
                message: format!("Slaves on '{}' did not reach {}", adapter, AlState::PreOp),
                diagnostics: Some(collect_diagnostics(link, &infos, &[])),
            });
        }
        if let Some(mapping) = mapping {
            for info in &infos {
                if let Some(a) = mapping.assignment(info.position) {
                    if let Err(e) = link.apply_pdo_assignment(info.position, &a.rx_pdo, &a.tx_pdo) {
                        warn!("BUS: slave {}: PDO mapping not applied: {}", info.position, e);
                    }
                }
            }
        }
        let sizes = link
            .map_process_data()
            .map_err(|e| Error::Configuration(format!("Cannot map process data: {}", e)))?;
        Ok(infos
            .iter()
            .enumerate()
            .map(|(i, info)| util::describe_slave(&mut *link, info, sizes.get(i).copied().unwrap_or_default()))
            .collect())
    }
}

/// An EtherCAT segment driven through its lifecycle.
pub struct Bus<P: LinkProvider> {
    inner: Arc<Inner<P>>,
    session: Mutex<Option<Scheduler>>,
}

impl<P: LinkProvider> Bus<P> {
    pub fn with_config(provider: P, config: BusConfig) -> Result<Self> {
        config.validate()?;
        debug!("BUS: created with {:?}", config);
        Ok(Bus {
            inner: Arc::new(Inner {
                provider,
                config,
                adapter: Mutex::new(None),
                link: Mutex::new(None),
                state: RwLock::new(BusState::Idle),
                layout: RwLock::new(Layout::default()),
                slaves: RwLock::new(Vec::new()),
                handles: RwLock::new(Vec::new()),
                counters: CycleCounters::default(),
                reconnecting: AtomicBool::new(false),
                restoring: AtomicBool::new(false),
            }),
            session: Mutex::new(None),
        })
    }

    pub(crate) fn inner(&self) -> &Inner<P> {
        &self.inner
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Adapters able to carry the segment.
    pub fn list_adapters(&self) -> Result<Vec<Adapter>> {
        let adapters = self
            .inner
            .provider
            .adapters()
            .map_err(|e| Error::connection(format!("Cannot enumerate adapters: {}", e)))?;
        Ok(adapters.into_iter().filter(|a| a.is_usable).collect())
    }

    fn ensure_idle(&self, session: &Option<Scheduler>, what: &str) -> Result<()> {
        match self.inner.state() {
            BusState::Idle if session.is_none() => Ok(()),
            BusState::Error(fault) => Err(Error::Configuration(format!(
                "cannot {} while the bus is in error state ({}); close it first",
                what, fault.reason
            ))),
            state => Err(Error::Configuration(format!(
                "cannot {} while the bus is {}",
                what, state
            ))),
        }
    }

    /// Scans the segment on a temporary link.  `adapter` and `mapping`
    /// default to the configured ones; the mapping is applied before the
    /// image sizes are read.
    pub fn discover(
        &self,
        adapter: Option<&str>,
        mapping: Option<&PdoMapping>,
    ) -> Result<Vec<SlaveDescriptor>> {
        let session = lock(&self.session);
        self.ensure_idle(&session, "discover slaves")?;
        let adapter = self.inner.resolve_adapter(adapter)?;
        let mapping = mapping.or(self.inner.config.mapping.as_ref());

        let mut link = self
            .inner
            .provider
            .open(&adapter)
            .map_err(|e| Error::connection(format!("Cannot open adapter '{}': {}", adapter, e)))?;
        let result = self.inner.scan_descriptors(&mut link, &adapter, mapping);
        if let Err(e) = link.request_state(AlState::Init) {
            debug!("BUS: could not request INIT: {}", e);
        }
        link.close();

        let slaves = result?;
        info!("BUS: discovered {} slave(s) on {}", slaves.len(), adapter);
        *write(&self.inner.slaves) = slaves.clone();
        Ok(slaves)
    }

    /// Adds a handle for the slave at its position.  Only allowed while
    /// the bus is idle.
    pub fn register_slave(&self, handle: Arc<dyn SlaveHandle>) -> Result<()> {
        let session = lock(&self.session);
        self.ensure_idle(&session, "register slaves")?;
        let pos = handle.position();
        if let Some(mapping) = &self.inner.config.mapping {
            if !mapping.covers(pos) {
                return Err(Error::Configuration(format!(
                    "the PDO mapping has no entry for slave {} and no default",
                    pos
                )));
            }
        }
        let mut handles = write(&self.inner.handles);
        if handles.iter().any(|h| h.position() == pos) {
            return Err(Error::Configuration(format!(
                "a handle for slave {} is already registered",
                pos
            )));
        }
        handles.push(handle);
        handles.sort_by_key(|h| h.position());
        debug!("BUS: handle registered for slave {}", pos);
        Ok(())
    }

    pub fn unregister_slave(&self, slave: SlavePos) -> Result<Option<Arc<dyn SlaveHandle>>> {
        let session = lock(&self.session);
        self.ensure_idle(&session, "unregister slaves")?;
        let mut handles = write(&self.inner.handles);
        Ok(handles
            .iter()
            .position(|h| h.position() == slave)
            .map(|i| handles.remove(i)))
    }

    /// Brings the bus to OP and starts the cyclic exchange.  Blocks until
    /// the bus is operational or the attempt failed.
    pub fn open(&self) -> Result<()> {
        let mut session = lock(&self.session);
        self.ensure_idle(&session, "open")?;
        let adapter = self.inner.resolve_adapter(None)?;
        info!(
            "BUS: opening on {} with {} us cycle time",
            adapter,
            self.inner.config.cycle_time.as_micros()
        );
        *lock(&self.inner.adapter) = Some(adapter.clone());
        self.inner.counters.reset();

        self.inner.configure(&adapter)?;
        let mut scheduler = match Scheduler::start(&self.inner) {
            Ok(scheduler) => scheduler,
            Err(e) => {
                self.inner.shutdown_link();
                return Err(e.into());
            }
        };
        if let Err(e) = self.inner.go_operational() {
            scheduler.shutdown();
            return Err(e);
        }
        *session = Some(scheduler);
        Ok(())
    }

    /// Stops the cyclic exchange, zeroes outputs, brings the slaves back
    /// to INIT and releases the adapter.  Closing a closed bus does nothing.
    pub fn close(&self) {
        let mut session = lock(&self.session);
        let scheduler = session.take();
        if scheduler.is_none()
            && lock(&self.inner.link).is_none()
            && self.inner.state() == BusState::Idle
        {
            return;
        }
        info!("BUS: closing");

        let handles = self.inner.handles();
        for handle in &handles {
            handle.safe_stop();
        }
        if let Some(link) = lock(&self.inner.link).as_mut() {
            for handle in &handles {
                let image = link.outputs_mut(handle.position());
                if image.len() == handle.output_len() {
                    handle.yield_outputs(image);
                }
            }
            if let Err(e) = link.exchange() {
                debug!("BUS: final exchange failed: {}", e);
            }
        }

        if let Some(mut scheduler) = scheduler {
            scheduler.shutdown();
        }
        self.inner.set_reconnecting(false);
        self.inner.shutdown_link();
        info!("BUS: closed");
    }

    pub fn state(&self) -> BusState {
        self.inner.state()
    }

    /// Slaves of the latest discovery or open.
    pub fn slaves(&self) -> Vec<SlaveDescriptor> {
        read(&self.inner.slaves).clone()
    }

    pub fn status(&self) -> BusStatus {
        let adapter = lock(&self.inner.adapter)
            .clone()
            .or_else(|| self.inner.config.adapter.clone());
        BusStatus {
            state: self.inner.state(),
            adapter,
            cycle_time_us: self.inner.config.cycle_time.as_micros() as u64,
            reconnecting: self.inner.is_reconnecting(),
            slaves: self.slaves(),
            counters: self.inner.counters.snapshot(),
        }
    }

    /// Measures SDO round trips to `slave`; see [`LatencyProbe`].
    pub fn probe_latency(&self, slave: SlavePos, samples: usize) -> Result<CycleStats> {
        LatencyProbe::new(self).run(slave, samples)
    }
}

impl<P: LinkProvider> Drop for Bus<P> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_transitions() {
        use BusState::{Idle, Operational, PreOperational, SafeOperational};
        let fault = BusState::Error(BusFault {
            reason: "x".into(),
            diagnostics: Diagnostics::default(),
        });
        assert!(Idle.permits(&PreOperational));
        assert!(PreOperational.permits(&SafeOperational));
        assert!(SafeOperational.permits(&Operational));
        assert!(Operational.permits(&SafeOperational));
        assert!(!Idle.permits(&Operational));
        assert!(!Idle.permits(&SafeOperational));
        assert!(!PreOperational.permits(&Operational));
        assert!(!Operational.permits(&Idle));
        assert!(Operational.permits(&fault));
        assert!(fault.permits(&Idle));
        assert!(!fault.permits(&PreOperational));
    }

    #[test]
    fn reconnect_backoff() {
        let policy = ReconnectPolicy::default();
        let secs: Vec<u64> = (1..=6).map(|a| policy.backoff(a).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 10, 10]);
        assert_eq!(policy.backoff(40), Duration::from_secs(10));
    }

    #[test]
    fn builder_precedence() {
        let mapping =
            PdoMapping::from_json_str(r#"{"network":{"adapter":"eth7","cycle_ms":2.5}}"#).unwrap();
        let bus = BusBuilder::new()
            .mapping(mapping.clone())
            .build(crate::sim::SimBus::new())
            .unwrap();
        assert_eq!(bus.config().adapter.as_deref(), Some("eth7"));
        assert_eq!(bus.config().cycle_time, Duration::from_micros(2500));

        let bus = BusBuilder::new()
            .mapping(mapping)
            .adapter("sim0")
            .cycle_time_us(500)
            .build(crate::sim::SimBus::new())
            .unwrap();
        assert_eq!(bus.config().adapter.as_deref(), Some("sim0"));
        assert_eq!(bus.config().cycle_time, Duration::from_micros(500));

        let bus = BusBuilder::new().build(crate::sim::SimBus::new()).unwrap();
        assert_eq!(bus.config().cycle_time, DEFAULT_CYCLE_TIME);

        let err = BusBuilder::new()
            .cycle_time(Duration::from_secs(0))
            .build(crate::sim::SimBus::new())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn state_serializes_with_fault() {
        let state = BusState::Error(BusFault {
            reason: "lost".into(),
            diagnostics: Diagnostics::default(),
        });
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "Error");
        assert_eq!(json["fault"]["reason"], "lost");
        assert_eq!(serde_json::to_value(&BusState::Idle).unwrap()["state"], "Idle");
    }
}
