// vim: tw=80
//! Scenario context, the scenario catalogue, and the harness that runs them
//!
//! A scenario always runs the same protocol: clean bringup, some writes, a
//! crash, a dirty bringup, reattach, and verification.  All per-scenario state
//! lives in a [`ScenarioContext`] that is threaded through every component, so
//! nothing leaks from one scenario into the next except the run-wide
//! [`PatternRegistry`].

use itertools::iproduct;
use std::{
    fmt::{self, Display, Formatter},
    num::NonZeroUsize,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};
use tracing::{error, info, warn};

use crate::{
    blockio::BlockIo,
    gateway::{array, Gateway, Request, Response},
    injector::{CrashInjector, Topology, VolumeSpec, STARTUP_TIMEOUT},
    pattern::Pattern,
    process::ProcessControl,
    recorder::{Abort, Diagnostics, ResultRecorder, Verdict},
    registry::PatternRegistry,
    sim::SimService,
    types::{ArrayCondition, Error, Region, Result, VolumeId},
    verifier::{VerificationOutcome, Verifier},
    waiter::{Clock, StateWaiter, SystemClock, POLL_INTERVAL},
    writer::WriteOrchestrator,
};

/// Default number of concurrent writers
const THREADS: NonZeroUsize = match NonZeroUsize::new(4) {
    Some(n) => n,
    None => unreachable!(),
};

/// Everything that one run of one scenario accumulates
#[derive(Debug)]
pub struct ScenarioContext {
    name:        String,
    /// Number of crashes injected so far
    epoch:       AtomicU64,
    diagnostics: Mutex<Diagnostics>,
    outcomes:    Mutex<Vec<VerificationOutcome>>,
}

impl ScenarioContext {
    /// Record that the scenario could not finish.
    pub fn abort(&self, e: &Error) {
        self.diagnostics.lock().unwrap().aborted = Some(Abort::from(e));
    }

    /// Note that a crash was injected.  Returns the new epoch.
    pub fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn into_parts(self) -> (Vec<VerificationOutcome>, Diagnostics) {
        (self.outcomes.into_inner().unwrap(),
         self.diagnostics.into_inner().unwrap())
    }

    pub fn log_response(&self, req: &Request, resp: &Response) {
        self.diagnostics.lock().unwrap().push(req, resp);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn new<S: Into<String>>(name: S) -> Self {
        ScenarioContext {
            name:        name.into(),
            epoch:       AtomicU64::new(0),
            diagnostics: Mutex::default(),
            outcomes:    Mutex::default(),
        }
    }

    /// A copy of every outcome recorded so far
    pub fn outcomes(&self) -> Vec<VerificationOutcome> {
        self.outcomes.lock().unwrap().clone()
    }

    pub fn push_outcome(&self, outcome: VerificationOutcome) {
        self.outcomes.lock().unwrap().push(outcome);
    }
}

/// Tunables shared by every scenario
#[derive(Clone, Debug)]
pub struct Settings {
    pub offsets:           Vec<u64>,
    pub sizes:             Vec<u64>,
    /// Size of each writer's region in the multi-thread scenario
    pub multi_thread_size: u64,
    pub threads:           NonZeroUsize,
    pub poll_interval:     Duration,
    /// How long to wait for an array condition
    pub state_timeout:     Duration,
    pub startup_timeout:   Duration,
    /// Only run the last (offset, size) combination
    pub quick:             bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            offsets:           vec![0, 4096],
            sizes:             vec![128 << 10, 256 << 10],
            multi_thread_size: 1 << 20,
            threads:           THREADS,
            poll_interval:     POLL_INTERVAL,
            state_timeout:     Duration::from_secs(60),
            startup_timeout:   STARTUP_TIMEOUT,
            quick:             false,
        }
    }
}

/// The storage service, as seen through its three external interfaces
#[derive(Clone)]
pub struct Backend {
    pub gateway: Arc<dyn Gateway>,
    pub io:      Arc<dyn BlockIo>,
    pub process: Arc<dyn ProcessControl>,
    pub clock:   Arc<dyn Clock>,
}

impl Backend {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// A backend whose every interface is served by `sim`
    pub fn sim(sim: Arc<SimService>) -> Self {
        Backend {
            gateway: sim.clone(),
            io:      sim.clone(),
            process: sim,
            clock:   Arc::new(SystemClock),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Scenario {
    Basic,
    Rewrite,
    MultiThread,
    MultiVolume,
    Rebuild,
}

impl Scenario {
    pub const ALL: [Scenario; 5] = [
        Scenario::Basic,
        Scenario::Rewrite,
        Scenario::MultiThread,
        Scenario::MultiVolume,
        Scenario::Rebuild,
    ];

    pub fn description(&self) -> &'static str {
        match self {
            Scenario::Basic =>
                "write, crash, recover, and verify a single region",
            Scenario::Rewrite =>
                "verify across a crash, then overwrite and verify again",
            Scenario::MultiThread =>
                "concurrent writers on disjoint regions of one volume",
            Scenario::MultiVolume =>
                "one concurrent writer per volume",
            Scenario::Rebuild =>
                "crash while the array is rebuilding onto a spare",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::Basic => "basic",
            Scenario::Rewrite => "rewrite",
            Scenario::MultiThread => "multi-thread",
            Scenario::MultiVolume => "multi-volume",
            Scenario::Rebuild => "rebuild",
        }
    }
}

impl Display for Scenario {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.name().fmt(f)
    }
}

impl FromStr for Scenario {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Scenario::ALL.iter()
            .find(|scenario| scenario.name() == s)
            .copied()
            .ok_or_else(|| Error::Config(format!("unknown scenario {s:?}")))
    }
}

/// Runs scenarios against one storage service, and records their results.
pub struct Harness {
    backend:  Backend,
    topology: Topology,
    settings: Settings,
    registry: PatternRegistry,
    recorder: ResultRecorder,
}

impl Harness {
    /// The (offset, size) combinations to exercise
    fn cases(&self) -> Vec<(u64, u64)> {
        let mut cases = iproduct!(self.settings.offsets.iter().copied(),
                                  self.settings.sizes.iter().copied())
            .collect::<Vec<_>>();
        if self.settings.quick && cases.len() > 1 {
            cases.drain(..cases.len() - 1);
        }
        cases
    }

    /// Verify `region` against `pattern`, and record the outcome.
    fn check(&self, ctx: &ScenarioContext, region: Region, pattern: &Pattern) {
        ctx.push_outcome(self.verifier().verify(region, pattern));
    }

    fn crash_and_recover(&self, ctx: &ScenarioContext, volumes: &[VolumeId])
        -> Result<()>
    {
        let injector = self.injector();
        injector.inject_crash(ctx)?;
        injector.dirty_bringup(ctx)?;
        for &vol in volumes {
            injector.reattach(ctx, vol)?;
        }
        Ok(())
    }

    fn execute(&self, scenario: Scenario, ctx: &ScenarioContext)
        -> Result<()>
    {
        match scenario {
            Scenario::Basic => self.basic(ctx),
            Scenario::Rewrite => self.rewrite(ctx),
            Scenario::MultiThread => self.multi_thread(ctx),
            Scenario::MultiVolume => self.multi_volume(ctx),
            Scenario::Rebuild => self.rebuild(ctx),
        }
    }

    fn basic(&self, ctx: &ScenarioContext) -> Result<()> {
        let vol = self.primary().id;
        for (offset, size) in self.cases() {
            self.writer().write(ctx, Region::new(vol, offset, size))?;
            self.crash_and_recover(ctx, &[vol])?;
            self.check(ctx, Region::new(vol, offset, size),
                       &self.registry.latest(vol));
        }
        Ok(())
    }

    fn rewrite(&self, ctx: &ScenarioContext) -> Result<()> {
        let vol = self.primary().id;
        for (offset, size) in self.cases() {
            let region = Region::new(vol, offset, size);
            self.writer().write(ctx, region)?;
            self.crash_and_recover(ctx, &[vol])?;
            self.check(ctx, region, &self.registry.latest(vol));
            self.writer().write(ctx, region)?;
            self.check(ctx, region, &self.registry.latest(vol));
        }
        Ok(())
    }

    fn multi_thread(&self, ctx: &ScenarioContext) -> Result<()> {
        let vol = self.primary().id;
        let size = self.settings.multi_thread_size;
        let first = self.registry.issued(vol);
        let requests = (0..self.settings.threads.get())
            .map(|i| Region::new(vol, i as u64 * size, size))
            .collect::<Vec<_>>();
        self.writer().write_concurrently(ctx, &requests)?;
        self.crash_and_recover(ctx, &[vol])?;
        for (i, region) in requests.into_iter().enumerate() {
            self.check(ctx, region, &self.registry.pattern(vol, first + i));
        }
        Ok(())
    }

    fn multi_volume(&self, ctx: &ScenarioContext) -> Result<()> {
        let volumes = self.topology.volumes.iter()
            .map(|v| v.id)
            .collect::<Vec<_>>();
        for (offset, size) in self.cases() {
            let requests = volumes.iter()
                .map(|&vol| Region::new(vol, offset, size))
                .collect::<Vec<_>>();
            self.writer().write_concurrently(ctx, &requests)?;
            self.crash_and_recover(ctx, &volumes)?;
            for region in requests {
                self.check(ctx, region, &self.registry.latest(region.volume));
            }
        }
        Ok(())
    }

    /// Crash while the array is rebuilding onto a spare.
    fn rebuild(&self, ctx: &ScenarioContext) -> Result<()> {
        let vol = self.primary().id;
        let Some((offset, size)) = self.cases().pop() else {
            return Ok(());
        };
        let Some(victim) = self.topology.devices.first() else {
            return Err(Error::Config("array has no devices".into()));
        };
        let region = Region::new(vol, offset, size);
        self.writer().write(ctx, region)?;
        self.injector().detach_device(ctx, victim)?;
        self.waiter().wait_until(&array::info(&self.topology.array),
                                 ArrayCondition::Rebuilding,
                                 self.settings.state_timeout)?;
        self.crash_and_recover(ctx, &[vol])?;
        self.check(ctx, region, &self.registry.latest(vol));
        Ok(())
    }

    pub fn injector(&self) -> CrashInjector<'_> {
        CrashInjector::new(&*self.backend.gateway, &*self.backend.process,
                           self.waiter(), &self.topology)
            .startup_timeout(self.settings.startup_timeout)
    }

    pub fn new(
        backend: Backend,
        topology: Topology,
        settings: Settings,
        recorder: ResultRecorder
    ) -> Result<Self>
    {
        if topology.volumes.is_empty() {
            return Err(Error::Config("no volumes configured".into()));
        }
        if settings.sizes.contains(&0) || settings.multi_thread_size == 0 {
            return Err(Error::Config("write sizes must be positive".into()));
        }
        Ok(Harness {
            backend,
            topology,
            settings,
            registry: PatternRegistry::new(),
            recorder,
        })
    }

    /// Bring the service up cleanly with every volume created and mounted.
    fn prepare(&self, ctx: &ScenarioContext) -> Result<()> {
        let injector = self.injector();
        injector.clean_bringup(ctx)?;
        for v in self.topology.volumes.iter() {
            injector.setup_volume(ctx, v.id)?;
        }
        Ok(())
    }

    /// The volume used by single-volume scenarios
    fn primary(&self) -> &VolumeSpec {
        // Harness::new guarantees at least one volume
        &self.topology.volumes[0]
    }

    pub fn recorder(&self) -> &ResultRecorder {
        &self.recorder
    }

    pub fn registry(&self) -> &PatternRegistry {
        &self.registry
    }

    /// Run one scenario to completion, and record its result.
    ///
    /// A scenario that cannot finish is recorded as a failure.  Only a failure
    /// to record the result is returned as an error.
    pub fn run(&self, scenario: Scenario) -> Result<Verdict> {
        let ctx = ScenarioContext::new(scenario.name());
        info!(%scenario, "starting scenario");
        let r = self.prepare(&ctx)
            .and_then(|_| self.execute(scenario, &ctx));
        if let Err(e) = r {
            error!(%scenario, error = %e, class = e.class(),
                   "scenario aborted");
            ctx.abort(&e);
        }
        self.teardown();
        let (outcomes, diagnostics) = ctx.into_parts();
        let verdict = self.recorder.record(scenario.name(), outcomes,
                                           diagnostics)?;
        info!(%scenario, %verdict, "scenario complete");
        Ok(verdict)
    }

    /// Run each scenario in turn, stopping early only if a result cannot be
    /// recorded.
    pub fn run_all(&self, scenarios: &[Scenario])
        -> Result<Vec<(Scenario, Verdict)>>
    {
        scenarios.iter()
            .map(|&s| self.run(s).map(|verdict| (s, verdict)))
            .collect()
    }

    fn teardown(&self) {
        if self.backend.process.is_running() {
            if let Err(e) = self.backend.process.kill() {
                warn!(error = %e, "failed to stop service");
            }
        }
    }

    pub fn verifier(&self) -> Verifier<'_> {
        Verifier::new(&*self.backend.io)
    }

    pub fn waiter(&self) -> StateWaiter<'_> {
        StateWaiter::new(&*self.backend.gateway, &*self.backend.clock)
            .interval(self.settings.poll_interval)
    }

    pub fn writer(&self) -> WriteOrchestrator<'_> {
        let n = self.settings.threads.get().max(self.topology.volumes.len());
        WriteOrchestrator::new(&*self.backend.io, &self.registry,
            NonZeroUsize::new(n).unwrap_or(self.settings.threads))
    }
}
