// vim: tw=80
use std::{sync::Arc, time::Duration};

use tempfile::{Builder, TempDir};

use spor_core::{
    gateway::Gateway,
    injector::{Topology, VolumeSpec},
    recorder::ResultRecorder,
    scenario::{Backend, Harness, ScenarioContext, Settings},
    sim::{SimConfig, SimService},
    waiter::ManualClock,
};

macro_rules! t {
    ($e:expr) => (match $e {
        Ok(e) => e,
        Err(e) => panic!("{} failed with {:?}", stringify!($e), e),
    })
}

/// A harness wired to a simulated storage service
struct Rig {
    tempdir:  TempDir,
    sim:      Arc<SimService>,
    clock:    Arc<ManualClock>,
    topology: Topology,
    harness:  Harness,
}

impl Rig {
    /// Bring the service up cleanly with every volume mounted, as a scenario
    /// would before its first write.
    fn bringup(&self, ctx: &ScenarioContext) {
        let injector = self.harness.injector();
        t!(injector.clean_bringup(ctx));
        for v in self.topology.volumes.iter() {
            t!(injector.setup_volume(ctx, v.id));
        }
    }

    /// Crash the service, restart it dirty, and reattach every volume.
    fn crash_and_recover(&self, ctx: &ScenarioContext) {
        let injector = self.harness.injector();
        t!(injector.inject_crash(ctx));
        t!(injector.dirty_bringup(ctx));
        for v in self.topology.volumes.iter() {
            t!(injector.reattach(ctx, v.id));
        }
    }
}

/// Helper to build a `Rig`
#[derive(Debug)]
struct RigBuilder {
    /// Number of volumes
    volumes:  u32,
    /// Spare devices in the array
    spares:   usize,
    config:   SimConfig,
    settings: Settings,
}

impl RigBuilder {
    fn build(&self) -> Rig {
        self.build_with_gateway(|sim| sim as Arc<dyn Gateway>)
    }

    /// Build a `Rig` whose administrative requests go through `f(sim)`
    /// instead of straight to the simulator.
    fn build_with_gateway<F>(&self, f: F) -> Rig
        where F: FnOnce(Arc<SimService>) -> Arc<dyn Gateway>
    {
        let tempdir = t!(Builder::new().prefix("spor_functional").tempdir());
        let defaults = Topology::default();
        let topology = Topology {
            // Data devices are unvme-ns-0 through 2
            spares: (0..self.spares)
                .map(|i| format!("unvme-ns-{}", 3 + i))
                .collect(),
            volumes: (1..=self.volumes)
                .map(|id| VolumeSpec {
                    id,
                    name: format!("vol{id}"),
                    size: 1 << 30,
                }).collect(),
            ..defaults
        };
        let sim = Arc::new(SimService::new(&topology, self.config.clone()));
        let clock = Arc::new(ManualClock::new());
        let backend = Backend {
            gateway: f(sim.clone()),
            io:      sim.clone(),
            process: sim.clone(),
            clock:   clock.clone(),
        };
        let recorder = ResultRecorder::new(tempdir.path());
        let harness = t!(Harness::new(backend, topology.clone(),
                                      self.settings.clone(), recorder));
        Rig { tempdir, sim, clock, topology, harness }
    }

    fn config(&mut self, config: SimConfig) -> &mut Self {
        self.config = config;
        self
    }

    fn new() -> Self {
        Self {
            volumes:  1,
            spares:   1,
            config:   SimConfig::default(),
            settings: Settings {
                quick:         true,
                state_timeout: Duration::from_secs(30),
                ..Default::default()
            },
        }
    }

    fn settings(&mut self, settings: Settings) -> &mut Self {
        self.settings = settings;
        self
    }

    fn spares(&mut self, spares: usize) -> &mut Self {
        self.spares = spares;
        self
    }

    fn volumes(&mut self, volumes: u32) -> &mut Self {
        self.volumes = volumes;
        self
    }
}

mod faults;
mod protocol;
