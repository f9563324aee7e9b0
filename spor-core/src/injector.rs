// vim: tw=80
//! The Crash Injector
//!
//! Kills the storage service without a clean shutdown, brings it back up
//! dirty, and re-establishes the administrative context that verification
//! needs.  Every administrative call made here must succeed.  If one doesn't,
//! the scenario's verdict would be meaningless, so it fails with
//! [`Error::Reattach`].

use serde_derive::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

use crate::{
    gateway::{array, device, subsystem, volume, Gateway, Request, Response},
    process::{Bringup, ProcessControl},
    scenario::ScenarioContext,
    types::{Error, Result, VolumeId},
    waiter::StateWaiter,
};

/// How long to wait for a freshly started service to answer requests
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// One logical volume of the array under test
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeSpec {
    pub id:   VolumeId,
    pub name: String,
    /// Capacity in bytes
    pub size: u64,
}

/// The layout of the storage service's array, volumes, and access subsystems
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Topology {
    pub array:      String,
    pub devices:    Vec<String>,
    pub spares:     Vec<String>,
    pub transport:  String,
    pub address:    String,
    pub port:       u16,
    /// Each volume is exported through its own subsystem, whose NQN is this
    /// prefix followed by the volume id.
    pub nqn_prefix: String,
    pub volumes:    Vec<VolumeSpec>,
}

impl Default for Topology {
    fn default() -> Self {
        Topology {
            array:      "POSArray".into(),
            devices:    vec!["unvme-ns-0".into(), "unvme-ns-1".into(),
                             "unvme-ns-2".into()],
            spares:     vec!["unvme-ns-3".into()],
            transport:  "tcp".into(),
            address:    "127.0.0.1".into(),
            port:       1158,
            nqn_prefix: "nqn.2019-04.pos:subsystem".into(),
            volumes:    vec![VolumeSpec {
                id:   1,
                name: "vol1".into(),
                size: 1 << 30,
            }],
        }
    }
}

impl Topology {
    /// The NQN of the subsystem that exports `volume`
    pub fn nqn(&self, volume: VolumeId) -> String {
        format!("{}{}", self.nqn_prefix, volume)
    }

    pub fn volume(&self, id: VolumeId) -> Result<&VolumeSpec> {
        self.volumes.iter()
            .find(|v| v.id == id)
            .ok_or_else(|| Error::Config(format!("no such volume: {id}")))
    }
}

pub struct CrashInjector<'a> {
    gateway:         &'a dyn Gateway,
    process:         &'a dyn ProcessControl,
    waiter:          StateWaiter<'a>,
    topology:        &'a Topology,
    startup_timeout: Duration,
}

impl<'a> CrashInjector<'a> {
    /// Issue an administrative request that must succeed.
    fn admin(&self, ctx: &ScenarioContext, req: Request) -> Result<Response> {
        let resp = self.gateway.call(&req)?;
        ctx.log_response(&req, &resp);
        if resp.is_success() {
            Ok(resp)
        } else {
            error!(scenario = ctx.name(), request = req.label(),
                   code = resp.code, description = %resp.description,
                   "administrative request failed");
            Err(Error::Reattach {
                step: req.label().to_owned(),
                code: resp.code
            })
        }
    }

    fn bringup(&self, mode: Bringup) -> Result<()> {
        self.process.start(mode)?;
        if self.waiter.wait_responsive(self.startup_timeout) {
            info!(%mode, "bringup complete");
            Ok(())
        } else {
            Err(Error::Process(format!(
                "service unresponsive {:?} after {mode} bringup",
                self.startup_timeout)))
        }
    }

    /// Start the service from scratch, then create and mount the array.
    #[tracing::instrument(skip_all, fields(scenario = ctx.name()))]
    pub fn clean_bringup(&self, ctx: &ScenarioContext) -> Result<()> {
        let t = self.topology;
        self.bringup(Bringup::Clean)?;
        self.admin(ctx, array::create(&t.array, &t.devices, &t.spares))?;
        self.admin(ctx, array::mount(&t.array))?;
        Ok(())
    }

    /// Remove a member device from the array, as if it had failed.
    pub fn detach_device(&self, ctx: &ScenarioContext, dev: &str)
        -> Result<()>
    {
        self.admin(ctx, device::remove(&self.topology.array, dev))?;
        info!(scenario = ctx.name(), device = dev, "device detached");
        Ok(())
    }

    /// Restart the service after a crash and remount its array.
    ///
    /// The service gets no clean-shutdown state, so it must go through its
    /// own crash recovery.
    #[tracing::instrument(skip_all, fields(scenario = ctx.name()))]
    pub fn dirty_bringup(&self, ctx: &ScenarioContext) -> Result<()> {
        self.bringup(Bringup::Dirty)?;
        self.admin(ctx, array::mount(&self.topology.array))?;
        Ok(())
    }

    /// Abruptly terminate the service.
    ///
    /// Every write acknowledged before this call belongs to an earlier epoch
    /// than any write acknowledged after it.
    pub fn inject_crash(&self, ctx: &ScenarioContext) -> Result<()> {
        self.process.kill()?;
        let epoch = ctx.advance_epoch();
        info!(scenario = ctx.name(), epoch, "crash injected");
        Ok(())
    }

    pub fn new(
        gateway: &'a dyn Gateway,
        process: &'a dyn ProcessControl,
        waiter: StateWaiter<'a>,
        topology: &'a Topology
    ) -> Self
    {
        CrashInjector {
            gateway,
            process,
            waiter,
            topology,
            startup_timeout: STARTUP_TIMEOUT,
        }
    }

    /// Make volume `vol` readable again after a dirty bringup, by re-registering
    /// its subsystem and remounting it.
    #[tracing::instrument(skip(self, ctx), fields(scenario = ctx.name()))]
    pub fn reattach(&self, ctx: &ScenarioContext, vol: VolumeId)
        -> Result<()>
    {
        let t = self.topology;
        let spec = t.volume(vol)?;
        let nqn = t.nqn(vol);
        self.admin(ctx, subsystem::create(&nqn))?;
        self.admin(ctx, subsystem::add_listener(&nqn, &t.transport,
                                                &t.address, t.port))?;
        self.admin(ctx, volume::mount(&t.array, &spec.name, &nqn))?;
        info!(volume = %spec.name, "reattached");
        Ok(())
    }

    /// Create volume `vol` on a freshly created array, and export it.
    #[tracing::instrument(skip(self, ctx), fields(scenario = ctx.name()))]
    pub fn setup_volume(&self, ctx: &ScenarioContext, vol: VolumeId)
        -> Result<()>
    {
        let t = self.topology;
        let spec = t.volume(vol)?;
        let nqn = t.nqn(vol);
        self.admin(ctx, subsystem::create(&nqn))?;
        self.admin(ctx, subsystem::add_listener(&nqn, &t.transport,
                                                &t.address, t.port))?;
        self.admin(ctx, volume::create(&t.array, &spec.name, spec.size))?;
        self.admin(ctx, volume::mount(&t.array, &spec.name, &nqn))?;
        Ok(())
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }
}
