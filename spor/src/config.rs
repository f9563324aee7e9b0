// vim: tw=80
//! The `spor` configuration file

use serde_derive::{Deserialize, Serialize};
use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use spor_core::{
    blockio::FileBlockIo,
    gateway::CliGateway,
    injector::{Topology, VolumeSpec},
    parse_size,
    process::ServiceProcess,
    scenario::{Backend, Settings},
    sim::{SimConfig, SimService},
    waiter::SystemClock,
    Error,
    Result,
};

/// What kind of storage service to test
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// The built-in simulator
    #[default]
    Sim,
    /// A real service binary, controlled through its CLI client
    Process,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// The service binary and its arguments
    pub command:              Vec<String>,
    /// Extra arguments for a clean start
    pub clean_args:           Vec<String>,
    /// Extra arguments for a restart after a crash
    pub dirty_args:           Vec<String>,
    pub startup_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            command:              Vec::new(),
            clean_args:           Vec::new(),
            dirty_args:           Vec::new(),
            startup_timeout_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct ArrayConfig {
    pub name:    String,
    pub devices: Vec<String>,
    pub spares:  Vec<String>,
}

impl Default for ArrayConfig {
    fn default() -> Self {
        let t = Topology::default();
        ArrayConfig {
            name:    t.array,
            devices: t.devices,
            spares:  t.spares,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct SubsystemConfig {
    pub transport:  String,
    pub address:    String,
    pub port:       u16,
    pub nqn_prefix: String,
}

impl Default for SubsystemConfig {
    fn default() -> Self {
        let t = Topology::default();
        SubsystemConfig {
            transport:  t.transport,
            address:    t.address,
            port:       t.port,
            nqn_prefix: t.nqn_prefix,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeConfig {
    pub id:     u32,
    pub name:   String,
    /// Like "1G"
    pub size:   String,
    /// Where the volume appears on the host.  Required for a process target.
    #[serde(default)]
    pub device: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Config {
    pub target:             Target,
    pub service:            ServiceConfig,
    /// The administrative CLI client, and any arguments that precede every
    /// command
    pub cli:                Vec<String>,
    pub array:              ArrayConfig,
    pub subsystem:          SubsystemConfig,
    pub volumes:            Vec<VolumeConfig>,
    /// Write offsets, like "4k"
    pub offsets:            Vec<String>,
    /// Write sizes, like "128k"
    pub sizes:              Vec<String>,
    pub threads:            usize,
    pub poll_interval_ms:   u64,
    pub state_timeout_secs: u64,
    pub quick:              bool,
    pub result_dir:         PathBuf,
    /// Fault knobs for the simulator
    pub sim:                SimConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            target:             Target::default(),
            service:            ServiceConfig::default(),
            cli:                Vec::new(),
            array:              ArrayConfig::default(),
            subsystem:          SubsystemConfig::default(),
            volumes:            vec![VolumeConfig {
                id:     1,
                name:   "vol1".into(),
                size:   "1G".into(),
                device: None,
            }],
            offsets:            vec!["0".into(), "4k".into()],
            sizes:              vec!["128k".into(), "256k".into()],
            threads:            4,
            poll_interval_ms:   50,
            state_timeout_secs: 60,
            quick:              false,
            result_dir:         PathBuf::from("."),
            sim:                SimConfig::default(),
        }
    }
}

impl Config {
    /// Construct the interfaces to the service under test
    pub fn backend(&self) -> Result<Backend> {
        match self.target {
            Target::Sim => {
                let sim = SimService::new(&self.topology()?, self.sim.clone());
                Ok(Backend::sim(Arc::new(sim)))
            }
            Target::Process => {
                let mut io = FileBlockIo::default();
                for v in self.volumes.iter() {
                    let device = v.device.as_ref().ok_or_else(|| {
                        Error::Config(format!("volume {} has no device",
                                              v.name))
                    })?;
                    io.attach(v.id, device);
                }
                let process = ServiceProcess::new(&self.service.command)?
                    .clean_args(&self.service.clean_args)
                    .dirty_args(&self.service.dirty_args);
                Ok(Backend {
                    gateway: Arc::new(CliGateway::new(&self.cli)?),
                    io:      Arc::new(io),
                    process: Arc::new(process),
                    clock:   Arc::new(SystemClock),
                })
            }
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        serde_yaml_ng::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn settings(&self) -> Result<Settings> {
        let sizes = |v: &[String]| {
            v.iter()
                .map(|s| parse_size(s))
                .collect::<Result<Vec<_>>>()
        };
        let threads = NonZeroUsize::new(self.threads)
            .ok_or_else(|| Error::Config("threads must be positive".into()))?;
        let write_sizes = sizes(&self.sizes)?;
        if write_sizes.contains(&0) {
            return Err(Error::Config("write sizes must be positive".into()));
        }
        Ok(Settings {
            offsets: sizes(&self.offsets)?,
            sizes: write_sizes,
            threads,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            state_timeout: Duration::from_secs(self.state_timeout_secs),
            startup_timeout:
                Duration::from_secs(self.service.startup_timeout_secs),
            quick: self.quick,
            ..Default::default()
        })
    }

    pub fn topology(&self) -> Result<Topology> {
        let volumes = self.volumes.iter()
            .map(|v| Ok(VolumeSpec {
                id:   v.id,
                name: v.name.clone(),
                size: parse_size(&v.size)?,
            })).collect::<Result<Vec<_>>>()?;
        Ok(Topology {
            array:      self.array.name.clone(),
            devices:    self.array.devices.clone(),
            spares:     self.array.spares.clone(),
            transport:  self.subsystem.transport.clone(),
            address:    self.subsystem.address.clone(),
            port:       self.subsystem.port,
            nqn_prefix: self.subsystem.nqn_prefix.clone(),
            volumes,
        })
    }
}
