// vim: tw=80
//! An in-memory stand-in for the storage service
//!
//! `SimService` plays all three external roles at once: it answers gateway
//! requests, serves block I/O for its volumes, and can be killed and
//! restarted.  Fault knobs in [`SimConfig`] make it misbehave in the ways that
//! the harness is supposed to catch.

use nix::libc;
use serde_derive::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    sync::Mutex,
};
use tracing::{debug, info};

use crate::{
    blockio::BlockIo,
    gateway::{Gateway, Request, Response},
    injector::Topology,
    process::{Bringup, ProcessControl},
    types::{ArrayCondition, Error, Result, VolumeId},
};

/// Allocation granularity of simulated volumes
const BLOCK_SIZE: u64 = 4096;

/// Fault injection knobs
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct SimConfig {
    /// Discard every acknowledged write on crash, as a service with a broken
    /// journal would.
    pub lose_acked_writes:   bool,
    /// After a device is removed, the array stays DEGRADED for this many
    /// status queries before it starts REBUILDING onto a spare.
    pub rebuild_after_polls: u32,
    /// Fail this many status queries after each clean start.
    pub failing_polls:       u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            lose_acked_writes:   false,
            rebuild_after_polls: 2,
            failing_polls:       0,
        }
    }
}

#[derive(Debug)]
struct Array {
    name:      String,
    devices:   Vec<String>,
    spares:    Vec<String>,
    mounted:   bool,
    condition: ArrayCondition,
    /// Status queries answered since the array became degraded
    polls:     u32,
}

#[derive(Debug, Default)]
struct Volume {
    id:      VolumeId,
    size:    u64,
    mounted: bool,
    blocks:  BTreeMap<u64, Vec<u8>>,
}

impl Volume {
    fn check(&self, offset: u64, len: usize) -> io::Result<()> {
        if !self.mounted {
            return Err(io::Error::from_raw_os_error(libc::ENXIO));
        }
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(io::Error::from_raw_os_error(libc::EINVAL))
        }
    }

    fn read(&self, offset: u64, buf: &mut [u8]) {
        let mut pos = 0;
        while pos < buf.len() {
            let addr = offset + pos as u64;
            let (lba, within) = (addr / BLOCK_SIZE, (addr % BLOCK_SIZE) as usize);
            let n = (BLOCK_SIZE as usize - within).min(buf.len() - pos);
            match self.blocks.get(&lba) {
                Some(block) => buf[pos..pos + n]
                    .copy_from_slice(&block[within..within + n]),
                None => buf[pos..pos + n].fill(0),
            }
            pos += n;
        }
    }

    fn write(&mut self, offset: u64, buf: &[u8]) {
        let mut pos = 0;
        while pos < buf.len() {
            let addr = offset + pos as u64;
            let (lba, within) = (addr / BLOCK_SIZE, (addr % BLOCK_SIZE) as usize);
            let n = (BLOCK_SIZE as usize - within).min(buf.len() - pos);
            self.blocks.entry(lba)
                .or_insert_with(|| vec![0u8; BLOCK_SIZE as usize])
                [within..within + n]
                .copy_from_slice(&buf[pos..pos + n]);
            pos += n;
        }
    }
}

#[derive(Debug, Default)]
struct State {
    running:       bool,
    array:         Option<Array>,
    /// Keyed by name
    volumes:       BTreeMap<String, Volume>,
    subsystems:    BTreeSet<String>,
    failing_polls: u32,
}

impl State {
    fn volume_by_id(&mut self, id: VolumeId) -> io::Result<&mut Volume> {
        self.volumes.values_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODEV))
    }
}

fn code(errno: i32, description: &str) -> Response {
    Response::with_code(errno, description)
}

pub struct SimService {
    config: SimConfig,
    /// Volume ids by name, as given by the topology
    ids:    BTreeMap<String, VolumeId>,
    state:  Mutex<State>,
}

impl SimService {
    /// The current condition of the array, if it exists
    pub fn condition(&self) -> Option<ArrayCondition> {
        self.state.lock().unwrap()
            .array
            .as_ref()
            .map(|a| a.condition.clone())
    }

    /// Flip every bit of one stored byte, behind the harness's back.
    pub fn corrupt(&self, id: VolumeId, offset: u64) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        let vol = state.volume_by_id(id)?;
        let mut byte = [0u8];
        vol.read(offset, &mut byte);
        byte[0] ^= 0xff;
        vol.write(offset, &byte);
        Ok(())
    }

    fn handle(&self, state: &mut State, req: &Request) -> Response {
        match req {
            Request::SystemInfo => Response::ok(),
            Request::ArrayCreate { array, devices, spares } => {
                if state.array.is_some() {
                    return code(libc::EEXIST, "array already exists");
                }
                if devices.is_empty() {
                    return code(libc::EINVAL, "no data devices");
                }
                state.array = Some(Array {
                    name:      array.clone(),
                    devices:   devices.clone(),
                    spares:    spares.clone(),
                    mounted:   false,
                    condition: ArrayCondition::Normal,
                    polls:     0,
                });
                Response::ok()
            }
            Request::ArrayInfo { array } => {
                if state.failing_polls > 0 {
                    state.failing_polls -= 1;
                    return code(libc::EAGAIN, "status temporarily unavailable");
                }
                let Some(a) = state.array.as_mut().filter(|a| a.name == *array)
                else {
                    return code(libc::ENOENT, "no such array");
                };
                if a.condition == ArrayCondition::Degraded {
                    if a.polls >= self.config.rebuild_after_polls &&
                        !a.spares.is_empty()
                    {
                        let spare = a.spares.remove(0);
                        info!(%spare, "rebuild started");
                        a.devices.push(spare);
                        a.condition = ArrayCondition::Rebuilding;
                    } else {
                        a.polls += 1;
                    }
                }
                let situation = if a.mounted {
                    a.condition.to_string()
                } else {
                    ArrayCondition::Offline.to_string()
                };
                Response::with_situation(&situation)
            }
            Request::ArrayMount { array } => {
                match state.array.as_mut().filter(|a| a.name == *array) {
                    None => code(libc::ENOENT, "no such array"),
                    Some(a) if a.mounted => code(libc::EEXIST,
                                                 "array already mounted"),
                    Some(a) => {
                        a.mounted = true;
                        Response::ok()
                    }
                }
            }
            Request::DeviceRemove { array, device } => {
                let Some(a) = state.array.as_mut().filter(|a| a.name == *array)
                else {
                    return code(libc::ENOENT, "no such array");
                };
                let Some(i) = a.devices.iter().position(|d| d == device) else {
                    return code(libc::ENODEV, "no such device");
                };
                a.devices.remove(i);
                a.condition = match a.condition {
                    ArrayCondition::Normal => ArrayCondition::Degraded,
                    _ => ArrayCondition::Broken,
                };
                a.polls = 0;
                info!(%device, condition = %a.condition, "device removed");
                Response::ok()
            }
            Request::SubsystemCreate { nqn } => {
                if state.subsystems.insert(nqn.clone()) {
                    Response::ok()
                } else {
                    code(libc::EEXIST, "subsystem already exists")
                }
            }
            Request::ListenerAdd { nqn, .. } => {
                if state.subsystems.contains(nqn) {
                    Response::ok()
                } else {
                    code(libc::ENOENT, "no such subsystem")
                }
            }
            Request::VolumeCreate { array, volume, size } => {
                if !state.array.as_ref().is_some_and(|a| a.name == *array) {
                    return code(libc::ENOENT, "no such array");
                }
                let Some(&id) = self.ids.get(volume) else {
                    return code(libc::EINVAL, "volume not in topology");
                };
                if state.volumes.contains_key(volume) {
                    return code(libc::EEXIST, "volume already exists");
                }
                state.volumes.insert(volume.clone(), Volume {
                    id,
                    size: *size,
                    ..Default::default()
                });
                Response::ok()
            }
            Request::VolumeInfo { volume, .. } => {
                match state.volumes.get(volume) {
                    None => code(libc::ENOENT, "no such volume"),
                    Some(v) if v.mounted => Response::with_situation("MOUNTED"),
                    Some(_) => Response::with_situation("UNMOUNTED"),
                }
            }
            Request::VolumeMount { array, volume, nqn } => {
                if !state.array.as_ref()
                    .is_some_and(|a| a.name == *array && a.mounted)
                {
                    return code(libc::ENOENT, "array is not mounted");
                }
                if !state.subsystems.contains(nqn) {
                    return code(libc::ENOENT, "no such subsystem");
                }
                match state.volumes.get_mut(volume) {
                    None => code(libc::ENOENT, "no such volume"),
                    Some(v) if v.mounted => code(libc::EEXIST,
                                                 "volume already mounted"),
                    Some(v) => {
                        v.mounted = true;
                        Response::ok()
                    }
                }
            }
        }
    }

    pub fn new(topology: &Topology, config: SimConfig) -> Self {
        let ids = topology.volumes.iter()
            .map(|v| (v.name.clone(), v.id))
            .collect();
        SimService {
            config,
            ids,
            state: Mutex::default(),
        }
    }
}

impl BlockIo for SimService {
    fn write(&self, volume: VolumeId, offset: u64, buf: &[u8])
        -> io::Result<()>
    {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        let vol = state.volume_by_id(volume)?;
        vol.check(offset, buf.len())?;
        vol.write(offset, buf);
        Ok(())
    }

    fn read(&self, volume: VolumeId, offset: u64, len: usize)
        -> io::Result<Vec<u8>>
    {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        let vol = state.volume_by_id(volume)?;
        vol.check(offset, len)?;
        let mut buf = vec![0u8; len];
        vol.read(offset, &mut buf);
        Ok(buf)
    }
}

impl Gateway for SimService {
    fn call(&self, req: &Request) -> Result<Response> {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            return Err(Error::Gateway("connection refused".into()));
        }
        let resp = self.handle(&mut state, req);
        debug!(request = req.label(), code = resp.code, "sim");
        Ok(resp)
    }
}

impl ProcessControl for SimService {
    fn start(&self, mode: Bringup) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.running {
            return Err(Error::Process("service is already running".into()));
        }
        if mode == Bringup::Clean {
            *state = State {
                failing_polls: self.config.failing_polls,
                ..Default::default()
            };
        }
        state.running = true;
        Ok(())
    }

    fn kill(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            return Err(Error::Process("service is not running".into()));
        }
        state.running = false;
        state.subsystems.clear();
        if let Some(a) = state.array.as_mut() {
            a.mounted = false;
        }
        for v in state.volumes.values_mut() {
            v.mounted = false;
            if self.config.lose_acked_writes {
                v.blocks.clear();
            }
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }
}
