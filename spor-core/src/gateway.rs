// vim: tw=80
//! The command/response gateway to the storage service's administrative API
//!
//! Every administrative operation is a [`Request`] answered by a [`Response`]
//! carrying a numeric response code (0 means success) and a payload.  The
//! harness never interprets the payload beyond its condition field.

use serde_derive::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    process::{Command, Stdio},
};
use tracing::debug;

#[cfg(test)] use mockall::automock;

use crate::types::{ArrayCondition, Error, Result};

pub mod system {
    use super::Request;

    pub fn info() -> Request {
        Request::SystemInfo
    }
}

pub mod array {
    use super::Request;

    pub fn create(array: &str, devices: &[String], spares: &[String])
        -> Request
    {
        Request::ArrayCreate {
            array:   array.to_owned(),
            devices: devices.to_vec(),
            spares:  spares.to_vec(),
        }
    }

    /// Query the array's condition
    pub fn info(array: &str) -> Request {
        Request::ArrayInfo { array: array.to_owned() }
    }

    pub fn mount(array: &str) -> Request {
        Request::ArrayMount { array: array.to_owned() }
    }
}

pub mod device {
    use super::Request;

    /// Remove a member device from an array, as if it had been pulled.
    pub fn remove(array: &str, device: &str) -> Request {
        Request::DeviceRemove {
            array:  array.to_owned(),
            device: device.to_owned(),
        }
    }
}

pub mod subsystem {
    use super::Request;

    pub fn create(nqn: &str) -> Request {
        Request::SubsystemCreate { nqn: nqn.to_owned() }
    }

    pub fn add_listener(nqn: &str, transport: &str, address: &str, port: u16)
        -> Request
    {
        Request::ListenerAdd {
            nqn:       nqn.to_owned(),
            transport: transport.to_owned(),
            address:   address.to_owned(),
            port,
        }
    }
}

pub mod volume {
    use super::Request;

    pub fn create(array: &str, volume: &str, size: u64) -> Request {
        Request::VolumeCreate {
            array:  array.to_owned(),
            volume: volume.to_owned(),
            size,
        }
    }

    /// Query the volume's condition
    pub fn info(array: &str, volume: &str) -> Request {
        Request::VolumeInfo {
            array:  array.to_owned(),
            volume: volume.to_owned(),
        }
    }

    /// Mount a volume and expose it through the subsystem `nqn`
    pub fn mount(array: &str, volume: &str, nqn: &str) -> Request {
        Request::VolumeMount {
            array:  array.to_owned(),
            volume: volume.to_owned(),
            nqn:    nqn.to_owned(),
        }
    }
}

/// An administrative request
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Request {
    SystemInfo,
    ArrayCreate {
        array:   String,
        devices: Vec<String>,
        spares:  Vec<String>,
    },
    ArrayInfo { array: String },
    ArrayMount { array: String },
    DeviceRemove { array: String, device: String },
    SubsystemCreate { nqn: String },
    ListenerAdd {
        nqn:       String,
        transport: String,
        address:   String,
        port:      u16,
    },
    VolumeCreate { array: String, volume: String, size: u64 },
    VolumeInfo { array: String, volume: String },
    VolumeMount { array: String, volume: String, nqn: String },
}

impl Request {
    /// A short human-readable name for the operation, like "volume mount"
    pub fn label(&self) -> &'static str {
        match self {
            Request::SystemInfo => "system info",
            Request::ArrayCreate { .. } => "array create",
            Request::ArrayInfo { .. } => "array info",
            Request::ArrayMount { .. } => "array mount",
            Request::DeviceRemove { .. } => "device remove",
            Request::SubsystemCreate { .. } => "subsystem create",
            Request::ListenerAdd { .. } => "listener add",
            Request::VolumeCreate { .. } => "volume create",
            Request::VolumeInfo { .. } => "volume info",
            Request::VolumeMount { .. } => "volume mount",
        }
    }
}

/// The service's answer to a [`Request`]
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Response {
    /// 0 on success.  Any other value names a specific failure.
    pub code:        i32,
    pub description: String,
    /// The reported condition of the array or volume, for queries
    pub situation:   Option<String>,
    /// The raw reply, for diagnostics
    pub payload:     String,
}

impl Response {
    pub fn condition(&self) -> Option<ArrayCondition> {
        self.situation.as_deref().map(ArrayCondition::from)
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// A successful response with no payload
    pub fn ok() -> Self {
        Response::default()
    }

    pub fn with_code(code: i32, description: &str) -> Self {
        Response {
            code,
            description: description.to_owned(),
            ..Default::default()
        }
    }

    pub fn with_situation(situation: &str) -> Self {
        Response {
            situation: Some(situation.to_owned()),
            ..Default::default()
        }
    }
}

/// Anything that can deliver a [`Request`] to the storage service.
///
/// Each call is a single synchronous round trip.
#[cfg_attr(test, automock)]
pub trait Gateway: Send + Sync {
    /// Issue `req` and wait for its response.
    ///
    /// An `Err` means that no response was received at all.  A response with a
    /// non-zero code is still `Ok`.
    fn call(&self, req: &Request) -> Result<Response>;
}

/// A `Gateway` that runs the storage service's command-line client once per
/// request, and parses its JSON reply.
#[derive(Clone, Debug)]
pub struct CliGateway {
    argv: Vec<OsString>,
}

impl CliGateway {
    /// Translate a `Request` into the client's arguments
    fn args(req: &Request) -> Vec<String> {
        let mut args: Vec<String> = match req {
            Request::SystemInfo => vec!["system".into(), "info".into()],
            Request::ArrayCreate { array, devices, spares } => {
                let mut v = vec!["array".into(), "create".into(),
                    "--array-name".into(), array.clone(),
                    "--data-devs".into(), devices.join(",")];
                if !spares.is_empty() {
                    v.push("--spare".into());
                    v.push(spares.join(","));
                }
                v
            }
            Request::ArrayInfo { array } => {
                vec!["array".into(), "list".into(), "--array-name".into(),
                     array.clone()]
            }
            Request::ArrayMount { array } => {
                vec!["array".into(), "mount".into(), "--array-name".into(),
                     array.clone()]
            }
            Request::DeviceRemove { array, device } => {
                vec!["device".into(), "detach".into(),
                     "--array-name".into(), array.clone(),
                     "--device-name".into(), device.clone()]
            }
            Request::SubsystemCreate { nqn } => {
                vec!["subsystem".into(), "create".into(), "--subnqn".into(),
                     nqn.clone()]
            }
            Request::ListenerAdd { nqn, transport, address, port } => {
                vec!["subsystem".into(), "add-listener".into(),
                     "--subnqn".into(), nqn.clone(),
                     "--trtype".into(), transport.clone(),
                     "--traddr".into(), address.clone(),
                     "--trsvcid".into(), port.to_string()]
            }
            Request::VolumeCreate { array, volume, size } => {
                vec!["volume".into(), "create".into(),
                     "--volume-name".into(), volume.clone(),
                     "--array-name".into(), array.clone(),
                     "--size".into(), size.to_string()]
            }
            Request::VolumeInfo { array, volume } => {
                vec!["volume".into(), "info".into(),
                     "--volume-name".into(), volume.clone(),
                     "--array-name".into(), array.clone()]
            }
            Request::VolumeMount { array, volume, nqn } => {
                vec!["volume".into(), "mount".into(),
                     "--volume-name".into(), volume.clone(),
                     "--array-name".into(), array.clone(),
                     "--subnqn".into(), nqn.clone()]
            }
        };
        args.push("--json-res".into());
        args
    }

    /// `argv` is the client program followed by any arguments that must
    /// precede every command.
    pub fn new<I, S>(argv: I) -> Result<Self>
        where I: IntoIterator<Item = S>,
              S: Into<OsString>
    {
        let argv = argv.into_iter().map(Into::into).collect::<Vec<_>>();
        if argv.is_empty() {
            return Err(Error::Config("empty gateway command".into()));
        }
        Ok(CliGateway { argv })
    }
}

impl Gateway for CliGateway {
    fn call(&self, req: &Request) -> Result<Response> {
        let output = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .args(Self::args(req))
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::Gateway(format!(
                "cannot run {}: {e}", self.argv[0].to_string_lossy())))?;
        let resp = parse_response(&output.stdout)?;
        debug!(request = req.label(), code = resp.code, "gateway response");
        Ok(resp)
    }
}

/// Parse the client's JSON reply, which looks like this:
///
/// ```text
/// {"Response": {"result": {"status": {"code": 0, "description": "..."},
///                          "data": {"situation": "NORMAL"}}}}
/// ```
pub fn parse_response(raw: &[u8]) -> Result<Response> {
    let v: serde_json::Value = serde_json::from_slice(raw)
        .map_err(|e| Error::Gateway(format!("unparseable response: {e}")))?;
    let result = &v["Response"]["result"];
    let code = result["status"]["code"]
        .as_i64()
        .and_then(|c| i32::try_from(c).ok())
        .ok_or_else(|| Error::Gateway("response has no status code".into()))?;
    let description = result["status"]["description"]
        .as_str()
        .unwrap_or_default()
        .to_owned();
    let data = &result["data"];
    let situation = data["situation"]
        .as_str()
        .or_else(|| data["state"].as_str())
        .map(str::to_owned);
    Ok(Response {
        code,
        description,
        situation,
        payload: String::from_utf8_lossy(raw).into_owned(),
    })
}
