// vim: tw=80
//! Lifecycle control of the storage service process

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use std::{
    ffi::OsString,
    fmt,
    process::{Child, Command, Stdio},
    sync::Mutex,
};
use tracing::{info, warn};

#[cfg(test)] use mockall::automock;

use crate::types::{Error, Result};

/// How to bring up the storage service
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Bringup {
    /// Start from a freshly initialized state
    Clean,
    /// Start without any clean-shutdown state, forcing the service through
    /// its crash-recovery path.
    Dirty,
}

impl fmt::Display for Bringup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bringup::Clean => "clean".fmt(f),
            Bringup::Dirty => "dirty".fmt(f),
        }
    }
}

#[cfg_attr(test, automock)]
pub trait ProcessControl: Send + Sync {
    /// Start the service.  Fails if it is already running.
    fn start(&self, mode: Bringup) -> Result<()>;

    /// Terminate the service abruptly, without giving it any chance to flush
    /// or to record a clean shutdown.  Fails if it isn't running.
    fn kill(&self) -> Result<()>;

    fn is_running(&self) -> bool;
}

/// A storage service running as a child process of the harness.
///
/// Like any good child, it is killed when its handle is dropped.
#[derive(Debug)]
pub struct ServiceProcess {
    argv:       Vec<OsString>,
    clean_args: Vec<OsString>,
    dirty_args: Vec<OsString>,
    child:      Mutex<Option<Child>>,
}

impl ServiceProcess {
    /// Extra arguments used only for a clean bringup
    pub fn clean_args<I, S>(mut self, args: I) -> Self
        where I: IntoIterator<Item = S>,
              S: Into<OsString>
    {
        self.clean_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Extra arguments used only for a dirty bringup
    pub fn dirty_args<I, S>(mut self, args: I) -> Self
        where I: IntoIterator<Item = S>,
              S: Into<OsString>
    {
        self.dirty_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// The pid of the running service, if any
    pub fn id(&self) -> Option<u32> {
        self.child.lock().unwrap().as_ref().map(Child::id)
    }

    /// `argv` is the service binary followed by its arguments.
    pub fn new<I, S>(argv: I) -> Result<Self>
        where I: IntoIterator<Item = S>,
              S: Into<OsString>
    {
        let argv = argv.into_iter().map(Into::into).collect::<Vec<_>>();
        if argv.is_empty() {
            return Err(Error::Config("empty service command".into()));
        }
        Ok(ServiceProcess {
            argv,
            clean_args: Vec::new(),
            dirty_args: Vec::new(),
            child: Mutex::new(None),
        })
    }

    fn sigkill(child: &mut Child) -> Result<()> {
        let pid = Pid::from_raw(child.id() as i32);
        kill(pid, Signal::SIGKILL)
            .map_err(|e| Error::Process(format!("kill {pid}: {e}")))?;
        let status = child.wait()?;
        info!(%pid, %status, "service killed");
        Ok(())
    }
}

impl ProcessControl for ServiceProcess {
    fn start(&self, mode: Bringup) -> Result<()> {
        let mut guard = self.child.lock().unwrap();
        if let Some(child) = guard.as_mut() {
            if child.try_wait()?.is_none() {
                return Err(Error::Process("service is already running".into()));
            }
        }
        let extra = match mode {
            Bringup::Clean => &self.clean_args,
            Bringup::Dirty => &self.dirty_args,
        };
        let child = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .args(extra)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| Error::Process(format!("cannot start {}: {e}",
                self.argv[0].to_string_lossy())))?;
        info!(pid = child.id(), %mode, "service started");
        *guard = Some(child);
        Ok(())
    }

    fn kill(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().unwrap().take() else {
            return Err(Error::Process("service is not running".into()));
        };
        if let Some(status) = child.try_wait()? {
            return Err(Error::Process(format!("service already exited: {status}")));
        }
        Self::sigkill(&mut child)
    }

    fn is_running(&self) -> bool {
        self.child.lock().unwrap()
            .as_mut()
            .map(|c| matches!(c.try_wait(), Ok(None)))
            .unwrap_or(false)
    }
}

impl Drop for ServiceProcess {
    fn drop(&mut self) {
        if let Ok(guard) = self.child.get_mut() {
            if let Some(mut child) = guard.take() {
                if let Ok(None) = child.try_wait() {
                    if let Err(e) = Self::sigkill(&mut child) {
                        warn!("failed to kill service: {e}");
                    }
                }
            }
        }
    }
}
