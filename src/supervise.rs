use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use crate::alert::{AlertChannel, SyslogScope};
use crate::error::{BackupkitError, ChildStatus, Result, TunnelError};
use crate::exit::ExitCallbacks;
use crate::types::{ExitCodes, OnError, RunMode, Slot};
use crate::util::command::maybe_print_command;

const KILL_CHILD_ACTION: &str = "kill_child";
const TERM_GRACE: Duration = Duration::from_secs(5);
const CONNECT_PROBE: Duration = Duration::from_millis(500);

type Children = Arc<Mutex<HashMap<String, Child>>>;

fn lock_children(children: &Children) -> MutexGuard<'_, HashMap<String, Child>> {
    children.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ended {
    Already(ChildStatus),
    Stopped(Option<ChildStatus>),
}

fn terminate(child: &mut Child) -> io::Result<Ended> {
    if let Some(status) = child.try_wait()? {
        return Ok(Ended::Already(status.into()));
    }
    let pid = Pid::from_raw(child.id() as i32);
    if let Err(err) = kill(pid, Signal::SIGTERM) {
        debug!(pid = child.id(), "SIGTERM failed: {}", err);
    }
    if let Some(status) = child.wait_timeout(TERM_GRACE)? {
        return Ok(Ended::Stopped(Some(status.into())));
    }
    warn!(pid = child.id(), "child ignored SIGTERM; sending SIGKILL");
    child.kill()?;
    child.wait()?;
    Ok(Ended::Stopped(None))
}

pub struct TunnelSpec {
    pub label: String,
    pub slot: Slot,
    pub command: Command,
    pub local_port: u16,
    pub timeout_seconds: u64,
    pub on_error: OnError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHandle {
    pid: Option<u32>,
    label: String,
    slot: Slot,
    local_port: u16,
}

impl TunnelHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn is_open(&self) -> bool {
        self.pid.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommandHandle {
    pid: Option<u32>,
    label: String,
    slot: Slot,
}

impl RemoteCommandHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }
}

#[derive(Clone)]
pub struct Supervisor {
    callbacks: ExitCallbacks,
    alerts: AlertChannel,
    exit_codes: ExitCodes,
    run_mode: RunMode,
    children: Children,
    poll_interval: Duration,
}

impl Supervisor {
    pub fn new(
        callbacks: ExitCallbacks,
        alerts: AlertChannel,
        exit_codes: ExitCodes,
        run_mode: RunMode,
    ) -> Self {
        let children: Children = Arc::new(Mutex::new(HashMap::new()));
        let tracked = children.clone();
        callbacks.define(KILL_CHILD_ACTION, move |args| {
            let (Some(slot), Some(pid)) = (args.first(), args.get(1)) else {
                return Err(BackupkitError::message(
                    "kill_child needs a slot and a pid",
                ));
            };
            let child = {
                let mut children = lock_children(&tracked);
                match children.get(slot) {
                    Some(child) if child.id().to_string() == *pid => children.remove(slot),
                    _ => None,
                }
            };
            if let Some(mut child) = child {
                debug!(slot = %slot, pid = %pid, "terminating child at exit");
                terminate(&mut child)?;
            }
            Ok(())
        });
        Self {
            callbacks,
            alerts,
            exit_codes,
            run_mode,
            children,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn spawn_tracked(&self, slot: &Slot, command: &mut Command) -> io::Result<u32> {
        let mut children = lock_children(&self.children);
        if children.contains_key(slot.as_str()) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("slot {} already has a running child", slot),
            ));
        }
        let child = command.stdin(Stdio::null()).spawn()?;
        let pid = child.id();
        children.insert(slot.to_string(), child);
        drop(children);
        self.callbacks
            .register(KILL_CHILD_ACTION, &[slot.to_string(), pid.to_string()]);
        Ok(pid)
    }

    fn release(&self, slot: &Slot, pid: u32) -> io::Result<Option<Ended>> {
        self.callbacks
            .unregister(KILL_CHILD_ACTION, &[slot.to_string(), pid.to_string()]);
        let child = {
            let mut children = lock_children(&self.children);
            match children.get(slot.as_str()) {
                Some(child) if child.id() == pid => children.remove(slot.as_str()),
                _ => None,
            }
        };
        match child {
            Some(mut child) => terminate(&mut child).map(Some),
            None => Ok(None),
        }
    }

    fn exited(&self, slot: &Slot) -> io::Result<Option<ChildStatus>> {
        let mut children = lock_children(&self.children);
        match children.get_mut(slot.as_str()) {
            Some(child) => Ok(child.try_wait()?.map(ChildStatus::from)),
            None => Ok(Some(ChildStatus::Code(1))),
        }
    }

    /// Start a tunnel and wait until its local port accepts connections.
    /// A failure is alerted; with `OnError::Exit` it does not return.
    pub fn open_tunnel(
        &self,
        mut spec: TunnelSpec,
    ) -> std::result::Result<TunnelHandle, TunnelError> {
        let mut handle = TunnelHandle {
            pid: None,
            label: spec.label.clone(),
            slot: spec.slot.clone(),
            local_port: spec.local_port,
        };
        maybe_print_command(&spec.command, self.run_mode);
        if self.run_mode.dry_run {
            return Ok(handle);
        }

        let pid = match self.spawn_tracked(&spec.slot, &mut spec.command) {
            Ok(pid) => pid,
            Err(source) => {
                return self.tunnel_failed(
                    TunnelError::Spawn {
                        label: spec.label,
                        source,
                    },
                    spec.on_error,
                );
            }
        };
        handle.pid = Some(pid);
        debug!(label = %spec.label, pid, "tunnel started");

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, spec.local_port));
        let timeout = Duration::from_secs(spec.timeout_seconds);
        let started = Instant::now();
        loop {
            if TcpStream::connect_timeout(&addr, CONNECT_PROBE).is_ok() {
                self.alerts.log_status(
                    &format!("{} established on port {}", spec.label, spec.local_port),
                    SyslogScope::AllOnly,
                );
                return Ok(handle);
            }
            let exited = self.exited(&spec.slot).unwrap_or_else(|err| {
                warn!(label = %spec.label, "could not poll tunnel: {}", err);
                None
            });
            if let Some(status) = exited {
                if let Err(err) = self.release(&spec.slot, pid) {
                    warn!(label = %spec.label, "could not reap tunnel: {}", err);
                }
                return self.tunnel_failed(
                    TunnelError::Exited {
                        label: spec.label,
                        status,
                    },
                    spec.on_error,
                );
            }
            if started.elapsed() >= timeout {
                if let Err(err) = self.release(&spec.slot, pid) {
                    warn!(label = %spec.label, "could not stop tunnel: {}", err);
                }
                return self.tunnel_failed(
                    TunnelError::TimedOut {
                        label: spec.label,
                        seconds: spec.timeout_seconds,
                    },
                    spec.on_error,
                );
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn tunnel_failed(
        &self,
        err: TunnelError,
        on_error: OnError,
    ) -> std::result::Result<TunnelHandle, TunnelError> {
        let context = match on_error {
            OnError::Exit => "The run was aborted.",
            OnError::AbortPhase => "The phase using this tunnel was skipped.",
        };
        self.alerts.send_alert(&err.to_string(), context, true);
        match on_error {
            OnError::Exit => self
                .callbacks
                .controlled_exit(self.exit_codes.ssh_tunnel_error),
            OnError::AbortPhase => Err(err),
        }
    }

    pub fn close_tunnel(&self, handle: &mut TunnelHandle) {
        let Some(pid) = handle.pid.take() else {
            info!(label = %handle.label, "{} already closed", handle.label);
            return;
        };
        let message = match self.release(&handle.slot, pid) {
            Ok(Some(Ended::Already(status))) => {
                format!("{} already closed ({})", handle.label, status)
            }
            Ok(_) => format!("{} closed", handle.label),
            Err(err) => {
                warn!(label = %handle.label, "could not stop tunnel: {}", err);
                format!("{} closed", handle.label)
            }
        };
        self.alerts.log_status(&message, SyslogScope::AllOnly);
    }

    pub fn run_remote_background(
        &self,
        label: &str,
        slot: Slot,
        mut command: Command,
    ) -> Result<RemoteCommandHandle> {
        let mut handle = RemoteCommandHandle {
            pid: None,
            label: label.to_string(),
            slot,
        };
        maybe_print_command(&command, self.run_mode);
        if self.run_mode.dry_run {
            return Ok(handle);
        }
        let pid = self
            .spawn_tracked(&handle.slot, &mut command)
            .map_err(|e| BackupkitError::message(format!("could not start {}: {}", label, e)))?;
        handle.pid = Some(pid);
        self.alerts.log_status(
            &format!("{} started in the background", label),
            SyslogScope::AllOnly,
        );
        Ok(handle)
    }

    pub fn kill_remote_background(&self, handle: &mut RemoteCommandHandle) {
        let Some(pid) = handle.pid.take() else {
            info!(label = %handle.label, "{} already stopped", handle.label);
            return;
        };
        match self.release(&handle.slot, pid) {
            Ok(Some(Ended::Already(status) | Ended::Stopped(Some(status)))) => {
                debug!(label = %handle.label, "{} ended with {}", handle.label, status)
            }
            Ok(_) => {}
            Err(err) => warn!(label = %handle.label, "could not stop background command: {}", err),
        }
        self.alerts.log_status(
            &format!("{} stopped", handle.label),
            SyslogScope::AllOnly,
        );
    }

    pub fn tracked(&self) -> usize {
        lock_children(&self.children).len()
    }
}
