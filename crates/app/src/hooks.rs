use std::fmt;

use tracing::debug;

use crate::lockdown::{ExtensionLoader, LockdownSwitch};
use crate::resolver::HostResolver;

/// Priority that runs after every other registration on a hook point.
pub const LOWEST_PRIORITY: i32 = i32::MAX;
pub const DEFAULT_PRIORITY: i32 = 10;

/// Host framework readiness points callbacks can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    MultisiteReady,
    PostReady,
}

impl HookPoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MultisiteReady => "multisite_ready",
            Self::PostReady => "post_ready",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request-path adjustments loaded late in startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatShim {
    /// Take the request host from `X-Forwarded-Host` before `Host`.
    ForwardedHost,
}

type Callback = Box<dyn FnOnce(&mut RuntimeBuilder) + Send>;

struct Registration {
    point: HookPoint,
    priority: i32,
    sequence: usize,
    name: &'static str,
    callback: Callback,
}

#[derive(Default)]
pub struct HookRegistry {
    registrations: Vec<Registration>,
    sequence: usize,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, point: HookPoint, priority: i32, name: &'static str, callback: F)
    where
        F: FnOnce(&mut RuntimeBuilder) + Send + 'static,
    {
        self.registrations.push(Registration {
            point,
            priority,
            sequence: self.sequence,
            name,
            callback: Box::new(callback),
        });
        self.sequence += 1;
    }

    pub fn registered(&self, point: HookPoint) -> usize {
        self.registrations.iter().filter(|r| r.point == point).count()
    }

    /// Runs and consumes the callbacks of `point`, lowest priority value first,
    /// ties in registration order.
    pub fn fire(&mut self, point: HookPoint, builder: &mut RuntimeBuilder) {
        let (mut due, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.registrations)
            .into_iter()
            .partition(|r| r.point == point);
        self.registrations = rest;
        due.sort_by_key(|r| (r.priority, r.sequence));

        for registration in due {
            debug!(stage = "bootstrap", hook = %point, name = registration.name, priority = registration.priority, "running hook");
            (registration.callback)(builder);
            builder.hooks_run.push(registration.name);
        }
    }
}

/// Collects what hook callbacks wire in before the router is built.
pub struct RuntimeBuilder {
    resolver: Option<HostResolver>,
    lockdown: Option<LockdownSwitch>,
    shims: Vec<CompatShim>,
    extensions: ExtensionLoader,
    hooks_run: Vec<&'static str>,
}

impl RuntimeBuilder {
    pub fn new(extensions: ExtensionLoader) -> Self {
        Self {
            resolver: None,
            lockdown: None,
            shims: Vec::new(),
            extensions,
            hooks_run: Vec::new(),
        }
    }

    pub fn install_resolver(&mut self, resolver: HostResolver) {
        self.resolver = Some(resolver);
    }

    pub fn install_lockdown(&mut self, lockdown: LockdownSwitch) {
        self.extensions = self.extensions.clone().with_lockdown(lockdown.clone());
        self.lockdown = Some(lockdown);
    }

    pub fn add_shim(&mut self, shim: CompatShim) {
        if !self.shims.contains(&shim) {
            self.shims.push(shim);
        }
    }

    pub fn build(self) -> Runtime {
        Runtime {
            resolver: self.resolver,
            lockdown: self.lockdown,
            shims: self.shims,
            extensions: self.extensions,
            hooks_run: self.hooks_run,
        }
    }
}

/// Request-time collaborators assembled during bootstrap.
#[derive(Clone)]
pub struct Runtime {
    pub resolver: Option<HostResolver>,
    pub lockdown: Option<LockdownSwitch>,
    pub shims: Vec<CompatShim>,
    pub extensions: ExtensionLoader,
    /// Names of the hook callbacks that ran, in firing order.
    pub hooks_run: Vec<&'static str>,
}

impl Runtime {
    pub fn has_shim(&self, shim: CompatShim) -> bool {
        self.shims.contains(&shim)
    }
}
