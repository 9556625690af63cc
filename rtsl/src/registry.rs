//! Hook registration.
//!
//! A [`HookRegistry`] is whatever delivers events: it resolves a hook by
//! name and attaches or detaches our callback to it. [`HookSet`] registers
//! the whole hook table as a unit: if any hook cannot be resolved or
//! registered, everything registered so far in the batch is rolled back.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::error::{Result, RtslError};
use crate::hooks::{HookKind, HookSpec};

pub trait HookRegistry: Send {
    /// Resolved identity of a hook.
    type Handle: Clone + Send;

    fn resolve(&self, hook: &HookSpec) -> Option<Self::Handle>;
    fn register(&mut self, hook: &HookSpec, handle: &Self::Handle) -> Result<()>;
    fn unregister(&mut self, hook: &HookSpec, handle: &Self::Handle);
}

struct Entry<H> {
    spec: HookSpec,
    handle: Option<H>,
    registered: bool,
}

pub struct HookSet<R: HookRegistry> {
    registry: R,
    entries: Vec<Entry<R::Handle>>,
}

impl<R: HookRegistry> HookSet<R> {
    pub fn new(registry: R, table: Vec<HookSpec>) -> Self {
        let entries = table
            .into_iter()
            .map(|spec| Entry {
                spec,
                handle: None,
                registered: false,
            })
            .collect();
        Self { registry, entries }
    }

    /// Register every hook, or none of them.
    pub fn register_all(&mut self) -> Result<()> {
        for i in 0..self.entries.len() {
            if let Err(e) = self.register_one(i) {
                warn!("Hook registration failed, rolling back: {}", e);
                self.unregister_all();
                return Err(e);
            }
        }
        info!("Registered {} hooks", self.entries.len());
        Ok(())
    }

    fn register_one(&mut self, i: usize) -> Result<()> {
        let entry = &mut self.entries[i];
        if entry.registered {
            return Ok(());
        }

        let handle = self.registry.resolve(&entry.spec).ok_or_else(|| {
            RtslError::InvalidConfiguration(format!(
                "hook {}:{} not found",
                entry.spec.category, entry.spec.name
            ))
        })?;

        self.registry
            .register(&entry.spec, &handle)
            .map_err(|e| {
                RtslError::InvalidConfiguration(format!(
                    "cannot register hook {}: {}",
                    entry.spec.name, e
                ))
            })?;

        debug!("Registered hook {}:{}", entry.spec.category, entry.spec.name);
        entry.handle = Some(handle);
        entry.registered = true;
        Ok(())
    }

    pub fn unregister_all(&mut self) {
        for entry in self.entries.iter_mut() {
            if !entry.registered {
                continue;
            }
            if let Some(handle) = entry.handle.take() {
                self.registry.unregister(&entry.spec, &handle);
            }
            entry.registered = false;
        }
    }

    pub fn registered_count(&self) -> usize {
        self.entries.iter().filter(|e| e.registered).count()
    }

    /// Registration state of each hook, in table order.
    pub fn registered_flags(&self) -> impl Iterator<Item = bool> + '_ {
        self.entries.iter().map(|e| e.registered)
    }

    /// Which handler kinds have at least one registered hook.
    pub fn armed_kinds(&self) -> [bool; HookKind::COUNT] {
        let mut armed = [false; HookKind::COUNT];
        for entry in self.entries.iter().filter(|e| e.registered) {
            armed[entry.spec.kind.index()] = true;
        }
        armed
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }
}

/// In-process registry for replayed traces: any hook in the table resolves,
/// and registration is only bookkeeping.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    missing: HashSet<String>,
    refusing: HashSet<String>,
    registered: HashSet<String>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend the named hook does not exist.
    pub fn without(mut self, name: &str) -> Self {
        self.missing.insert(name.to_string());
        self
    }

    /// Resolve the named hook but refuse to register it.
    pub fn refusing(mut self, name: &str) -> Self {
        self.refusing.insert(name.to_string());
        self
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registered.contains(name)
    }

    pub fn registered_len(&self) -> usize {
        self.registered.len()
    }
}

impl HookRegistry for MemoryRegistry {
    type Handle = &'static str;

    fn resolve(&self, hook: &HookSpec) -> Option<Self::Handle> {
        (!self.missing.contains(hook.name)).then_some(hook.name)
    }

    fn register(&mut self, hook: &HookSpec, handle: &Self::Handle) -> Result<()> {
        if self.refusing.contains(hook.name) {
            return Err(RtslError::InvalidConfiguration(format!(
                "{} refused",
                handle
            )));
        }
        self.registered.insert(handle.to_string());
        Ok(())
    }

    fn unregister(&mut self, _hook: &HookSpec, handle: &Self::Handle) {
        self.registered.remove(*handle);
    }
}

const TRACEFS_MOUNT_POINTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

/// Live registry backed by tracefs: a hook exists if its event directory
/// exists, and is registered by enabling the event.
#[derive(Debug, Clone)]
pub struct TracefsRegistry {
    root: PathBuf,
}

impl TracefsRegistry {
    /// Find a mounted tracefs.
    pub fn discover() -> Option<Self> {
        TRACEFS_MOUNT_POINTS
            .iter()
            .map(Path::new)
            .find(|base| base.join("events").is_dir())
            .map(Self::with_root)
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn trace_pipe(&self) -> PathBuf {
        self.root.join("trace_pipe")
    }
}

impl HookRegistry for TracefsRegistry {
    type Handle = PathBuf;

    fn resolve(&self, hook: &HookSpec) -> Option<Self::Handle> {
        let dir = self
            .root
            .join("events")
            .join(hook.category)
            .join(hook.name);
        dir.exists().then_some(dir)
    }

    fn register(&mut self, hook: &HookSpec, handle: &Self::Handle) -> Result<()> {
        std::fs::write(handle.join("enable"), "1")?;
        debug!("Enabled tracefs event {}:{}", hook.category, hook.name);
        Ok(())
    }

    fn unregister(&mut self, hook: &HookSpec, handle: &Self::Handle) {
        if let Err(e) = std::fs::write(handle.join("enable"), "0") {
            warn!(
                "Failed to disable tracefs event {}:{}: {}",
                hook.category, hook.name, e
            );
        }
    }
}
