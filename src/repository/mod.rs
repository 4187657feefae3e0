//! Service and instance declarations, and the repository interface
//!
//! The supervisor core never reads declaration files itself; it consumes a
//! [`Repository`] handle. [`MemRepository`] is the in-memory implementation
//! used both by tests and by the daemon after loading declaration files
//! from disk.

mod parser;

pub use parser::{parse_service_decl, ParseError};

use std::collections::HashMap;
use std::path::Path;

use crate::note::RestartOn;
use crate::path::SvcPath;

/// Determines how a unit's Start method is judged ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitType {
    /// Online as soon as the start process is running.
    #[default]
    Simple,
    /// Like simple; the start process is expected to exit.
    Oneshot,
    /// The start process forks; online when the daemonized PID emerges.
    Forks,
    /// A grouping of processes; main-PID exit alone does not stop it.
    Group,
    /// Online on a readiness notification from the child.
    Notify,
}

impl UnitType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "simple" => Some(Self::Simple),
            "oneshot" => Some(Self::Oneshot),
            "forks" => Some(Self::Forks),
            "group" => Some(Self::Group),
            "notify" => Some(Self::Notify),
            _ => None,
        }
    }
}

/// Method slots a unit may declare. Each slot has its own failure counter
/// in the unit state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    PreStart,
    Start,
    PostStart,
    Stop,
    PostStop,
}

impl MethodKind {
    pub const ALL: [MethodKind; 5] = [
        MethodKind::PreStart,
        MethodKind::Start,
        MethodKind::PostStart,
        MethodKind::Stop,
        MethodKind::PostStop,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::PreStart => 0,
            Self::Start => 1,
            Self::PostStart => 2,
            Self::Stop => 3,
            Self::PostStop => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreStart => "prestart",
            Self::Start => "start",
            Self::PostStart => "poststart",
            Self::Stop => "stop",
            Self::PostStop => "poststop",
        }
    }
}

/// Semantics of a dependency group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupKind {
    /// Every target must be satisfied.
    #[default]
    RequireAll,
    /// At least one target must be satisfied (empty set is satisfied).
    RequireAny,
    /// Targets that can run should run, but definitive failure is fine.
    OptionalAll,
    /// No target may be up.
    ExcludeAll,
}

impl GroupKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "require-all" => Some(Self::RequireAll),
            "require-any" => Some(Self::RequireAny),
            "optional-all" => Some(Self::OptionalAll),
            "exclude-all" => Some(Self::ExcludeAll),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequireAll => "require-all",
            Self::RequireAny => "require-any",
            Self::OptionalAll => "optional-all",
            Self::ExcludeAll => "exclude-all",
        }
    }
}

/// One declared dependency group: a set of target paths with group
/// semantics and a restart-on intensity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepGroupDecl {
    pub kind: GroupKind,
    pub restart_on: RestartOn,
    pub targets: Vec<SvcPath>,
}

/// A runnable instance of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDecl {
    pub path: SvcPath,
    pub unit_type: UnitType,
    pub methods: HashMap<MethodKind, String>,
    pub depgroups: Vec<DepGroupDecl>,
}

impl InstanceDecl {
    pub fn new(path: SvcPath) -> Self {
        Self {
            path,
            unit_type: UnitType::default(),
            methods: HashMap::new(),
            depgroups: Vec::new(),
        }
    }
}

/// A service: a named collection of instances plus service-level
/// dependency groups inherited by every instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDecl {
    pub path: SvcPath,
    pub instances: Vec<InstanceDecl>,
    pub depgroups: Vec<DepGroupDecl>,
}

impl ServiceDecl {
    pub fn new(path: SvcPath) -> Self {
        Self {
            path,
            instances: Vec::new(),
            depgroups: Vec::new(),
        }
    }
}

/// Result of a path lookup.
#[derive(Debug, Clone)]
pub enum RepoObject {
    Service(ServiceDecl),
    Instance(InstanceDecl),
}

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("no such path: {0}")]
    NotFound(SvcPath),

    #[error("repository unavailable")]
    Unavailable,
}

/// The repository interface the core consumes. Lookup failures other than
/// [`RepoError::NotFound`] put the manager into its back-off retry loop.
pub trait Repository {
    /// Resolve a service or instance path to its declaration.
    fn lookup_path(&self, path: &SvcPath) -> Result<RepoObject, RepoError>;

    /// Every declared service.
    fn services(&self) -> Result<Vec<ServiceDecl>, RepoError>;
}

/// In-memory repository backing the daemon (populated from declaration
/// files) and the test suites.
#[derive(Debug, Default)]
pub struct MemRepository {
    services: Vec<ServiceDecl>,
}

impl MemRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a service declaration.
    pub fn insert(&mut self, decl: ServiceDecl) {
        if let Some(existing) = self.services.iter_mut().find(|s| s.path == decl.path) {
            *existing = decl;
        } else {
            self.services.push(decl);
        }
    }

    /// Load every `*.service` declaration file in a directory.
    pub fn load_dir(dir: &Path) -> Result<Self, ParseError> {
        let mut repo = Self::new();
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "service"))
            .collect();
        entries.sort();

        for path in entries {
            let content = std::fs::read_to_string(&path)?;
            match parse_service_decl(&content) {
                Ok(decl) => {
                    log::debug!("loaded {} from {}", decl.path, path.display());
                    repo.insert(decl);
                }
                Err(e) => {
                    log::error!("failed to parse {}: {}", path.display(), e);
                    return Err(e);
                }
            }
        }

        Ok(repo)
    }
}

impl Repository for MemRepository {
    fn lookup_path(&self, path: &SvcPath) -> Result<RepoObject, RepoError> {
        if path.is_instance() {
            for svc in &self.services {
                if let Some(inst) = svc.instances.iter().find(|i| &i.path == path) {
                    return Ok(RepoObject::Instance(inst.clone()));
                }
            }
        } else if let Some(svc) = self.services.iter().find(|s| &s.path == path) {
            return Ok(RepoObject::Service(svc.clone()));
        }
        Err(RepoError::NotFound(path.clone()))
    }

    fn services(&self) -> Result<Vec<ServiceDecl>, RepoError> {
        Ok(self.services.clone())
    }
}
