//! Canonical naming of services, instances, and dependency groups
//!
//! A path names either a service (`db`) or one of its instances (`db:main`).
//! Dependency-group vertices get synthesized paths derived from their
//! owner's path by appending `#depgroups/<index>` to the final component.

use std::fmt;

/// Stable identifier for a vertex in the dependency graph.
///
/// Value-equal by component; usable as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SvcPath {
    svc: String,
    inst: Option<String>,
}

impl SvcPath {
    /// Path of a service root.
    pub fn service(svc: impl Into<String>) -> Self {
        Self {
            svc: svc.into(),
            inst: None,
        }
    }

    /// Path of an instance of a service.
    pub fn instance(svc: impl Into<String>, inst: impl Into<String>) -> Self {
        Self {
            svc: svc.into(),
            inst: Some(inst.into()),
        }
    }

    /// The path of the service repository's own instance. The manager
    /// watches for this instance coming online to know the repository
    /// is answering again.
    pub fn repository() -> Self {
        Self::instance("system/repository", "default")
    }

    pub fn svc_name(&self) -> &str {
        &self.svc
    }

    pub fn inst_name(&self) -> Option<&str> {
        self.inst.as_deref()
    }

    /// True for instance paths (`svc:inst`), false for service paths.
    pub fn is_instance(&self) -> bool {
        self.inst.is_some()
    }

    /// The owning service's path, if this is an instance path.
    pub fn parent(&self) -> Option<SvcPath> {
        self.inst.as_ref().map(|_| SvcPath::service(&self.svc))
    }

    /// Synthesize the path of this vertex's dependency group at `index`.
    ///
    /// The marker is appended to the final component, so `db:main` yields
    /// `db:main#depgroups/0` and `db` yields `db#depgroups/0`.
    pub fn depgroup(&self, index: usize) -> SvcPath {
        let mut p = self.clone();
        match &mut p.inst {
            Some(inst) => *inst = format!("{}#depgroups/{}", inst, index),
            None => p.svc = format!("{}#depgroups/{}", p.svc, index),
        }
        p
    }

    /// Parse `svc` or `svc:inst`.
    pub fn parse(s: &str) -> Result<Self, PathError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PathError::Empty);
        }
        match s.split_once(':') {
            None => Ok(Self::service(s)),
            Some((svc, inst)) => {
                if svc.is_empty() || inst.is_empty() || inst.contains(':') {
                    Err(PathError::Malformed(s.to_string()))
                } else {
                    Ok(Self::instance(svc, inst))
                }
            }
        }
    }
}

impl fmt::Display for SvcPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inst {
            Some(inst) => write!(f, "{}:{}", self.svc, inst),
            None => write!(f, "{}", self.svc),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PathError {
    #[error("empty path")]
    Empty,

    #[error("malformed path: {0}")]
    Malformed(String),
}
