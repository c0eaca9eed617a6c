//! Resource capabilities granted to a stage for one execution.
//!
//! A [`Capability`] names a resource kind, a resource identifier pattern and
//! the actions allowed on matching resources. Patterns are either exact or end
//! in a single `*`, which matches any suffix. A [`CapabilitySet`] is what the
//! scoper hands to an invoker and what the resource wrappers consult before
//! every access.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{Error, Result};

/// Kind of external resource a capability applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Objects in the media store, identified as `{bucket}/{key}`.
    ObjectStore,
    /// A named secret in the vault.
    Secret,
    /// A hosted text-generation model endpoint.
    InferenceModel,
    /// A speech-synthesis endpoint.
    SpeechSynthesis,
    /// The video publishing platform.
    VideoPlatform,
    /// A container task definition on the compute cluster.
    ContainerTask,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::ObjectStore => "object_store",
            ResourceKind::Secret => "secret",
            ResourceKind::InferenceModel => "inference_model",
            ResourceKind::SpeechSynthesis => "speech_synthesis",
            ResourceKind::VideoPlatform => "video_platform",
            ResourceKind::ContainerTask => "container_task",
        };
        f.write_str(s)
    }
}

/// An action on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Write,
    Invoke,
    Run,
    Stop,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Invoke => "invoke",
            Action::Run => "run",
            Action::Stop => "stop",
        };
        f.write_str(s)
    }
}

/// A single resource-scoped grant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Capability {
    pub kind: ResourceKind,
    pub pattern: String,
    pub actions: BTreeSet<Action>,
}

impl Capability {
    pub fn new(
        kind: ResourceKind,
        pattern: impl Into<String>,
        actions: impl IntoIterator<Item = Action>,
    ) -> Self {
        Self {
            kind,
            pattern: pattern.into(),
            actions: actions.into_iter().collect(),
        }
    }

    /// Whether `resource` (of the given kind) falls under this capability's
    /// pattern.
    pub fn matches(&self, kind: ResourceKind, resource: &str) -> bool {
        if kind != self.kind {
            return false;
        }
        match self.pattern.strip_suffix('*') {
            Some(prefix) => resource.starts_with(prefix),
            None => resource == self.pattern,
        }
    }

    /// Whether this capability allows `action` on `resource`.
    pub fn allows(&self, kind: ResourceKind, resource: &str, action: Action) -> bool {
        self.actions.contains(&action) && self.matches(kind, resource)
    }

    /// The fixed part of the pattern (everything before a trailing `*`).
    pub fn fixed_prefix(&self) -> &str {
        self.pattern.strip_suffix('*').unwrap_or(&self.pattern)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let actions: Vec<String> = self.actions.iter().map(ToString::to_string).collect();
        write!(f, "{}:{} [{}]", self.kind, self.pattern, actions.join(","))
    }
}

/// The full set of grants held by one stage for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0.insert(capability);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether any capability in the set allows `action` on `resource`.
    pub fn permits(&self, kind: ResourceKind, resource: &str, action: Action) -> bool {
        self.0.iter().any(|c| c.allows(kind, resource, action))
    }

    /// Like [`permits`](Self::permits) but returns
    /// [`Error::CapabilityDenied`] on refusal.
    pub fn check(&self, kind: ResourceKind, resource: &str, action: Action) -> Result<()> {
        if self.permits(kind, resource, action) {
            Ok(())
        } else {
            Err(Error::denied(kind, resource, action))
        }
    }

    /// Resource kinds present in the set.
    pub fn kinds(&self) -> BTreeSet<ResourceKind> {
        self.0.iter().map(|c| c.kind).collect()
    }

    /// Pairs of capabilities from `self` and `other` whose patterns could
    /// match a common resource.
    pub fn overlapping<'a>(&'a self, other: &'a CapabilitySet) -> Vec<(&'a Capability, &'a Capability)> {
        let mut out = Vec::new();
        for a in &self.0 {
            for b in &other.0 {
                if a.kind == b.kind && patterns_overlap(a, b) {
                    out.push((a, b));
                }
            }
        }
        out
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a CapabilitySet {
    type Item = &'a Capability;
    type IntoIter = std::collections::btree_set::Iter<'a, Capability>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

fn patterns_overlap(a: &Capability, b: &Capability) -> bool {
    let a_wild = a.pattern.ends_with('*');
    let b_wild = b.pattern.ends_with('*');
    match (a_wild, b_wild) {
        (false, false) => a.pattern == b.pattern,
        (true, false) => b.pattern.starts_with(a.fixed_prefix()),
        (false, true) => a.pattern.starts_with(b.fixed_prefix()),
        (true, true) => {
            let (pa, pb) = (a.fixed_prefix(), b.fixed_prefix());
            pa.starts_with(pb) || pb.starts_with(pa)
        }
    }
}
