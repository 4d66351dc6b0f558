//! Service-discovery seam. A [`TargetFinder`] maps pids to the label sets
//! ("targets") samples are attributed to; the session only ever asks, never
//! decides.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub const SERVICE_NAME_LABEL: &str = "service_name";

/// Labels attached to every sample of a discovered workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    labels: BTreeMap<String, String>,
    service_name: String,
}

impl Target {
    pub fn new(labels: BTreeMap<String, String>) -> Self {
        let service_name = labels
            .get(SERVICE_NAME_LABEL)
            .cloned()
            .unwrap_or_else(|| "unspecified".to_string());
        Self {
            labels,
            service_name,
        }
    }

    /// A target carrying only a service name.
    pub fn service(name: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(SERVICE_NAME_LABEL.to_string(), name.to_string());
        Self::new(labels)
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (key, value)) in self.labels.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        write!(f, "}}")
    }
}

/// Options handed to the finder on a discovery refresh. The session forwards
/// these opaquely from [`crate::session::Session::update_targets`].
#[derive(Debug, Clone, Default)]
pub struct TargetsOptions {
    /// Label sets for every discovered workload.
    pub targets: Vec<BTreeMap<String, String>>,
    /// Only profile pids that resolve to one of `targets`.
    pub targets_only: bool,
    /// Fallback target for pids no workload claims, when `targets_only` is
    /// unset.
    pub default_target: Option<Target>,
}

/// Must be safe to call concurrently with every session operation; the
/// session never holds its state lock across `update`.
pub trait TargetFinder: Send + Sync {
    fn find_target(&self, pid: u32) -> Option<Arc<Target>>;

    fn update(&self, options: &TargetsOptions);

    fn remove_dead_pid(&self, pid: u32);
}

/// Finder that attributes every pid to one fixed target. Suits stand-alone
/// tools that profile the whole host under a single service name.
pub struct StaticTargetFinder {
    target: Arc<Target>,
}

impl StaticTargetFinder {
    pub fn new(target: Target) -> Self {
        Self {
            target: Arc::new(target),
        }
    }
}

impl TargetFinder for StaticTargetFinder {
    fn find_target(&self, _pid: u32) -> Option<Arc<Target>> {
        Some(Arc::clone(&self.target))
    }

    fn update(&self, _options: &TargetsOptions) {}

    fn remove_dead_pid(&self, _pid: u32) {}
}
