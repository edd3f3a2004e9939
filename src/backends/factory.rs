use std::fmt;

use log::{debug, info, warn};

use crate::backends::reference::{reference_capabilities, ReferenceCore};
use crate::backends::{BackendFlags, BackendKind, BackendRequest, LikelihoodCore};
use crate::Result;

/// Probe that builds a core for a request, or declines with `None`.
pub type Loader = Box<dyn Fn(&BackendRequest) -> Option<Box<dyn LikelihoodCore>> + Send + Sync>;

struct RegistryEntry {
    kind: BackendKind,
    name: String,
    capabilities: BackendFlags,
    loader: Loader,
}

/// Ordered collection of core loaders. The first loader that accepts a
/// request wins; the reference core is the mandatory last resort.
pub struct BackendRegistry {
    entries: Vec<RegistryEntry>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (&e.name, e.kind)))
            .finish()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn reference_loader() -> Loader {
    Box::new(|request: &BackendRequest| {
        ReferenceCore::new(request)
            .ok()
            .map(|core| Box::new(core) as Box<dyn LikelihoodCore>)
    })
}

impl BackendRegistry {
    /// Registry holding only the reference core.
    pub fn new() -> Self {
        let mut registry = BackendRegistry {
            entries: Vec::new(),
        };
        registry.register(
            BackendKind::Reference,
            super::reference::REFERENCE_NAME,
            reference_capabilities(),
            reference_loader(),
        );
        registry
    }

    /// Registry with every core compiled into the crate.
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "parallel")]
        {
            use crate::backends::threaded::{threaded_capabilities, ThreadedCore, THREADED_NAME};
            registry.register(
                BackendKind::Native,
                THREADED_NAME,
                threaded_capabilities(),
                Box::new(|request: &BackendRequest| {
                    if request.threads <= 1 {
                        return None;
                    }
                    ThreadedCore::new(request)
                        .ok()
                        .map(|core| Box::new(core) as Box<dyn LikelihoodCore>)
                }),
            );
        }
        registry
    }

    /// Adds a loader. Loaders of the same kind are tried in registration
    /// order.
    pub fn register(
        &mut self,
        kind: BackendKind,
        name: &str,
        capabilities: BackendFlags,
        loader: Loader,
    ) -> &mut Self {
        self.entries.push(RegistryEntry {
            kind,
            name: name.to_string(),
            capabilities,
            loader,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of the registered loaders in the order they would be probed.
    pub fn probe_order<'a>(&'a self, resource_order: &'a [BackendKind]) -> Vec<&'a str> {
        self.ordered(resource_order)
            .map(|entry| entry.name.as_str())
            .collect()
    }

    fn ordered<'a>(
        &'a self,
        resource_order: &'a [BackendKind],
    ) -> impl Iterator<Item = &'a RegistryEntry> + 'a {
        let order: &[BackendKind] = if resource_order.is_empty() {
            &BackendKind::DEFAULT_ORDER
        } else {
            resource_order
        };
        order
            .iter()
            .flat_map(move |kind| self.entries.iter().filter(move |e| e.kind == *kind))
    }

    /// Builds a core for the request. Loaders whose capabilities miss a
    /// required flag are skipped without being called. Falls back to the
    /// reference core when no loader accepts the request.
    pub fn create(
        &self,
        request: &BackendRequest,
        resource_order: &[BackendKind],
    ) -> Result<Box<dyn LikelihoodCore>> {
        for entry in self.ordered(resource_order) {
            if !entry.capabilities.contains(request.required_flags) {
                debug!(
                    "Skipping backend {}, it lacks required flags {:?}.",
                    entry.name,
                    request.required_flags - entry.capabilities
                );
                continue;
            }
            if let Some(core) = (entry.loader)(request) {
                info!("Using likelihood backend {}.", core.details());
                return Ok(core);
            }
            debug!("Backend {} declined the request.", entry.name);
        }
        warn!(
            "No backend satisfied flags {:?} in order {:?}, falling back to the reference core.",
            request.required_flags, resource_order
        );
        let core = ReferenceCore::new(request)?;
        info!("Using likelihood backend {}.", core.details);
        Ok(Box::new(core))
    }
}
