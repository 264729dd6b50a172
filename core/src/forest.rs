//! A workspace of documents that reference each other.
//!
//! A qualified name whose first segment names another open document
//! resolves from that document's root scope under its region's read lock.
//! Reads are snapshots: a document may observe another mid-convergence, so
//! every read records the region version it saw, and a document whose
//! recorded versions fall behind is re-triggered.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

use crate::config::PipelineConfig;
use crate::document::{Document, PipelineReport};
use crate::edit::TextEdit;
use crate::error::Error;
use crate::propagate::{ForeignRead, ForeignResolver};
use crate::symbols::{QualifiedName, Region};
use crate::traits::{Lookup, RendererCapability, Value};

/// Shared map from document name to region.
#[derive(Debug, Default)]
pub struct Registry {
    regions: RwLock<FxHashMap<String, Arc<Region>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, region: Arc<Region>) -> Result<(), Error> {
        let mut regions = self.regions.write().map_err(|_| Error::Poisoned)?;
        if regions.contains_key(region.name()) {
            return Err(Error::DocumentExists(region.name().to_owned()));
        }
        regions.insert(region.name().to_owned(), region);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Region>> {
        self.regions.write().ok()?.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Region>> {
        self.regions.read().ok()?.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Current version of `name`'s region, if it is registered.
    pub fn version(&self, name: &str) -> Option<u64> {
        self.get(name).map(|r| r.version())
    }

    /// True if any of `reads` saw an older version than the current one, or
    /// a region that has since been removed.
    pub fn is_stale(&self, reads: &[(String, u64)]) -> bool {
        reads
            .iter()
            .any(|(name, seen)| self.version(name) != Some(*seen))
    }
}

impl ForeignResolver for Registry {
    fn resolve(&self, from: &str, name: &QualifiedName) -> Option<ForeignRead> {
        let head = name.first()?;
        if head == from {
            return None;
        }
        let region = self.get(head)?;
        let table = region.read().ok()?;
        let version = region.version();
        let lookup = match table.root().map(|root| table.resolve(root, name)) {
            Some(Ok(binding)) => match &binding.value {
                Some(value) => Lookup::Value(value.clone()),
                None => Lookup::Unevaluated,
            },
            _ => Lookup::Missing,
        };
        log::trace!("`{from}` read `{name}` from `{head}` at version {version}");
        Some(ForeignRead {
            document: head.to_owned(),
            version,
            lookup,
        })
    }
}

/// Result of an edit made through a [`Forest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForestEdit {
    pub report: PipelineReport,
    /// Other documents re-triggered because they read the edited one, in
    /// the order they ran.
    pub retriggered: Vec<String>,
}

/// Documents keyed by name, sharing one [`Registry`].
#[derive(Debug)]
pub struct Forest<C> {
    caps: C,
    config: PipelineConfig,
    registry: Arc<Registry>,
    documents: BTreeMap<String, Document<C>>,
}

impl<C: RendererCapability + Clone> Forest<C> {
    pub fn new(caps: C, config: PipelineConfig) -> Self {
        Self {
            caps,
            config,
            registry: Arc::new(Registry::new()),
            documents: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn get(&self, name: &str) -> Option<&Document<C>> {
        self.documents.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.documents.keys().map(String::as_str)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Opens a document. Documents still waiting on names are re-run, since
    /// some of those names may point into the new one.
    pub fn open(
        &mut self,
        name: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<PipelineReport, Error> {
        let name = name.into();
        if self.documents.contains_key(&name) {
            return Err(Error::DocumentExists(name));
        }
        let (doc, report) = Document::open_with(
            name.clone(),
            text,
            self.caps.clone(),
            self.config,
            &*self.registry,
        )?;
        self.registry.insert(doc.region().clone())?;
        self.documents.insert(name.clone(), doc);

        for (other, doc) in self.documents.iter_mut() {
            if *other != name && doc.has_pending() {
                if let Err(err) = doc.settle(&*self.registry) {
                    log::debug!("settling `{other}` after opening `{name}`: {err}");
                }
            }
        }
        self.requeue(&name)?;
        Ok(report)
    }

    /// Edits one document, then re-triggers every document that read an
    /// older version of a changed region.
    pub fn edit(&mut self, name: &str, edit: TextEdit) -> Result<ForestEdit, Error> {
        let doc = self
            .documents
            .get_mut(name)
            .ok_or_else(|| Error::UnknownDocument(name.to_owned()))?;
        let report = doc.edit_with(edit, &*self.registry)?;
        let retriggered = self.requeue(name)?;
        Ok(ForestEdit {
            report,
            retriggered,
        })
    }

    /// Re-triggers stale readers until none are left or the round limit
    /// is hit. Returns the re-triggered documents in order.
    pub fn requeue(&mut self, origin: &str) -> Result<Vec<String>, Error> {
        let mut retriggered = Vec::new();
        for round in 0..self.config.max_requeue_rounds {
            let stale: Vec<String> = self
                .documents
                .iter()
                .filter(|(_, doc)| self.registry.is_stale(&doc.reference_set()))
                .map(|(name, _)| name.clone())
                .collect();
            if stale.is_empty() {
                return Ok(retriggered);
            }
            log::debug!("requeue round {round} after `{origin}`: {stale:?}");
            for name in stale {
                let Some(doc) = self.documents.get_mut(&name) else {
                    continue;
                };
                match doc.retrigger(&*self.registry) {
                    Err(crate::propagate::PropagateError::Pipeline(err)) => return Err(err),
                    Err(err) => log::debug!("re-triggering `{name}`: {err}"),
                    Ok(_) => {}
                }
                retriggered.push(name);
            }
        }
        log::warn!(
            "documents reading `{origin}` did not settle within {} rounds",
            self.config.max_requeue_rounds
        );
        Ok(retriggered)
    }

    /// Closes a document, tearing down its tree and scopes, and re-runs
    /// the documents that read from it.
    pub fn close(&mut self, name: &str) -> Result<(), Error> {
        let doc = self
            .documents
            .remove(name)
            .ok_or_else(|| Error::UnknownDocument(name.to_owned()))?;
        self.registry.remove(name);
        doc.close()?;
        self.requeue(name)?;
        Ok(())
    }

    /// Value of `name` in `document`, resolved from its root scope.
    pub fn value(&self, document: &str, name: &str) -> Option<Value> {
        self.documents.get(document)?.value(name)
    }
}
