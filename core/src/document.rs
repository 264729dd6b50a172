//! One document and its pipeline: edit, retokenize, diff, rebuild,
//! propagate.

use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::diff::{diff, ChangeSet};
use crate::edit::TextEdit;
use crate::error::{Diagnostic, Error};
use crate::propagate::{propagate, CancelToken, ForeignResolver, PropagateError, Propagation};
use crate::queue::TokenSequence;
use crate::render::RenderPass;
use crate::symbols::{QualifiedName, Region};
use crate::tokenizer::Tokenizer;
use crate::traits::{RendererCapability, Value};
use crate::tree::{rebuild, EvalState, RebuildReport, Tree};

/// Everything one pipeline run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub changes: ChangeSet,
    pub rebuilt: RebuildReport,
    pub propagation: Result<Propagation, PropagateError>,
    /// Malformed constructs in the current tokens, then duplicate
    /// definitions rejected by this run.
    pub diagnostics: Vec<Diagnostic>,
    /// Region version after the run.
    pub version: u64,
}

/// A document with its tokens, tree and symbol region.
#[derive(Debug)]
pub struct Document<C> {
    name: String,
    text: String,
    tokens: TokenSequence,
    tree: Tree,
    region: Arc<Region>,
    tokenizer: Tokenizer<C>,
    config: PipelineConfig,
    cancel: CancelToken,
}

impl<C: RendererCapability> Document<C> {
    /// Tokenizes, builds and propagates `text`.
    pub fn open(
        name: impl Into<String>,
        text: impl Into<String>,
        caps: C,
        config: PipelineConfig,
    ) -> Result<(Self, PipelineReport), Error> {
        Self::open_with(name, text, caps, config, &())
    }

    /// Like [`open`](Self::open), resolving names of other documents
    /// through `foreign`.
    pub fn open_with(
        name: impl Into<String>,
        text: impl Into<String>,
        caps: C,
        config: PipelineConfig,
        foreign: &dyn ForeignResolver,
    ) -> Result<(Self, PipelineReport), Error> {
        let name = name.into();
        let text = text.into();
        let tokenizer = Tokenizer::with_config(caps, config);
        let tokens = tokenizer.tokenize(text.as_bytes(), 0)?;
        tokens.validate()?;

        let region = Arc::new(Region::new(name.clone()));
        let changes = ChangeSet::initial(tokens.len());
        let (tree, rebuilt) = {
            let mut table = region.write()?;
            let mut tree = Tree::new(name.clone(), &mut table);
            let rebuilt = rebuild(&mut tree, &changes, &tokens, &mut table, &config)?;
            (tree, rebuilt)
        };

        let mut doc = Self {
            name,
            text,
            tokens,
            tree,
            region,
            tokenizer,
            config,
            cancel: CancelToken::new(),
        };
        let report = doc.finish(changes, rebuilt, foreign);
        log::debug!(
            "opened `{}`: {} tokens, {} nodes",
            doc.name,
            doc.tokens.len(),
            doc.tree.node_count()
        );
        Ok((doc, report))
    }

    /// Applies `edit` and runs the pipeline.
    pub fn edit(&mut self, edit: TextEdit) -> Result<PipelineReport, Error> {
        self.edit_with(edit, &())
    }

    /// Applies `edit`, resolving names of other documents through
    /// `foreign`.
    ///
    /// The buffer and tokens are only replaced once retokenizing succeeded,
    /// so a rejected edit leaves the document untouched.
    pub fn edit_with(
        &mut self,
        edit: TextEdit,
        foreign: &dyn ForeignResolver,
    ) -> Result<PipelineReport, Error> {
        self.cancel.reset();
        let (changes, rebuilt) = self.stage(&edit)?;
        Ok(self.finish(changes, rebuilt, foreign))
    }

    /// Applies several edits in order with a single propagation at the end.
    ///
    /// Stops at the first edit that fails; the ones before it stay applied
    /// and are propagated before the error is returned. The report carries
    /// the last edit's change set and the union of the rebuild reports.
    pub fn edit_batch(
        &mut self,
        edits: impl IntoIterator<Item = TextEdit>,
        foreign: &dyn ForeignResolver,
    ) -> Result<PipelineReport, Error> {
        // A cancel from here on, staging included, stops this run.
        self.cancel.reset();
        let mut changes = ChangeSet::new();
        let mut rebuilt = RebuildReport::default();
        let mut failed = None;
        for edit in edits {
            match self.stage(&edit) {
                Ok((set, report)) => {
                    changes = set;
                    rebuilt.created.extend(report.created);
                    rebuilt.removed.extend(report.removed);
                    rebuilt.updated.extend(report.updated);
                    rebuilt.relinked.extend(report.relinked);
                    rebuilt.duplicates.extend(report.duplicates);
                }
                Err(err) => {
                    failed = Some(err);
                    break;
                }
            }
        }
        let report = self.finish(changes, rebuilt, foreign);
        match failed {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Retokenizes, diffs and rebuilds for one edit.
    fn stage(&mut self, edit: &TextEdit) -> Result<(ChangeSet, RebuildReport), Error> {
        let mut text = self.text.clone();
        edit.apply(&mut text)?;
        let tokens = self.tokenizer.retokenize(&self.tokens, text.as_bytes(), edit)?;
        tokens.validate()?;

        let changes = diff(&self.tokens, &tokens, Some(edit));
        let rebuilt = {
            let mut table = self.region.write()?;
            rebuild(&mut self.tree, &changes, &tokens, &mut table, &self.config)?
        };
        self.text = text;
        self.tokens = tokens;
        Ok((changes, rebuilt))
    }

    /// Re-evaluates every element that read another document.
    pub fn retrigger(
        &mut self,
        foreign: &dyn ForeignResolver,
    ) -> Result<Propagation, PropagateError> {
        self.cancel.reset();
        let dirty = self.tree.invalidate_foreign();
        log::debug!("re-triggering `{}`: {dirty} elements", self.name);
        let result = self.propagate(foreign);
        if changed_values(&result) {
            self.region.bump();
        }
        result
    }

    /// Re-runs propagation over elements that still wait on undefined
    /// names.
    pub fn settle(&mut self, foreign: &dyn ForeignResolver) -> Result<Propagation, PropagateError> {
        self.cancel.reset();
        let result = self.propagate(foreign);
        if changed_values(&result) {
            self.region.bump();
        }
        result
    }

    fn propagate(&mut self, foreign: &dyn ForeignResolver) -> Result<Propagation, PropagateError> {
        propagate(
            &mut self.tree,
            &self.region,
            foreign,
            &self.config,
            &self.cancel,
        )
    }

    fn finish(
        &mut self,
        changes: ChangeSet,
        rebuilt: RebuildReport,
        foreign: &dyn ForeignResolver,
    ) -> PipelineReport {
        let propagation = self.propagate(foreign);
        if let Err(err @ (PropagateError::Cancelled | PropagateError::Pipeline(_))) = &propagation {
            log::debug!("propagation of `{}` stopped: {err}", self.name);
        }
        let version = if !rebuilt.is_empty() || changed_values(&propagation) {
            self.region.bump()
        } else {
            self.region.version()
        };

        let mut diagnostics = self.tokens.diagnostics().to_vec();
        diagnostics.extend(
            rebuilt
                .duplicates
                .iter()
                .map(|name| Diagnostic::DuplicateDefinition { name: name.clone() }),
        );
        PipelineReport {
            changes,
            rebuilt,
            propagation,
            diagnostics,
            version,
        }
    }
}

fn changed_values(result: &Result<Propagation, PropagateError>) -> bool {
    match result {
        Ok(summary) => summary.changed > 0,
        Err(PropagateError::Cycle(_) | PropagateError::IterationCapExceeded { .. }) => true,
        Err(_) => false,
    }
}

impl<C> Document<C> {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[inline]
    pub fn tokens(&self) -> &TokenSequence {
        &self.tokens
    }

    #[inline]
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    #[inline]
    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    #[inline]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// A handle that cancels this document's in-flight propagation.
    #[inline]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Token-ordered view for renderers.
    pub fn render(&self) -> RenderPass<'_> {
        RenderPass::new(&self.tree, &self.tokens)
    }

    /// Value bound to `name`, resolved from the root scope.
    pub fn value(&self, name: &str) -> Option<Value> {
        let table = self.region.read().ok()?;
        let root = table.root()?;
        table
            .resolve(root, &QualifiedName::parse(name))
            .ok()?
            .value
            .clone()
    }

    /// Other documents read by the last propagation, with the region
    /// versions observed, sorted by name.
    pub fn reference_set(&self) -> Vec<(String, u64)> {
        let mut reads: Vec<(String, u64)> = self
            .tree
            .elements()
            .into_iter()
            .filter_map(|id| self.tree.element(id))
            .flat_map(|e| e.foreign_reads().iter().cloned())
            .collect();
        reads.sort();
        reads.dedup();
        reads
    }

    /// Whether any element waits on a name nobody defines.
    pub fn has_pending(&self) -> bool {
        self.tree.elements().into_iter().any(|id| {
            self.tree
                .element(id)
                .is_some_and(|e| matches!(e.state, EvalState::Pending(_)))
        })
    }

    /// Tears down the tree together with its scopes.
    pub fn close(self) -> Result<(), Error> {
        let mut table = self.region.write()?;
        self.tree.close(&mut table);
        Ok(())
    }
}
