//! Pipeline configuration for resource limits and convergence tuning.
//!
//! This module provides [`PipelineConfig`] for controlling how a document
//! pipeline run behaves: how many propagation passes are allowed, when a
//! node counts as toggling, and how deep containers may nest.
//!
//! # Example
//!
//! ```ignore
//! use livedoc_core::config::PipelineConfig;
//!
//! // Pass cap proportional to tree size, revisit limit 3.
//! let config = PipelineConfig::default();
//!
//! // Fixed pass cap for a known-small document.
//! let config = PipelineConfig::new()
//!     .with_max_passes(16)
//!     .with_revisit_limit(2);
//! ```

use crate::Error;

/// Configuration for pipeline behavior and resource limits.
///
/// # Default Values
///
/// | Setting | Default | Meaning |
/// |---------|---------|---------|
/// | `max_passes` | `None` | `node_count + 2`, at least 8 |
/// | `revisit_limit` | 3 | changes per node before it counts as toggling |
/// | `max_tokens` | `usize::MAX` | no limit |
/// | `max_recursion_depth` | 128 | container nesting during rebuild |
/// | `max_requeue_rounds` | 16 | cross-document re-trigger rounds |
/// | `channel_capacity` | 32 | per-document session queue |
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Maximum number of propagation passes per run.
    ///
    /// `None` derives the cap from the tree size (see [`pass_cap`]).
    ///
    /// [`pass_cap`]: PipelineConfig::pass_cap
    pub max_passes: Option<usize>,

    /// How many times a single node may change value within one
    /// propagation call before it is treated as part of a cycle.
    pub revisit_limit: usize,

    /// Maximum number of tokens a tokenizer run may produce.
    pub max_tokens: usize,

    /// Maximum container nesting depth accepted by rebuild.
    pub max_recursion_depth: usize,

    /// Maximum number of cross-document re-trigger rounds after one edit.
    pub max_requeue_rounds: usize,

    /// Bounded queue size for async document sessions.
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    #[inline]
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl PipelineConfig {
    /// Default configuration, usable in const contexts.
    pub const DEFAULT: Self = Self {
        max_passes: None,
        revisit_limit: 3,
        max_tokens: usize::MAX,
        max_recursion_depth: 128,
        max_requeue_rounds: 16,
        channel_capacity: 32,
    };

    /// Smallest pass cap derived from the tree size.
    pub const MIN_PASSES: usize = 8;

    #[inline]
    pub const fn new() -> Self {
        Self::DEFAULT
    }

    #[inline]
    pub const fn with_max_passes(mut self, passes: usize) -> Self {
        self.max_passes = Some(passes);
        self
    }

    #[inline]
    pub const fn with_revisit_limit(mut self, limit: usize) -> Self {
        self.revisit_limit = limit;
        self
    }

    #[inline]
    pub const fn with_max_tokens(mut self, count: usize) -> Self {
        self.max_tokens = count;
        self
    }

    /// Sets the maximum container nesting depth.
    ///
    /// Use `usize::MAX` to disable the limit.
    #[inline]
    pub const fn with_max_recursion_depth(mut self, depth: usize) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    #[inline]
    pub const fn with_max_requeue_rounds(mut self, rounds: usize) -> Self {
        self.max_requeue_rounds = rounds;
        self
    }

    #[inline]
    pub const fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Pass cap for a tree with `node_count` nodes.
    ///
    /// An acyclic graph of N nodes converges within N passes, so the derived
    /// cap leaves two passes of slack on top of that.
    #[inline]
    pub const fn pass_cap(&self, node_count: usize) -> usize {
        match self.max_passes {
            Some(n) => n,
            None => {
                let derived = node_count.saturating_add(2);
                if derived < Self::MIN_PASSES {
                    Self::MIN_PASSES
                } else {
                    derived
                }
            }
        }
    }
}

/// Container nesting counter for one rebuild walk, checked against
/// [`PipelineConfig::max_recursion_depth`].
///
/// ```ignore
/// let mut nesting = RecursionGuard::for_config(&config);
/// nesting.enter()?;   // container opened
/// nesting.leave();    // container closed
/// ```
#[derive(Debug, Clone, Copy)]
pub struct RecursionGuard {
    depth: usize,
    limit: usize,
}

impl RecursionGuard {
    #[inline]
    pub const fn with_limit(limit: usize) -> Self {
        Self { depth: 0, limit }
    }

    #[inline]
    pub const fn for_config(config: &PipelineConfig) -> Self {
        Self::with_limit(config.max_recursion_depth)
    }

    /// Containers currently open.
    #[inline]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// Opens one more container; fails once the limit is passed.
    pub fn enter(&mut self) -> Result<(), Error> {
        let depth = self.depth.saturating_add(1);
        if depth > self.limit {
            return Err(Error::RecursionLimitExceeded {
                depth,
                limit: self.limit,
            });
        }
        self.depth = depth;
        Ok(())
    }

    /// Closes the innermost container. Never goes below zero.
    #[inline]
    pub fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }
}
