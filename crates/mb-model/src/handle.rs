use std::fmt;
use std::path::Path;

use mb_graph::ComputeGraph;
use tracing::{debug, info};

use crate::error::{ModelError, Result};
use crate::family::ModelFamily;

/// Owner of at most one loaded model of family `F`.
///
/// The handle is empty until [`init`](Self::init) succeeds and empty again
/// after [`uninit`](Self::uninit). A failed `init` never leaves partial
/// state behind. Dropping a live handle releases its container.
pub struct ModelHandle<F: ModelFamily> {
    buf: Option<Box<F::Container>>,
}

impl<F: ModelFamily> Default for ModelHandle<F> {
    fn default() -> Self {
        ModelHandle { buf: None }
    }
}

impl<F: ModelFamily> fmt::Debug for ModelHandle<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("family", &F::NAME)
            .field("live", &self.is_live())
            .finish()
    }
}

impl<F: ModelFamily> ModelHandle<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle loaded from `path`.
    pub fn open(path: impl AsRef<Path>, params: &F::Params) -> Result<Self> {
        let mut handle = Self::new();
        handle.init(path, params)?;
        Ok(handle)
    }

    /// Load the model at `path` into this handle.
    ///
    /// Fails with [`ModelError::AlreadyInitialized`] on a live handle, leaving
    /// the loaded model untouched.
    pub fn init(&mut self, path: impl AsRef<Path>, params: &F::Params) -> Result<()> {
        if self.buf.is_some() {
            return Err(ModelError::AlreadyInitialized(F::NAME));
        }
        let path = path.as_ref();
        let container = F::load(path, params)?;
        self.buf = Some(Box::new(container));
        info!(family = F::NAME, path = %path.display(), "model initialized");
        Ok(())
    }

    /// Release the loaded model. A no-op on an empty handle.
    pub fn uninit(&mut self) {
        if let Some(container) = self.buf.take() {
            drop(container);
            debug!(family = F::NAME, "model released");
        }
    }

    pub fn is_live(&self) -> bool {
        self.buf.is_some()
    }

    /// Build a fresh inference graph. The graph borrows the handle, so it
    /// cannot outlive the next `uninit`.
    pub fn graph(&mut self, params: &F::GraphParams) -> Result<ComputeGraph<'_>> {
        let container = self
            .buf
            .as_deref_mut()
            .ok_or(ModelError::NotInitialized(F::NAME))?;
        let graph = F::build_graph(container, params)?;
        debug!(
            family = F::NAME,
            n_nodes = graph.n_nodes(),
            n_leafs = graph.n_leafs(),
            mem_used = graph.mem_used(),
            "built graph"
        );
        Ok(graph)
    }

    /// The loaded container, if any.
    pub fn container(&self) -> Option<&F::Container> {
        self.buf.as_deref()
    }
}

impl<F: ModelFamily> Drop for ModelHandle<F> {
    fn drop(&mut self) {
        self.uninit();
    }
}
