use std::path::Path;

use mb_graph::ComputeGraph;

use crate::error::Result;

/// A model family: how to load its files and how to build its inference graph.
///
/// Each family supplies a container type owning everything a loaded model
/// needs. [`ModelHandle`](crate::ModelHandle) drives the lifecycle
/// generically over this trait.
pub trait ModelFamily {
    /// Short name used in logs and errors.
    const NAME: &'static str;

    /// Load-time parameters.
    type Params: Default;

    /// Per-graph parameters.
    type GraphParams;

    /// Everything owned by a live model.
    type Container: Send;

    /// Parse the model file at `path` into a fully constructed container.
    fn load(path: &Path, params: &Self::Params) -> Result<Self::Container>;

    /// Build a fresh inference graph borrowing the container.
    fn build_graph<'a>(
        container: &'a mut Self::Container,
        params: &Self::GraphParams,
    ) -> Result<ComputeGraph<'a>>;
}
