mod registry;
mod resolution;
mod selectors;

pub use registry::{BackendCatalog, BackendKind, BackendSpec, MediaKind, Protocol};
pub use resolution::{Dimensions, Resolution, ResolutionTable};
pub use selectors::{BackendSelection, BackendSelector};
