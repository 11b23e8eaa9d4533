//! Opaque mapping seams. The expression language behind a mapping is not this
//! crate's concern; the core only needs "map a part to a part, delete it, or
//! fail" ([PartMapper]) and "overlay a result part onto its origin"
//! ([ResultMapper]). Both are implemented for plain closures so tests and
//! embedders can wire mappings without a dedicated type.

use crate::error::Result;
use crate::message::Part;

/// Maps one part to at most one part.
pub trait PartMapper: Send + Sync {
    /// Returns the mapped part, `None` to delete it, or an error when the
    /// mapping itself failed for this index.
    fn map_part(&self, index: usize, part: &Part) -> Result<Option<Part>>;
}

impl<F> PartMapper for F
where
    F: Fn(usize, &Part) -> Result<Option<Part>> + Send + Sync,
{
    fn map_part(&self, index: usize, part: &Part) -> Result<Option<Part>> {
        self(index, part)
    }
}

/// Overlays a processing result onto the part it originated from.
pub trait ResultMapper: Send + Sync {
    fn overlay(&self, index: usize, origin: &Part, result: &Part) -> Result<Part>;
}

impl<F> ResultMapper for F
where
    F: Fn(usize, &Part, &Part) -> Result<Part> + Send + Sync,
{
    fn overlay(&self, index: usize, origin: &Part, result: &Part) -> Result<Part> {
        self(index, origin, result)
    }
}
