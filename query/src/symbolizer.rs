//! Symbolization is an external collaborator in this system: a remote
//! service (or the original's in-process `SymbolStore`) resolves raw
//! addresses in a profile's `Mapping`/`Location` tables to function
//! names. The query engine only needs a seam to call it through; the
//! actual RPC client is out of scope here.

use common::error::Result;
use pprof::protos::Profile;

pub trait Symbolizer: Send + Sync {
    fn symbolize(&self, profile: &mut Profile) -> Result<()>;
}

/// Used when no symbol server is configured; stack traces are returned
/// with whatever symbol information the target itself already embedded.
pub struct NoopSymbolizer;

impl Symbolizer for NoopSymbolizer {
    fn symbolize(&self, _profile: &mut Profile) -> Result<()> {
        Ok(())
    }
}
