//! The stage fingerprint function.
//!
//! A pure, deterministic hash over a stage's identity. Given the same
//! cache-version, stage name, dependency digest, and predecessor context, it
//! always produces the same fingerprint — on any host, any run. This is the
//! property the rest of the engine (the fast index, the registry, the
//! builder's at-most-one-winner protocol) is built on top of.

use kiln_registry_client::registry::Fingerprint;

/// The cache-version string every fingerprint in a run is seeded with.
///
/// Changing this invalidates every existing cache entry project-wide —
/// it's the escape hatch for "the fingerprint composition itself changed."
pub const CACHE_VERSION: &str = "kiln/v1";

/// A predecessor's contribution to a stage's fingerprint: its own
/// fingerprint plus its view of the dependency digest for the transition
/// into the next stage.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PredecessorContext<'a> {
    pub fingerprint: &'a Fingerprint,
    pub next_stage_dependencies: &'a [u8],
}

/// Compute a stage's content fingerprint.
///
/// Inputs are hashed in a fixed order: cache-version, stage name, the
/// stage's own dependency digest, then — if present — the predecessor's
/// fingerprint and next-stage-dependency digest. Changing the order would
/// silently invalidate every existing cache, so this function is the single
/// place that order is allowed to be decided.
pub fn compute(
    stage_name: &str,
    dependencies: &[u8],
    predecessor: Option<PredecessorContext<'_>>,
) -> Fingerprint {
    let mut fields: Vec<&[u8]> = vec![CACHE_VERSION.as_bytes(), stage_name.as_bytes(), dependencies];
    if let Some(p) = predecessor {
        fields.push(p.fingerprint.as_bytes());
        fields.push(p.next_stage_dependencies);
    }
    Fingerprint::from_fields(fields)
}
