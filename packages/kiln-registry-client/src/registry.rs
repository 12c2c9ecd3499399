//! Wire types for the stage registry: fingerprints, artifact descriptors,
//! and the label vocabulary records are tagged with.

#[cfg(feature = "client")]
mod client;

#[cfg(feature = "client")]
pub use client::RegistryClient;

use color_eyre::eyre::{Context, bail};
use jiff::Timestamp;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use strum::{Display, EnumString};
use tracing::{instrument, trace};

/// A 256-bit content fingerprint, the engine's unit of cache identity.
///
/// This is the output of the fingerprint function (the engine crate owns
/// the composition logic; this crate only owns the resulting value's shape
/// and its wire encoding).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Debug, derive_more::Display)]
#[display("{}", self.to_hex())]
#[debug("{}", self.to_hex())]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// View the fingerprint as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a fingerprint from a lowercase hex string.
    #[instrument(fields(hex = hex.as_ref()))]
    pub fn from_hex(hex: impl AsRef<str>) -> color_eyre::Result<Self> {
        let bytes = hex::decode(hex.as_ref()).context("decode hex")?;
        let len = bytes.len();
        trace!(?bytes, ?len, "decoded fingerprint hex");
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| color_eyre::eyre::eyre!("fingerprint must be exactly 32 bytes"))?;
        Ok(Self(array))
    }

    /// Construct a fingerprint from a blake3 hash.
    pub fn from_blake3(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }

    /// Hash an ordered sequence of byte-convertible fields into a fingerprint.
    ///
    /// Field order matters: this is the primitive that backs the composition
    /// rule in §4.A of the stage-build specification (cache-version,
    /// stage-name, dependency digest, predecessor fingerprint, predecessor's
    /// next-stage-dependency digest, fed through in that order).
    pub fn from_fields(fields: impl IntoIterator<Item = impl AsRef<[u8]>>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for field in fields {
            hasher.update(field.as_ref());
        }
        Self::from_blake3(hasher.finalize())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// Disambiguates multiple artifacts published under the same fingerprint
/// (a race between concurrent builders racing the same stage). A monotonic
/// millisecond timestamp is sufficient as long as collisions within the
/// current candidate set are retried (see `next_unique_id`).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, derive_more::Display)]
pub struct UniqueId(u64);

impl UniqueId {
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Pick a unique id not already present among `taken`, starting from
/// `now_millis` and probing forward one millisecond at a time on collision.
///
/// The original generator this is modeled on reads current time, checks for
/// a collision in the existing candidate list, and — due to a `continue`
/// with no enclosing loop — returns the very first candidate even when it
/// collides. This function implements the evidently-intended retry instead.
pub fn next_unique_id(now_millis: u64, taken: &[UniqueId]) -> UniqueId {
    let mut candidate = now_millis;
    while taken.iter().any(|id| id.0 == candidate) {
        candidate += 1;
    }
    UniqueId(candidate)
}

/// The naming discipline used to derive an artifact's human-visible meta-tag.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum TagStrategy {
    GitTag,
    GitBranch,
    GitCommit,
    StagesSignature,
    Custom,
}

/// Label keys recorded on every published artifact (§6 of the specification).
///
/// These are kept bit-exact (case-sensitive) because external tooling may
/// match on them directly.
pub mod label_keys {
    pub const PROJECT: &str = "kiln";
    pub const ENGINE_VERSION: &str = "kiln-version";
    pub const CACHE_VERSION: &str = "kiln-cache-version";
    pub const IS_IMAGE: &str = "kiln-image";
    pub const STAGE_SIGNATURE: &str = "kiln-stage-signature";
    pub const QUALIFIED_NAME: &str = "kiln-docker-image-name";
    pub const TAG_STRATEGY: &str = "kiln-tag-strategy";
    pub const IMAGE_TAG: &str = "kiln-image-tag";
    pub const MOUNT_TMP_DIR: &str = "kiln-mount-tmp-dir";
    pub const MOUNT_BUILD_DIR: &str = "kiln-mount-build-dir";

    /// Prefix for per-source custom mount registration labels; the source
    /// alias is appended with `/` encoded as `--`.
    pub const MOUNT_CUSTOM_DIR_PREFIX: &str = "kiln-mount-custom-dir-";
}

/// The full label set carried by an artifact descriptor.
///
/// Backed by a sorted map so serialization is deterministic and the
/// round-trip law in the specification's testable properties holds
/// trivially (a `BTreeMap` compares equal regardless of insertion order).
#[derive(Clone, Default, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Encode a source alias as a custom mount-directory label key, slash
    /// replaced with `--` per §6.
    pub fn custom_mount_dir_key(source_alias: &str) -> String {
        format!(
            "{}{}",
            label_keys::MOUNT_CUSTOM_DIR_PREFIX,
            source_alias.replace('/', "--")
        )
    }
}

/// An image-metadata record: `(image, commit) -> fingerprint`.
///
/// Persisted under a reserved tag namespace in the registry itself (for the
/// HTTP backend) or a local table (for the default backend); see the
/// image metadata store for the backends.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct CommitRecord {
    pub image: String,
    pub commit: String,
    pub fingerprint: Fingerprint,
}

/// A single published artifact: the metadata stored in the stage registry
/// and mirrored (lossily) in the fast index.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize, bon::Builder)]
pub struct ArtifactDescriptor {
    /// The fully qualified `repository:tag` name.
    pub name: String,
    pub repository: String,
    pub tag: String,
    /// Opaque id assigned by the underlying registry/container engine.
    pub id: String,
    pub size_bytes: u64,
    pub created_at: Timestamp,
    pub labels: Labels,
}

impl ArtifactDescriptor {
    pub fn fingerprint(&self) -> color_eyre::Result<Fingerprint> {
        let hex = self
            .labels
            .get(label_keys::STAGE_SIGNATURE)
            .ok_or_else(|| color_eyre::eyre::eyre!("descriptor missing stage-signature label"))?;
        Fingerprint::from_hex(hex)
    }

    pub fn tag_strategy(&self) -> Option<TagStrategy> {
        self.labels
            .get(label_keys::TAG_STRATEGY)
            .and_then(|s| s.parse().ok())
    }
}

/// Build the qualified artifact name for `(project, fingerprint, unique-id)`.
///
/// Deterministic and injective over its three inputs: the fingerprint is a
/// fixed-width hex string and the unique-id is decimal, so `-` between them
/// is unambiguous (decimal digits never contain a further `-`, and the
/// fingerprint never contains one either).
pub fn construct_name(stages_repo: &str, fingerprint: &Fingerprint, unique_id: UniqueId) -> String {
    format!("{stages_repo}:{}-{}", fingerprint.to_hex(), unique_id.value())
}

/// Split a qualified artifact name produced by [`construct_name`] back into
/// its repository, fingerprint, and unique-id components.
pub fn parse_repository_and_tag(
    qualified: &str,
) -> color_eyre::Result<(String, Fingerprint, UniqueId)> {
    let (repository, tag) = qualified
        .split_once(':')
        .ok_or_else(|| color_eyre::eyre::eyre!("missing ':' separator in {qualified:?}"))?;
    let (fp_hex, id_str) = tag
        .split_once('-')
        .ok_or_else(|| color_eyre::eyre::eyre!("missing '-' separator in tag {tag:?}"))?;
    let fingerprint = Fingerprint::from_hex(fp_hex).context("parse fingerprint component")?;
    let unique_id = id_str
        .parse::<u64>()
        .map(UniqueId::new)
        .map_err(|_| color_eyre::eyre::eyre!("invalid unique-id component {id_str:?}"))?;
    if repository.is_empty() {
        bail!("empty repository component in {qualified:?}");
    }
    Ok((repository.to_string(), fingerprint, unique_id))
}
