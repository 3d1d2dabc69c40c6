use bytes::Bytes;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::error::AdapterError;

pub const MEDIA_TYPE_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const MEDIA_TYPE_SIGNED_MANIFEST_V1: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const MEDIA_TYPE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media types requested when pulling a manifest for replication
pub const ACCEPTED_MEDIA_TYPES: &[&str] = &[
    MEDIA_TYPE_MANIFEST_V2,
    MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_SIGNED_MANIFEST_V1,
    MEDIA_TYPE_MANIFEST_V1,
];

/// Content-addressed reference to a blob
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Deserialize)]
struct SchemaV2 {
    config: Descriptor,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FsLayer {
    blob_sum: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaV1 {
    #[serde(default)]
    fs_layers: Vec<FsLayer>,
}

/// A pulled manifest: raw payload plus what the registry said about it
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub media_type: String,
    pub digest: String,
    pub payload: Bytes,
}

impl Manifest {
    /// Build from a registry response. `content_type` wins when present; a
    /// generic JSON content type means schema1.
    pub fn from_response(
        content_type: Option<&str>,
        digest: Option<&str>,
        payload: Bytes,
    ) -> Result<Self, AdapterError> {
        let media_type = match content_type.map(|c| c.split(';').next().unwrap_or("").trim()) {
            Some(ct) if ct.contains("application/json") => MEDIA_TYPE_MANIFEST_V1.to_string(),
            Some(ct) if !ct.is_empty() => ct.to_string(),
            _ => media_type_from_payload(&payload)?,
        };
        let digest = match digest {
            Some(d) if !d.is_empty() => d.to_string(),
            _ => digest_of(&payload),
        };
        Ok(Self {
            media_type,
            digest,
            payload,
        })
    }

    pub fn is_schema1(&self) -> bool {
        self.media_type == MEDIA_TYPE_MANIFEST_V1
            || self.media_type == MEDIA_TYPE_SIGNED_MANIFEST_V1
    }

    /// Blobs referenced by the manifest, in the order they must be copied
    pub fn references(&self) -> Result<Vec<Descriptor>, AdapterError> {
        if self.is_schema1() {
            let manifest: SchemaV1 = serde_json::from_slice(&self.payload)
                .map_err(|e| AdapterError::InvalidManifest(e.to_string()))?;
            // fsLayers are listed top-most first
            let mut seen = std::collections::HashSet::new();
            let refs = manifest
                .fs_layers
                .into_iter()
                .rev()
                .filter(|l| seen.insert(l.blob_sum.clone()))
                .map(|l| Descriptor {
                    media_type: String::new(),
                    digest: l.blob_sum,
                    size: 0,
                })
                .collect();
            return Ok(refs);
        }

        match self.media_type.as_str() {
            MEDIA_TYPE_MANIFEST_V2 | MEDIA_TYPE_OCI_MANIFEST => {
                let manifest: SchemaV2 = serde_json::from_slice(&self.payload)
                    .map_err(|e| AdapterError::InvalidManifest(e.to_string()))?;
                let mut refs = Vec::with_capacity(manifest.layers.len() + 1);
                refs.push(manifest.config);
                refs.extend(manifest.layers);
                Ok(refs)
            }
            other => Err(AdapterError::InvalidManifest(format!(
                "unsupported manifest media type '{}'",
                other
            ))),
        }
    }
}

fn media_type_from_payload(payload: &[u8]) -> Result<String, AdapterError> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| AdapterError::InvalidManifest(e.to_string()))?;
    if let Some(mt) = value.get("mediaType").and_then(|v| v.as_str()) {
        return Ok(mt.to_string());
    }
    match value.get("schemaVersion").and_then(|v| v.as_i64()) {
        Some(1) => Ok(MEDIA_TYPE_MANIFEST_V1.to_string()),
        Some(2) => Ok(MEDIA_TYPE_OCI_MANIFEST.to_string()),
        _ => Err(AdapterError::InvalidManifest(
            "cannot determine manifest media type".to_string(),
        )),
    }
}

/// `sha256:<hex>` digest of a payload
pub fn digest_of(payload: &[u8]) -> String {
    let hash = Sha256::digest(payload);
    let hex: String = hash.iter().map(|b| format!("{:02x}", b)).collect();
    format!("sha256:{}", hex)
}
