//! `guernika.json` per-model metadata and resource-directory scanning
//! (spec §6). ADDED ambient configuration layer: ungrounded in the teacher,
//! which hardcodes model shapes; built the way the rest of the retrieval
//! pack decodes sidecar model metadata (struct-of-fields plus
//! `#[serde(other)]` unknown sentinels).

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Attention implementation a converted model was traced with. Unknown
/// values (future converter output this crate doesn't know about yet)
/// decode to `Unknown` rather than failing deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AttentionImplementation {
    #[serde(rename = "ORIGINAL")]
    Original,
    #[serde(rename = "SPLIT_EINSUM")]
    SplitEinsum,
    #[serde(other)]
    Unknown,
}

/// Which pipeline variant a model artifact was converted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ModelFunction {
    #[serde(rename = "standard")]
    Standard,
    #[serde(rename = "inpaint")]
    Inpaint,
    #[serde(rename = "instructions")]
    Instructions,
    #[serde(other)]
    Unknown,
}

/// Decoded `guernika.json` sidecar metadata for one model artifact.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelMetadata {
    pub identifier: String,
    pub converter_version: String,
    pub attention_implementation: AttentionImplementation,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub controlnet_support: bool,
    pub function: ModelFunction,
    pub hidden_size: i64,
}

impl ModelMetadata {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|_| Error::ResourceMissing {
            path: path.display().to_string(),
        })?;
        serde_json::from_str(&text).map_err(|source| Error::InvalidMetadata {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Which U-Net artifact layout is present in a resource directory.
pub enum UnetLayout {
    Single(PathBuf),
    Chunked(PathBuf, PathBuf),
}

/// The resolved set of artifact paths found in a resource directory (spec
/// §6). Optional artifacts that are absent downgrade pipeline capabilities
/// rather than failing construction (§7).
pub struct ResourceDirectory {
    pub root: PathBuf,
    pub text_encoder: PathBuf,
    pub vae_decoder: PathBuf,
    pub unet: UnetLayout,
    pub vae_encoder: Option<PathBuf>,
    pub safety_checker: Option<PathBuf>,
    pub controlnet: Option<PathBuf>,
    pub vocab: PathBuf,
    pub merges: PathBuf,
}

fn require(dir: &Path, file_name: &str) -> Result<PathBuf> {
    let path = dir.join(file_name);
    if path.exists() {
        Ok(path)
    } else {
        Err(Error::ResourceMissing { path: path.display().to_string() })
    }
}

fn optional(dir: &Path, file_name: &str) -> Option<PathBuf> {
    let path = dir.join(file_name);
    path.exists().then_some(path)
}

impl ResourceDirectory {
    /// Scan `dir` for the layout described in spec §6. The chunked U-Net
    /// pair is preferred over a single `Unet.*` artifact when both are
    /// present (spec §6, §9 open question).
    pub fn scan(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let chunk1 = optional(&dir, "UnetChunk1.pt");
        let chunk2 = optional(&dir, "UnetChunk2.pt");
        let unet = match (chunk1, chunk2) {
            (Some(a), Some(b)) => UnetLayout::Chunked(a, b),
            _ => UnetLayout::Single(require(&dir, "Unet.pt")?),
        };
        Ok(ResourceDirectory {
            text_encoder: require(&dir, "TextEncoder.pt")?,
            vae_decoder: require(&dir, "VAEDecoder.pt")?,
            unet,
            vae_encoder: optional(&dir, "VAEEncoder.pt"),
            safety_checker: optional(&dir, "SafetyChecker.pt"),
            controlnet: optional(&dir, "ControlNet.pt"),
            vocab: require(&dir, "vocab.json")?,
            merges: require(&dir, "merges.txt")?,
            root: dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_attention_implementation_decodes_to_sentinel() {
        let json = r#"{
            "identifier": "unet",
            "converter_version": "1.0",
            "attention_implementation": "SOME_FUTURE_VARIANT",
            "width": 512,
            "height": 512,
            "controlnet_support": false,
            "function": "standard",
            "hidden_size": 768
        }"#;
        let meta: ModelMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.attention_implementation, AttentionImplementation::Unknown);
        assert_eq!(meta.function, ModelFunction::Standard);
    }

    #[test]
    fn known_fields_decode() {
        let json = r#"{
            "identifier": "unet",
            "converter_version": "1.2.3",
            "attention_implementation": "SPLIT_EINSUM",
            "width": 512,
            "height": 512,
            "controlnet_support": true,
            "function": "inpaint",
            "hidden_size": 768
        }"#;
        let meta: ModelMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.attention_implementation, AttentionImplementation::SplitEinsum);
        assert_eq!(meta.function, ModelFunction::Inpaint);
        assert!(meta.controlnet_support);
    }

    #[test]
    fn scan_missing_directory_reports_resource_missing() {
        let err = ResourceDirectory::scan("/nonexistent/resource/dir").unwrap_err();
        assert!(matches!(err, Error::ResourceMissing { .. }));
    }
}
