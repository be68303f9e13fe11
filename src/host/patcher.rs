//! Image preparation before a transfer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{HostError, Result};
use crate::types::NetDimmTarget;

/// Kinds of settings blob that can be attached to an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingsKind {
    Eeprom,
    Sram,
}

/// Settings blobs to attach, by kind.
pub type ImageSettings = BTreeMap<SettingsKind, Vec<u8>>;

/// Applies patch files and settings to a raw image.
#[async_trait]
pub trait ImagePatcher: Send + Sync {
    async fn prepare(
        &self,
        image: Vec<u8>,
        target: NetDimmTarget,
        patches: &[PathBuf],
        settings: &ImageSettings,
    ) -> Result<Vec<u8>>;
}

/// Sends images exactly as they are on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughPatcher;

#[async_trait]
impl ImagePatcher for PassthroughPatcher {
    async fn prepare(
        &self,
        image: Vec<u8>,
        _target: NetDimmTarget,
        patches: &[PathBuf],
        settings: &ImageSettings,
    ) -> Result<Vec<u8>> {
        if !patches.is_empty() || !settings.is_empty() {
            return Err(HostError::ImagePreparation(format!(
                "no patcher configured for {} patch file(s) and {} settings blob(s)",
                patches.len(),
                settings.len()
            ))
            .into());
        }
        Ok(image)
    }
}

/// Read an image from disk and run it through `patcher`.
pub async fn load_image(
    patcher: &dyn ImagePatcher,
    path: &Path,
    target: NetDimmTarget,
    patches: &[PathBuf],
    settings: &ImageSettings,
) -> Result<Vec<u8>> {
    let image = tokio::fs::read(path).await.map_err(|e| {
        HostError::ImagePreparation(format!("cannot read {}: {e}", path.display()))
    })?;
    patcher.prepare(image, target, patches, settings).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_passthrough_returns_image() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"NAOMI image bytes").unwrap();

        let image = load_image(
            &PassthroughPatcher,
            file.path(),
            NetDimmTarget::Naomi,
            &[],
            &ImageSettings::new(),
        )
        .await
        .unwrap();
        assert_eq!(image, b"NAOMI image bytes");
    }

    #[tokio::test]
    async fn test_passthrough_rejects_patches() {
        let mut settings = ImageSettings::new();
        settings.insert(SettingsKind::Eeprom, vec![0; 128]);

        let err = PassthroughPatcher
            .prepare(vec![1, 2, 3], NetDimmTarget::Naomi, &[], &settings)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("settings"));

        let err = PassthroughPatcher
            .prepare(vec![], NetDimmTarget::Naomi, &[PathBuf::from("fix.bindiff")], &ImageSettings::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("patch"));
    }

    #[tokio::test]
    async fn test_missing_image() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_image(
            &PassthroughPatcher,
            &dir.path().join("missing.bin"),
            NetDimmTarget::Naomi,
            &[],
            &ImageSettings::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, crate::Error::Host(HostError::ImagePreparation(_))));
    }
}
