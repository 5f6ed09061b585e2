// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Read-only snapshot of the host's image status probe

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::apt::driver::{self, Driver};

/// Transport of images built into the local container store
pub const TRANSPORT_CONTAINERS_STORAGE: &str = "containers-storage";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageRef {
    pub image: String,
    pub transport: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BootEntry {
    pub image: Option<ImageRef>,
    pub pinned: bool,
    pub store: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Spec {
    pub image: Option<ImageRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Status {
    pub staged: Option<BootEntry>,
    pub booted: Option<BootEntry>,
}

/// Parsed output of `bootc status --json`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostImage {
    pub spec: Spec,
    pub status: Status,
}

impl HostImage {
    pub fn parse(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn booted_image(&self) -> Option<&ImageRef> {
        self.status.booted.as_ref()?.image.as_ref()
    }

    /// The image the host is configured to follow; falls back to the
    /// booted one
    pub fn configured_image(&self) -> Option<&ImageRef> {
        self.spec.image.as_ref().or_else(|| self.booted_image())
    }

    /// True when the booted image came out of the local container store,
    /// i.e. was rebuilt on this host
    pub fn is_locally_built(&self) -> bool {
        self.booted_image()
            .is_some_and(|image| image.transport == TRANSPORT_CONTAINERS_STORAGE)
    }
}

/// Run the status probe
pub async fn probe(driver: &Driver, token: &CancellationToken) -> Result<HostImage, Error> {
    let output = driver.run("bootc", &["status", "--json"], token, None).await?;
    if !output.success() {
        return Err(Error::Probe(output.lines.last().cloned().unwrap_or_default()));
    }
    HostImage::parse(&output.text())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("status probe failed: {0}")]
    Probe(String),

    #[error("status parse")]
    Parse(#[from] serde_json::Error),

    #[error("driver: {0}")]
    Driver(#[from] driver::Error),
}

#[cfg(test)]
mod test {
    use indoc::indoc;

    use super::*;

    const STATUS: &str = indoc! {r#"
        {
            "spec": {
                "image": { "image": "ghcr.io/example/os:latest", "transport": "registry" }
            },
            "status": {
                "staged": null,
                "booted": {
                    "image": { "image": "localhost/os", "transport": "containers-storage" },
                    "pinned": false,
                    "store": "ostreeContainer"
                }
            }
        }
    "#};

    #[test]
    fn parse_probe() {
        let host = HostImage::parse(STATUS).unwrap();
        assert_eq!(host.spec.image.as_ref().unwrap().image, "ghcr.io/example/os:latest");
        assert_eq!(host.booted_image().unwrap().transport, TRANSPORT_CONTAINERS_STORAGE);
        assert!(host.is_locally_built());
        assert!(host.status.staged.is_none());
    }

    #[test]
    fn cloud_host() {
        let host = HostImage::parse(
            r#"{"status":{"booted":{"image":{"image":"quay.io/fedora/os","transport":"registry"}}}}"#,
        )
        .unwrap();
        assert!(!host.is_locally_built());
        assert_eq!(host.configured_image().unwrap().image, "quay.io/fedora/os");
    }
}
