// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Drive the container build tool as a subprocess

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::apt::driver::{self, Driver, LogHandler};

/// Tag carried by locally rebuilt host images
pub const OS_TAG: &str = "os";

/// One row of `podman images --format json`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageListEntry {
    pub id: String,
    pub names: Option<Vec<String>>,
}

impl ImageListEntry {
    /// Untagged leftovers show up with a `<none>` name (or none at all)
    pub fn is_dangling(&self) -> bool {
        match &self.names {
            None => true,
            Some(names) => names.is_empty() || names.iter().any(|n| n.contains("<none>")),
        }
    }
}

/// Single-layer build of the recipe, tagged [`OS_TAG`]
pub async fn build(
    driver: &Driver,
    containerfile: &Path,
    pull: bool,
    token: &CancellationToken,
    log: Option<&LogHandler>,
) -> Result<(), Error> {
    let context = containerfile.parent().unwrap_or_else(|| Path::new("/"));
    let file = containerfile.to_string_lossy();
    let ctx = context.to_string_lossy();

    let mut args = vec!["build", "--squash", "-t", OS_TAG, "-f", file.as_ref()];
    if pull {
        args.push("--pull=always");
    }
    args.push(ctx.as_ref());

    let output = driver.run("podman", &args, token, log).await?;
    if !output.success() {
        return Err(Error::Failed(output.lines.last().cloned().unwrap_or_default()));
    }
    Ok(())
}

/// Resolve a tag to its image id
pub async fn image_id(driver: &Driver, tag: &str, token: &CancellationToken) -> Result<String, Error> {
    let output = driver
        .run("podman", &["image", "inspect", tag, "--format", "{{.Id}}"], token, None)
        .await?;
    if !output.success() {
        return Err(Error::Failed(output.lines.last().cloned().unwrap_or_default()));
    }
    output
        .lines
        .iter()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| Error::Failed("no image id returned".to_owned()))
}

pub async fn list_images(driver: &Driver, token: &CancellationToken) -> Result<Vec<ImageListEntry>, Error> {
    let output = driver.run("podman", &["images", "--format", "json"], token, None).await?;
    if !output.success() {
        return Err(Error::Failed(output.lines.last().cloned().unwrap_or_default()));
    }
    Ok(serde_json::from_str(&output.text())?)
}

pub async fn remove_image(driver: &Driver, id: &str, token: &CancellationToken) -> Result<(), Error> {
    let output = driver.run("podman", &["rmi", "-f", id], token, None).await?;
    if !output.success() {
        return Err(Error::Failed(output.lines.last().cloned().unwrap_or_default()));
    }
    Ok(())
}

pub async fn prune(driver: &Driver, token: &CancellationToken) -> Result<(), Error> {
    let output = driver.run("podman", &["image", "prune", "-f"], token, None).await?;
    if !output.success() {
        return Err(Error::Failed(output.lines.last().cloned().unwrap_or_default()));
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("podman failed: {0}")]
    Failed(String),

    #[error("output parse")]
    Parse(#[from] serde_json::Error),

    #[error("driver: {0}")]
    Driver(#[from] driver::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dangling_detection() {
        let parsed: Vec<ImageListEntry> = serde_json::from_str(
            r#"[
                {"Id": "aaa", "Names": ["localhost/os:latest"]},
                {"Id": "bbb", "Names": ["<none>:<none>"]},
                {"Id": "ccc"}
            ]"#,
        )
        .unwrap();

        let dangling: Vec<_> = parsed.iter().filter(|e| e.is_dangling()).map(|e| e.id.as_str()).collect();
        assert_eq!(dangling, ["bbb", "ccc"]);
    }
}
