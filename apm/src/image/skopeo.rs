// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Remote/local image digest probing via `skopeo inspect`

use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::apt::driver::{self, Driver};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inspect {
    #[serde(default)]
    layers: Vec<String>,
}

/// The comma-joined layer list of an image reference, used as its
/// effective digest when comparing remote and local copies
pub async fn layer_digest(
    driver: &Driver,
    reference: &str,
    token: &CancellationToken,
) -> Result<String, Error> {
    let output = driver.run("skopeo", &["inspect", reference], token, None).await?;
    if !output.success() {
        return Err(Error::Failed(
            reference.to_owned(),
            output.lines.last().cloned().unwrap_or_default(),
        ));
    }

    let inspect: Inspect = serde_json::from_str(&output.text())?;
    Ok(inspect.layers.join(","))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("inspect of {0} failed: {1}")]
    Failed(String, String),

    #[error("inspect parse")]
    Parse(#[from] serde_json::Error),

    #[error("driver: {0}")]
    Driver(#[from] driver::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn digest_is_joined_layers() {
        let inspect: Inspect = serde_json::from_str(
            r#"{"Digest": "sha256:abc", "Layers": ["sha256:l1", "sha256:l2"]}"#,
        )
        .unwrap();
        assert_eq!(inspect.layers.join(","), "sha256:l1,sha256:l2");
    }
}
