// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Typed response payloads and the transport envelope
//!
//! Every command answers with `{ data, error }`; the payload structs
//! here are the closed set of `data` shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::image::host::HostImage;
use crate::image::{ImageConfig, UpdateOutcome};
use crate::kernel::{CleanReport, KernelInfo};
use crate::package::{Package, PackageChanges};

/// The uniform transport envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
    pub error: bool,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self { data, error: false }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"data":"serialization failed","error":true}"#.to_owned())
    }
}

/// Failure envelope: the payload is the rendered message
pub fn failure(message: impl Into<String>) -> Envelope<String> {
    Envelope {
        data: message.into(),
        error: true,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResponse {
    pub message: String,
    pub changes: PackageChanges,
    pub image_updated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveResponse {
    pub message: String,
    pub changes: PackageChanges,
    pub image_updated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResponse {
    pub message: String,
    /// Rows now present in the mirror
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeResponse {
    pub message: String,
    pub changes: PackageChanges,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub package: Package,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub packages: Vec<Package>,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub packages: Vec<Package>,
    pub total_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageApplyResponse {
    pub message: String,
    pub image_id: String,
    pub journaled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatusResponse {
    pub host: HostImage,
    pub config: ImageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageUpdateResponse {
    pub message: String,
    pub outcome: String,
}

impl ImageUpdateResponse {
    pub fn from_outcome(outcome: UpdateOutcome) -> Self {
        let message = match outcome {
            UpdateOutcome::UpToDate => "image is up to date".to_owned(),
            UpdateOutcome::Upgraded => "image upgraded, reboot to apply".to_owned(),
            UpdateOutcome::Rebuilt => "base image changed, the image has been rebuilt".to_owned(),
        };
        Self {
            message,
            outcome: outcome.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRow {
    pub image_name: String,
    pub config: ImageConfig,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageHistoryResponse {
    pub history: Vec<HistoryRow>,
    pub total_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListKernelsResponse {
    pub kernels: Vec<KernelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentKernelResponse {
    pub kernel: KernelInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelModulesResponse {
    pub kernel: String,
    pub modules: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanResponse {
    pub message: String,
    #[serde(flatten)]
    pub report: CleanReport,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn envelope_shape() {
        let ok = Envelope::ok(UpdateResponse {
            message: "updated".to_owned(),
            count: 3,
        })
        .to_json();
        assert!(ok.contains("\"error\":false"));
        assert!(ok.contains("\"count\":3"));

        let err = failure("boom").to_json();
        assert!(err.contains("\"error\":true"));
        assert!(err.contains("\"data\":\"boom\""));
    }
}
