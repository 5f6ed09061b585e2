// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Image lifecycle: compile the declared state to a recipe, build,
//! switch the boot entry, journal history, prune leftovers

use std::sync::Arc;

use nix::unistd::{access, AccessFlags};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub use self::config::ImageConfig;
pub use self::host::HostImage;

use crate::apt::driver::{self, Driver, LogHandler};
use crate::apt::{ErrorKind, MatchedError};
use crate::db::history;
use crate::Env;

pub mod config;
pub mod host;
pub mod podman;
pub mod skopeo;

/// Marker in `bootc upgrade --check` output meaning nothing new
const NO_CHANGES: &str = "No changes in:";

/// Result of a successful build-and-switch
#[derive(Debug, Clone)]
pub struct SwitchReport {
    pub image_id: String,
    /// Whether a new history row was written
    pub journaled: bool,
}

/// What the update check decided to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "camelCase")]
pub enum UpdateOutcome {
    /// Remote and local state agree
    UpToDate,
    /// Cloud image, upgraded through the boot tool
    Upgraded,
    /// Locally modified image, rebuilt against the new base
    Rebuilt,
}

#[derive(Debug, Clone)]
pub struct Engine {
    env: Arc<Env>,
    driver: Driver,
    history: history::Database,
    /// Serializes every read-modify-write of the config file
    config_lock: Arc<Mutex<()>>,
}

impl Engine {
    pub fn new(env: Arc<Env>, driver: Driver, history: history::Database) -> Self {
        Self {
            env,
            driver,
            history,
            config_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn history(&self) -> &history::Database {
        &self.history
    }

    /// Current declared state; derives a default from the booted image
    /// when no file exists yet
    pub async fn load_config(&self, token: &CancellationToken) -> Result<ImageConfig, Error> {
        let path = self.env.path_image_file.clone();
        if path.exists() {
            return Ok(ImageConfig::parse(&fs_err::read_to_string(&path)?)?);
        }

        let probe = host::probe(&self.driver, token).await?;
        let image = probe
            .configured_image()
            .map(|image| image.image.clone())
            .ok_or(Error::NoBootedImage)?;

        Ok(ImageConfig::for_image(image))
    }

    /// Apply a mutation to the declared state and persist it atomically
    pub async fn mutate_config(
        &self,
        token: &CancellationToken,
        mutate: impl FnOnce(&mut ImageConfig),
    ) -> Result<ImageConfig, Error> {
        let _guard = self.config_lock.lock().await;

        let mut config = self.load_config(token).await?;
        mutate(&mut config);
        config.persist(&self.env.path_image_file)?;

        Ok(config)
    }

    pub async fn status(&self, token: &CancellationToken) -> Result<HostImage, Error> {
        Ok(host::probe(&self.driver, token).await?)
    }

    /// Make `/usr` writable for the lifetime of the boot, needed before
    /// any classic package operation on an atomic host
    pub async fn ensure_usr_overlay(&self, token: &CancellationToken) -> Result<(), Error> {
        if access("/usr", AccessFlags::W_OK).is_ok() {
            return Ok(());
        }
        let output = self.driver.run("bootc", &["usr-overlay"], token, None).await?;
        if !output.success() {
            return Err(Error::Tool(output.lines.last().cloned().unwrap_or_default()));
        }
        Ok(())
    }

    /// Compile the declared state, build the image and switch the boot
    /// entry to it.
    ///
    /// With `check_same`, an unchanged config (against the latest
    /// history row) aborts before the recipe file is touched.
    pub async fn build_and_switch(
        &self,
        token: &CancellationToken,
        pull: bool,
        check_same: bool,
        log: Option<&LogHandler>,
    ) -> Result<SwitchReport, Error> {
        let _guard = self.config_lock.lock().await;
        let config = self.load_config(token).await?;

        if check_same {
            if let Some(latest) = self.history.latest().await? {
                if latest.config == config {
                    return Err(Error::Unchanged);
                }
            }
        }

        let recipe = config.render_containerfile();
        fs_err::write(&self.env.path_containerfile, recipe)?;

        podman::build(&self.driver, &self.env.path_containerfile, pull, token, log).await?;
        let image_id = podman::image_id(&self.driver, podman::OS_TAG, token).await?;

        let transport = format!("{}:{image_id}", host::TRANSPORT_CONTAINERS_STORAGE);
        let output = self
            .driver
            .run("bootc", &["switch", "--transport", host::TRANSPORT_CONTAINERS_STORAGE, &image_id], token, log)
            .await?;
        if !output.success() {
            return Err(Error::Switch(transport, output.lines.last().cloned().unwrap_or_default()));
        }

        let journaled = self.history.add_if_changed(&config.image, &config).await?;

        self.prune(token).await;

        Ok(SwitchReport { image_id, journaled })
    }

    /// Decide between the cloud path (engine-managed upgrade) and the
    /// locally-modified path (digest compare, rebuild on divergence)
    pub async fn check_update(
        &self,
        token: &CancellationToken,
        log: Option<&LogHandler>,
    ) -> Result<UpdateOutcome, Error> {
        let probe = host::probe(&self.driver, token).await?;

        if !probe.is_locally_built() {
            // Cloud image: the boot tool owns the comparison
            let output = self.driver.run("bootc", &["upgrade", "--check"], token, log).await?;
            if output.text().contains(NO_CHANGES) {
                return Ok(UpdateOutcome::UpToDate);
            }
            let output = self.driver.run("bootc", &["upgrade"], token, log).await?;
            if !output.success() {
                return Err(Error::Tool(output.lines.last().cloned().unwrap_or_default()));
            }
            return Ok(UpdateOutcome::Upgraded);
        }

        // Locally rebuilt: compare base image layers remote vs local
        let config = self.load_config(token).await?;
        let remote = skopeo::layer_digest(&self.driver, &format!("docker://{}", config.image), token).await?;
        let local = skopeo::layer_digest(
            &self.driver,
            &format!("{}:{}", host::TRANSPORT_CONTAINERS_STORAGE, config.image),
            token,
        )
        .await?;

        if remote == local {
            return Ok(UpdateOutcome::UpToDate);
        }

        self.build_and_switch(token, true, false, log).await?;
        Ok(UpdateOutcome::Rebuilt)
    }

    /// Best-effort cleanup of dangling images after a switch
    async fn prune(&self, token: &CancellationToken) {
        if let Err(error) = podman::prune(&self.driver, token).await {
            log::warn!("image prune failed: {error}");
        }

        match podman::list_images(&self.driver, token).await {
            Ok(images) => {
                for image in images.iter().filter(|i| i.is_dangling()) {
                    if let Err(error) = podman::remove_image(&self.driver, &image.id, token).await {
                        log::warn!("failed to remove dangling image {}: {error}", image.id);
                    }
                }
            }
            Err(error) => log::warn!("image listing failed: {error}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("image configuration unchanged since the last build")]
    Unchanged,

    #[error("no booted image to derive a configuration from")]
    NoBootedImage,

    #[error("boot entry switch to {0} failed: {1}")]
    Switch(String, String),

    #[error("boot tool: {0}")]
    Tool(String),

    #[error("config: {0}")]
    Config(#[from] config::Error),

    #[error("history: {0}")]
    History(#[from] history::Error),

    #[error("host probe: {0}")]
    Host(#[from] host::Error),

    #[error("podman: {0}")]
    Podman(#[from] podman::Error),

    #[error("skopeo: {0}")]
    Skopeo(#[from] skopeo::Error),

    #[error("driver: {0}")]
    Driver(#[from] driver::Error),

    #[error("io")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Taxonomy mapping for the response envelope
    pub fn as_matched(&self) -> MatchedError {
        match self {
            Error::Unchanged => MatchedError::new(ErrorKind::ImageUnchanged),
            Error::NoBootedImage | Error::Config(_) => MatchedError::with_params(
                ErrorKind::InvalidConfig,
                vec![self.to_string()],
            ),
            other => MatchedError::with_params(ErrorKind::OperationFailed, vec![other.to_string()]),
        }
    }
}
