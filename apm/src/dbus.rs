// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Bus services wrapping the core actions
//!
//! The system service carries the privileged package/image/kernel
//! operations; the session service is reserved for unprivileged user
//! tooling. Every method takes a transaction id, answers with the JSON
//! envelope, and operation events fan out as `Notification` signals.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use zbus::{connection, interface, object_server::SignalEmitter, Connection};

use crate::actions::Actions;
use crate::db::packages::{Order, Query};
use crate::environment::Format;
use crate::event::Emitter;
use crate::kernel;
use crate::response::{self, CleanResponse, Envelope, HistoryRow, ImageApplyResponse, ImageStatusResponse};
use crate::Env;

pub const SERVICE_NAME: &str = "com.application.APM";
pub const OBJECT_PATH: &str = "/com/application/APM";
pub const INTERFACE: &str = "com.application.APM";

/// Privileged service on the system bus
pub struct SystemService {
    base: Arc<Env>,
}

impl SystemService {
    pub fn new(base: Arc<Env>) -> Self {
        Self { base }
    }

    /// Per-call context: the caller's transaction id rides along in
    /// every event the call emits
    async fn actions(&self, connection: &Connection, transaction: String) -> Result<Arc<Actions>, crate::actions::Error> {
        let mut env = (*self.base).clone();
        env.format = Format::Dbus;
        env.transaction = (!transaction.is_empty()).then_some(transaction);
        env.assume_yes = true;
        let env = Arc::new(env);

        let events = Emitter::new(&env, Some(connection.clone()));
        Ok(Arc::new(Actions::new(env, events).await?))
    }
}

fn envelope<T: Serialize>(result: Result<T, impl AsMatched>) -> String {
    match result {
        Ok(data) => Envelope::ok(data).to_json(),
        Err(error) => response::failure(error.as_matched().message()).to_json(),
    }
}

/// Uniform taxonomy view over the per-subsystem error types
trait AsMatched {
    fn as_matched(&self) -> crate::apt::MatchedError;
}

impl AsMatched for crate::actions::Error {
    fn as_matched(&self) -> crate::apt::MatchedError {
        crate::actions::Error::as_matched(self)
    }
}

impl AsMatched for kernel::Error {
    fn as_matched(&self) -> crate::apt::MatchedError {
        kernel::Error::as_matched(self)
    }
}

impl AsMatched for crate::image::Error {
    fn as_matched(&self) -> crate::apt::MatchedError {
        crate::image::Error::as_matched(self)
    }
}

macro_rules! with_actions {
    ($self:ident, $connection:ident, $transaction:ident, |$actions:ident| $body:expr) => {
        match $self.actions($connection, $transaction).await {
            Ok($actions) => envelope($body.await),
            Err(error) => response::failure(error.as_matched().message()).to_json(),
        }
    };
}

#[interface(name = "com.application.APM")]
impl SystemService {
    async fn install(
        &self,
        #[zbus(connection)] connection: &Connection,
        transaction: String,
        packages: Vec<String>,
        apply: bool,
    ) -> String {
        let token = CancellationToken::new();
        with_actions!(self, connection, transaction, |actions| actions.install(&packages, apply, &token))
    }

    async fn remove(
        &self,
        #[zbus(connection)] connection: &Connection,
        transaction: String,
        packages: Vec<String>,
        apply: bool,
    ) -> String {
        let token = CancellationToken::new();
        with_actions!(self, connection, transaction, |actions| actions.remove(&packages, apply, &token))
    }

    async fn update(&self, #[zbus(connection)] connection: &Connection, transaction: String) -> String {
        let token = CancellationToken::new();
        with_actions!(self, connection, transaction, |actions| actions.update(&token))
    }

    async fn upgrade(&self, #[zbus(connection)] connection: &Connection, transaction: String) -> String {
        let token = CancellationToken::new();
        with_actions!(self, connection, transaction, |actions| actions.upgrade(&token))
    }

    async fn info(
        &self,
        #[zbus(connection)] connection: &Connection,
        transaction: String,
        package: String,
    ) -> String {
        let token = CancellationToken::new();
        with_actions!(self, connection, transaction, |actions| actions.info(&package, &token))
    }

    async fn search(
        &self,
        #[zbus(connection)] connection: &Connection,
        transaction: String,
        query: String,
        installed_only: bool,
    ) -> String {
        let token = CancellationToken::new();
        with_actions!(self, connection, transaction, |actions| actions.search(
            &query,
            installed_only,
            &token
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn list(
        &self,
        #[zbus(connection)] connection: &Connection,
        transaction: String,
        filters: HashMap<String, String>,
        sort: String,
        order: String,
        limit: i64,
        offset: i64,
    ) -> String {
        let token = CancellationToken::new();
        let params = Query {
            filters,
            sort: (!sort.is_empty()).then_some(sort),
            order: Order::parse(&order),
            limit: Some(limit),
            offset,
        };
        with_actions!(self, connection, transaction, |actions| actions.list(&params, false, &token))
    }

    async fn image_apply(&self, #[zbus(connection)] connection: &Connection, transaction: String) -> String {
        let token = CancellationToken::new();
        match self.actions(connection, transaction).await {
            Ok(actions) => {
                let result = actions.image().build_and_switch(&token, false, true, None).await.map(|report| {
                    ImageApplyResponse {
                        message: "the image has been updated".to_owned(),
                        image_id: report.image_id,
                        journaled: report.journaled,
                    }
                });
                envelope(result)
            }
            Err(error) => response::failure(error.as_matched().message()).to_json(),
        }
    }

    async fn image_status(&self, #[zbus(connection)] connection: &Connection, transaction: String) -> String {
        let token = CancellationToken::new();
        match self.actions(connection, transaction).await {
            Ok(actions) => {
                let result = async {
                    Ok::<_, crate::image::Error>(ImageStatusResponse {
                        host: actions.image().status(&token).await?,
                        config: actions.image().load_config(&token).await?,
                    })
                }
                .await;
                envelope(result)
            }
            Err(error) => response::failure(error.as_matched().message()).to_json(),
        }
    }

    async fn image_update(&self, #[zbus(connection)] connection: &Connection, transaction: String) -> String {
        let token = CancellationToken::new();
        match self.actions(connection, transaction).await {
            Ok(actions) => {
                let result = actions
                    .image()
                    .check_update(&token, None)
                    .await
                    .map(response::ImageUpdateResponse::from_outcome);
                envelope(result)
            }
            Err(error) => response::failure(error.as_matched().message()).to_json(),
        }
    }

    async fn image_history(
        &self,
        #[zbus(connection)] connection: &Connection,
        transaction: String,
        image: String,
        limit: i64,
        offset: i64,
    ) -> String {
        match self.actions(connection, transaction).await {
            Ok(actions) => {
                let filter = (!image.is_empty()).then_some(image);
                let history = actions.image().history();
                let result = async {
                    let (entries, total_count) = futures::try_join!(
                        history.list(filter.as_deref(), limit, offset),
                        history.count(filter.as_deref())
                    )?;
                    Ok::<_, crate::db::history::Error>(response::ImageHistoryResponse {
                        history: entries
                            .into_iter()
                            .map(|entry| HistoryRow {
                                image_name: entry.image_name,
                                config: entry.config,
                                date: entry.date,
                            })
                            .collect(),
                        total_count,
                    })
                }
                .await;
                match result {
                    Ok(data) => Envelope::ok(data).to_json(),
                    Err(error) => response::failure(error.to_string()).to_json(),
                }
            }
            Err(error) => response::failure(error.as_matched().message()).to_json(),
        }
    }

    async fn kernel_list(
        &self,
        #[zbus(connection)] connection: &Connection,
        transaction: String,
        flavour: String,
    ) -> String {
        let token = CancellationToken::new();
        match self.actions(connection, transaction).await {
            Ok(actions) => {
                let manager = kernel::Manager::new(actions);
                let result = manager
                    .list((!flavour.is_empty()).then_some(flavour.as_str()), &token)
                    .await
                    .map(|kernels| response::ListKernelsResponse { kernels });
                envelope(result)
            }
            Err(error) => response::failure(error.as_matched().message()).to_json(),
        }
    }

    async fn kernel_current(&self, #[zbus(connection)] connection: &Connection, transaction: String) -> String {
        let token = CancellationToken::new();
        match self.actions(connection, transaction).await {
            Ok(actions) => {
                let manager = kernel::Manager::new(actions);
                let result = manager
                    .current(&token)
                    .await
                    .map(|kernel| response::CurrentKernelResponse { kernel });
                envelope(result)
            }
            Err(error) => response::failure(error.as_matched().message()).to_json(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn kernel_install(
        &self,
        #[zbus(connection)] connection: &Connection,
        transaction: String,
        flavour: String,
        modules: Vec<String>,
        include_headers: bool,
        dry_run: bool,
    ) -> String {
        let token = CancellationToken::new();
        match self.actions(connection, transaction).await {
            Ok(actions) => {
                let manager = kernel::Manager::new(actions);
                let result = async {
                    let kernel = manager.find_latest(Some(&flavour), &token).await?;
                    manager.install(&kernel, &modules, include_headers, dry_run, &token).await
                }
                .await;
                envelope(result)
            }
            Err(error) => response::failure(error.as_matched().message()).to_json(),
        }
    }

    async fn kernel_clean(
        &self,
        #[zbus(connection)] connection: &Connection,
        transaction: String,
        no_backup: bool,
        dry_run: bool,
    ) -> String {
        let token = CancellationToken::new();
        match self.actions(connection, transaction).await {
            Ok(actions) => {
                let manager = kernel::Manager::new(actions);
                let result = manager.clean_old(no_backup, dry_run, &token).await.map(|report| CleanResponse {
                    message: if report.dry_run {
                        "dry run, nothing removed".to_owned()
                    } else {
                        format!("{} kernels removed", report.removed.len())
                    },
                    report,
                });
                envelope(result)
            }
            Err(error) => response::failure(error.as_matched().message()).to_json(),
        }
    }

    /// Event fan-out: `{ data, transaction?, type: "event" }`
    #[zbus(signal)]
    pub async fn notification(emitter: &SignalEmitter<'_>, data: String) -> zbus::Result<()>;
}

/// Reserved unprivileged service on the session bus
pub struct SessionService {
    base: Arc<Env>,
}

#[interface(name = "com.application.APM")]
impl SessionService {
    /// Capability probe for user-facing frontends
    async fn capabilities(&self) -> String {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Capabilities {
            is_atomic: bool,
            exist_stplr: bool,
            exist_distrobox: bool,
        }
        Envelope::ok(Capabilities {
            is_atomic: self.base.is_atomic,
            exist_stplr: self.base.exist_stplr,
            exist_distrobox: self.base.exist_distrobox,
        })
        .to_json()
    }

    async fn version(&self) -> String {
        Envelope::ok(env!("CARGO_PKG_VERSION")).to_json()
    }
}

/// Serve the privileged interface until cancelled
pub async fn serve_system(env: Arc<Env>, token: CancellationToken) -> Result<(), Error> {
    let _connection = connection::Builder::system()?
        .name(SERVICE_NAME)?
        .serve_at(OBJECT_PATH, SystemService::new(env))?
        .build()
        .await?;

    log::info!("serving {SERVICE_NAME} on the system bus");
    token.cancelled().await;
    Ok(())
}

/// Serve the unprivileged interface until cancelled
pub async fn serve_session(env: Arc<Env>, token: CancellationToken) -> Result<(), Error> {
    let _connection = connection::Builder::session()?
        .name(SERVICE_NAME)?
        .serve_at(OBJECT_PATH, SessionService { base: env })?
        .build()
        .await?;

    log::info!("serving {SERVICE_NAME} on the session bus");
    token.cancelled().await;
    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("bus: {0}")]
    Bus(#[from] zbus::Error),
}
