// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Fire-and-forget notification bus
//!
//! Every operation announces itself with a BEFORE/AFTER pair tagged by
//! the invocation's transaction id. Delivery depends on the selected
//! output format; an undeliverable event is logged and dropped.

use serde::{Deserialize, Serialize};

use crate::environment::Format;
use crate::Env;

/// Phase marker of an event pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_name: String,
    pub state: State,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view: Option<String>,
}

impl Event {
    pub fn new(name: impl Into<String>, state: State) -> Self {
        Self {
            event_name: name.into(),
            state,
            transaction: None,
            progress: None,
            view: None,
        }
    }

    pub fn with_progress(mut self, percent: f64, done_text: Option<String>) -> Self {
        self.progress = Some(Progress { percent, done_text });
        self
    }

    pub fn with_view(mut self, view: impl Into<String>) -> Self {
        self.view = Some(view.into());
        self
    }
}

/// Where events go for this invocation
#[derive(Debug, Clone)]
enum Sink {
    /// Human readable single lines on the terminal
    Text,
    /// D-Bus signal fan-out
    Dbus(zbus::Connection),
    /// Swallow everything (json mode keeps stdout clean for the envelope)
    Null,
}

#[derive(Debug, Clone)]
pub struct Emitter {
    sink: Sink,
    transaction: Option<String>,
}

impl Emitter {
    /// Pick the sink from the session format. The D-Bus connection is
    /// provided by the service wrapper when running under the bus.
    pub fn new(env: &Env, connection: Option<zbus::Connection>) -> Self {
        let sink = match (env.format, connection) {
            (Format::Dbus, Some(connection)) => Sink::Dbus(connection),
            (Format::Text, _) => Sink::Text,
            _ => Sink::Null,
        };
        Self {
            sink,
            transaction: env.transaction.clone(),
        }
    }

    pub fn null() -> Self {
        Self {
            sink: Sink::Null,
            transaction: None,
        }
    }

    /// Emit one event. Never fails; delivery errors are logged.
    pub async fn emit(&self, state: State, mut event: Event) {
        event.state = state;
        if event.transaction.is_none() {
            event.transaction.clone_from(&self.transaction);
        }

        match &self.sink {
            Sink::Null => {}
            Sink::Text => match state {
                State::Before => log::info!("{} ...", event.event_name),
                State::After => log::info!("{} done", event.event_name),
            },
            Sink::Dbus(connection) => {
                if let Err(error) = send_signal(connection, &event).await {
                    log::warn!("event {} not delivered: {error}", event.event_name);
                }
            }
        }
    }

    /// Convenience BEFORE/AFTER bracket around an operation name
    pub async fn before(&self, name: &str) {
        self.emit(State::Before, Event::new(name, State::Before)).await;
    }

    pub async fn after(&self, name: &str) {
        self.emit(State::After, Event::new(name, State::After)).await;
    }
}

async fn send_signal(connection: &zbus::Connection, event: &Event) -> zbus::Result<()> {
    // Wire shape of the notification: { data, transaction?, type }
    let payload = serde_json::json!({
        "data": event,
        "transaction": event.transaction,
        "type": "event",
    });
    connection
        .emit_signal(
            None::<zbus::names::BusName<'_>>,
            crate::dbus::OBJECT_PATH,
            crate::dbus::INTERFACE,
            "Notification",
            &(payload.to_string(),),
        )
        .await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn serialized_shape() {
        let event = Event::new("system.install", State::Before)
            .with_progress(42.0, Some("half way".to_owned()))
            .with_view("table".to_owned());

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"state\":\"BEFORE\""));
        assert!(json.contains("\"eventName\":\"system.install\""));
        assert!(json.contains("\"percent\":42.0"));
        // Absent transaction is omitted entirely
        assert!(!json.contains("transaction"));
    }

    #[tokio::test]
    async fn null_sink_swallows() {
        let emitter = Emitter::null();
        emitter.before("system.update").await;
        emitter.after("system.update").await;
    }
}
