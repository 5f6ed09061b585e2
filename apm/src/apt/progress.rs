// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Typed progress stream derived from the engine's status records

use std::collections::VecDeque;

use crate::package::PackageChanges;

/// Kinds of progress events a mutating call emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressKind {
    DownloadStart,
    DownloadProgress,
    DownloadStop,
    InstStart,
    InstProgress,
    InstStop,
    RemoveStart,
    RemoveProgress,
    RemoveStop,
    TransStart,
    TransProgress,
    TransStop,
    ElemProgress,
    Error,
}

/// One progress notification: `(package, kind, current, total)`
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub package: String,
    pub kind: ProgressKind,
    pub current: u64,
    pub total: u64,
}

impl ProgressEvent {
    pub(super) fn new(package: impl Into<String>, kind: ProgressKind, current: u64) -> Self {
        Self {
            package: package.into(),
            kind,
            current,
            total: 100,
        }
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.current as f64 * 100.0 / self.total as f64
        }
    }
}

/// Packages the simulation planned, in plan order. Status records that
/// carry no package name are attributed to the queue head; the queue
/// advances on every `*Stop`.
#[derive(Debug, Default)]
pub struct PlannedQueue {
    names: VecDeque<String>,
}

impl PlannedQueue {
    pub fn from_changes(changes: &PackageChanges) -> Self {
        Self {
            names: changes.touched().cloned().collect(),
        }
    }

    pub fn attribute(&self, name: &str) -> String {
        if !name.is_empty() && name != "dpkg-exec" {
            return name.to_owned();
        }
        self.names.front().cloned().unwrap_or_default()
    }

    pub fn advance(&mut self) {
        self.names.pop_front();
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Section of the status stream a package is currently in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Download,
    Install,
    Remove,
}

impl Section {
    fn start(self) -> ProgressKind {
        match self {
            Section::Download => ProgressKind::DownloadStart,
            Section::Install => ProgressKind::InstStart,
            Section::Remove => ProgressKind::RemoveStart,
        }
    }

    fn progress(self) -> ProgressKind {
        match self {
            Section::Download => ProgressKind::DownloadProgress,
            Section::Install => ProgressKind::InstProgress,
            Section::Remove => ProgressKind::RemoveProgress,
        }
    }

    fn stop(self) -> ProgressKind {
        match self {
            Section::Download => ProgressKind::DownloadStop,
            Section::Install => ProgressKind::InstStop,
            Section::Remove => ProgressKind::RemoveStop,
        }
    }
}

/// Incremental parser over `APT::Status-Fd` records.
///
/// The records carry no explicit start/stop markers, so edges are
/// synthesised: the first record for a package opens with `*Start`, a
/// change of package (or [`StatusParser::finish`]) closes the previous
/// one with `*Stop`. Every `*Start` therefore has exactly one matching
/// `*Stop` in stream order.
#[derive(Debug)]
pub struct StatusParser {
    queue: PlannedQueue,
    current: Option<(String, Section)>,
}

impl StatusParser {
    pub fn new(queue: PlannedQueue) -> Self {
        Self { queue, current: None }
    }

    /// Feed one raw line; unknown lines produce no events
    pub fn feed(&mut self, line: &str) -> Vec<ProgressEvent> {
        let mut fields = line.splitn(4, ':');
        let record = fields.next().unwrap_or_default();
        let subject = fields.next().unwrap_or_default().trim();
        let percent = fields
            .next()
            .and_then(|p| p.trim().parse::<f64>().ok())
            .unwrap_or(0.0)
            .clamp(0.0, 100.0) as u64;
        let message = fields.next().unwrap_or_default().trim();

        match record {
            "dlstatus" => {
                // Download records are indexed, not named
                let package = self.queue.attribute("");
                self.transition(package, Section::Download, percent)
            }
            "pmstatus" => {
                let package = self.queue.attribute(subject);
                if subject == "dpkg-exec" {
                    // Overall transaction advance
                    return vec![ProgressEvent::new(package, ProgressKind::ElemProgress, percent)];
                }
                let section = if message.starts_with("Removing") || message.starts_with("Purging") {
                    Section::Remove
                } else {
                    Section::Install
                };
                self.transition(package, section, percent)
            }
            "pmerror" => {
                let package = self.queue.attribute(subject);
                vec![ProgressEvent::new(package, ProgressKind::Error, percent)]
            }
            _ => vec![],
        }
    }

    /// Close the trailing open section
    pub fn finish(&mut self) -> Vec<ProgressEvent> {
        let mut events = vec![];
        if let Some((package, section)) = self.current.take() {
            events.push(ProgressEvent::new(package, section.stop(), 100));
            self.queue.advance();
        }
        events
    }

    fn transition(&mut self, package: String, section: Section, percent: u64) -> Vec<ProgressEvent> {
        let mut events = vec![];

        match &self.current {
            Some((open, open_section)) if *open == package && *open_section == section => {
                events.push(ProgressEvent::new(package, section.progress(), percent));
            }
            Some((open, open_section)) => {
                events.push(ProgressEvent::new(open.clone(), open_section.stop(), 100));
                self.queue.advance();
                events.push(ProgressEvent::new(package.clone(), section.start(), percent));
                self.current = Some((package, section));
            }
            None => {
                events.push(ProgressEvent::new(package.clone(), section.start(), percent));
                self.current = Some((package, section));
            }
        }

        events
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn changes(names: &[&str]) -> PackageChanges {
        PackageChanges {
            new_installed_packages: names.iter().map(|n| (*n).to_owned()).collect(),
            new_installed_count: names.len() as i64,
            ..Default::default()
        }
    }

    #[test]
    fn start_stop_pairing() {
        let mut parser = StatusParser::new(PlannedQueue::from_changes(&changes(&["zip", "unzip"])));

        let mut events = vec![];
        for line in [
            "pmstatus:zip:10.0:Preparing zip",
            "pmstatus:zip:40.0:Unpacking zip",
            "pmstatus:unzip:60.0:Preparing unzip",
            "pmstatus:unzip:90.0:Configuring unzip",
        ] {
            events.extend(parser.feed(line));
        }
        events.extend(parser.finish());

        let starts = events.iter().filter(|e| e.kind == ProgressKind::InstStart).count();
        let stops = events.iter().filter(|e| e.kind == ProgressKind::InstStop).count();
        assert_eq!(starts, 2);
        assert_eq!(stops, 2);

        // Stops arrive after their starts, per package
        let zip_start = events.iter().position(|e| e.kind == ProgressKind::InstStart && e.package == "zip");
        let zip_stop = events.iter().position(|e| e.kind == ProgressKind::InstStop && e.package == "zip");
        assert!(zip_start.unwrap() < zip_stop.unwrap());
    }

    #[test]
    fn queue_attribution() {
        let mut parser = StatusParser::new(PlannedQueue::from_changes(&changes(&["zlib", "zip"])));

        // Download records carry no package name; the queue head owns them
        let events = parser.feed("dlstatus:1:50.0:Retrieving file 1 of 2");
        assert_eq!(events[0].package, "zlib");
        assert_eq!(events[0].kind, ProgressKind::DownloadStart);
    }

    #[test]
    fn queue_advances_on_stop() {
        let mut queue = PlannedQueue::from_changes(&changes(&["a", "b"]));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.attribute(""), "a");
        queue.advance();
        assert_eq!(queue.attribute(""), "b");
    }

    #[test]
    fn remove_section() {
        let mut parser = StatusParser::new(PlannedQueue::default());
        let events = parser.feed("pmstatus:oldpkg:30.0:Removing oldpkg");
        assert_eq!(events[0].kind, ProgressKind::RemoveStart);
        let events = parser.finish();
        assert_eq!(events[0].kind, ProgressKind::RemoveStop);
    }

    #[test]
    fn error_record() {
        let mut parser = StatusParser::new(PlannedQueue::default());
        let events = parser.feed("pmerror:zip:0:unable to unpack");
        assert_eq!(events[0].kind, ProgressKind::Error);
        assert_eq!(events[0].package, "zip");
    }

    #[test]
    fn elem_progress() {
        let mut parser = StatusParser::new(PlannedQueue::from_changes(&changes(&["zip"])));
        let events = parser.feed("pmstatus:dpkg-exec:25.0:Running dpkg");
        assert_eq!(events[0].kind, ProgressKind::ElemProgress);
        assert_eq!(events[0].package, "zip");
    }
}
