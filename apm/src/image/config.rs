// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Declarative desired state of the host image
//!
//! The YAML file is the single source of truth for local image
//! modifications; every mutation keeps the install and remove sets
//! deduplicated and disjoint, newest request winning a conflict.

use std::{io, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Target column for generated recipe lines
const RECIPE_WIDTH: usize = 80;
const RECIPE_INDENT: &str = "    ";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Packages {
    pub install: Vec<String>,
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub image: String,
    pub packages: Packages,
    pub commands: Vec<String>,
}

impl ImageConfig {
    /// A fresh config tracking the given base image
    pub fn for_image(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Parse and validate a YAML document
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut config: Self = serde_yaml::from_str(text)?;
        if config.image.is_empty() {
            return Err(Error::EmptyImage);
        }
        config.normalize();
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, Error> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Load from `path`, or derive a default from `booted` when the file
    /// does not exist yet
    pub fn load_or_init(path: &Path, booted: impl FnOnce() -> Result<String, Error>) -> Result<Self, Error> {
        if path.exists() {
            return Self::parse(&fs_err::read_to_string(path)?);
        }
        let image = booted()?;
        if image.is_empty() {
            return Err(Error::EmptyImage);
        }
        Ok(Self::for_image(image))
    }

    /// Persist atomically: write a sibling temp file, then rename over
    pub fn persist(&self, path: &Path) -> Result<(), Error> {
        let serialized = self.to_yaml()?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs_err::create_dir_all(dir)?;

        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        io::Write::write_all(&mut temp, serialized.as_bytes())?;
        temp.persist(path).map_err(|e| Error::Io(e.error))?;

        Ok(())
    }

    /// Mark a package for installation; a pending removal of the same
    /// name is dropped in favour of this newer request
    pub fn add_install(&mut self, name: &str) {
        self.packages.remove.retain(|n| n != name);
        if !self.packages.install.iter().any(|n| n == name) {
            self.packages.install.push(name.to_owned());
        }
    }

    /// Mark a package for removal; symmetric to [`ImageConfig::add_install`]
    pub fn add_remove(&mut self, name: &str) {
        self.packages.install.retain(|n| n != name);
        if !self.packages.remove.iter().any(|n| n == name) {
            self.packages.remove.push(name.to_owned());
        }
    }

    pub fn add_command(&mut self, command: &str) {
        if !self.commands.iter().any(|c| c == command) {
            self.commands.push(command.to_owned());
        }
    }

    pub fn has_install(&self, name: &str) -> bool {
        self.packages.install.iter().any(|n| n == name)
    }

    pub fn has_remove(&self, name: &str) -> bool {
        self.packages.remove.iter().any(|n| n == name)
    }

    fn normalize(&mut self) {
        dedup(&mut self.packages.install);
        dedup(&mut self.packages.remove);
        // A hand-edited file may hold a name in both sets; the removal
        // is treated as the newer intent
        let remove = self.packages.remove.clone();
        self.packages.install.retain(|n| !remove.contains(n));
    }

    /// Compile to a container build recipe.
    ///
    /// One `RUN` carries the whole package delta so the dependency
    /// solver sees installs and removals in a single pass; names are
    /// suffixed with the engine's `+` / `-` modifiers.
    pub fn render_containerfile(&self) -> String {
        let mut out = format!("FROM \"{}\"\n", self.image);

        let tokens: Vec<String> = self
            .packages
            .install
            .iter()
            .map(|n| format!("{n}+"))
            .chain(self.packages.remove.iter().map(|n| format!("{n}-")))
            .collect();

        if !tokens.is_empty() {
            let body = format!("apt-get update && apt-get -y install {}", tokens.join(" "));
            out.push('\n');
            out.push_str(&wrap_run(&body));
        }

        if !self.commands.is_empty() {
            let body = self.commands.join(" && ");
            out.push('\n');
            out.push_str(&wrap_run(&body));
        }

        out
    }
}

fn dedup(values: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    values.retain(|v| seen.insert(v.clone()));
}

/// Lay a `RUN` body out under the column limit, breaking between
/// tokens with backslash continuations
fn wrap_run(body: &str) -> String {
    let mut lines: Vec<String> = vec!["RUN".to_owned()];

    for token in body.split_whitespace() {
        let current = lines.last_mut().expect("at least one line");
        // +3 leaves room for the " \" continuation marker
        if current.len() + 1 + token.len() + 3 > RECIPE_WIDTH && current.trim() != "RUN" {
            lines.push(format!("{RECIPE_INDENT}{token}"));
        } else {
            current.push(' ');
            current.push_str(token);
        }
    }

    let mut out = String::new();
    for (i, line) in lines.iter().enumerate() {
        out.push_str(line);
        if i + 1 < lines.len() {
            out.push_str(" \\");
        }
        out.push('\n');
    }
    out
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("image field must not be empty")]
    EmptyImage,

    #[error("yaml")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use indoc::indoc;

    use super::*;

    #[test]
    fn parse_round_trip() {
        let text = indoc! {"
            image: ghcr.io/example/os:latest
            packages:
              install:
                - zip
                - zip
                - nano
              remove:
                - unzip
            commands:
              - systemctl enable sshd
        "};

        let config = ImageConfig::parse(text).unwrap();
        // Dedup applied on parse
        assert_eq!(config.packages.install, vec!["zip", "nano"]);

        let reparsed = ImageConfig::parse(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn empty_image_rejected() {
        assert!(matches!(
            ImageConfig::parse("image: \"\"\n"),
            Err(Error::EmptyImage)
        ));
    }

    #[test]
    fn install_remove_stay_disjoint() {
        let mut config = ImageConfig::for_image("img");
        config.add_install("zip");
        config.add_remove("zip");
        assert!(!config.has_install("zip"));
        assert!(config.has_remove("zip"));

        // Newest request wins again in the other direction
        config.add_install("zip");
        assert!(config.has_install("zip"));
        assert!(!config.has_remove("zip"));

        // And mutators never duplicate
        config.add_install("zip");
        assert_eq!(config.packages.install.len(), 1);
    }

    #[test]
    fn containerfile_layout() {
        let mut config = ImageConfig::for_image("ghcr.io/example/os:latest");
        config.add_install("zip");
        config.add_remove("unzip");
        config.add_command("systemctl enable sshd");

        let recipe = config.render_containerfile();
        let mut lines = recipe.lines();
        assert_eq!(lines.next(), Some("FROM \"ghcr.io/example/os:latest\""));

        assert!(recipe.contains("RUN apt-get update && apt-get -y install zip+ unzip-"));
        assert!(recipe.contains("RUN systemctl enable sshd"));
    }

    #[test]
    fn long_run_lines_wrap() {
        let mut config = ImageConfig::for_image("img");
        for i in 0..20 {
            config.add_install(&format!("package-with-a-long-name-{i}"));
        }

        let recipe = config.render_containerfile();
        for line in recipe.lines() {
            assert!(line.len() <= RECIPE_WIDTH, "line too long: {line}");
        }
        // Continuations present and indented
        assert!(recipe.contains(" \\\n    "));
    }

    #[test]
    fn no_packages_no_install_run() {
        let config = ImageConfig::for_image("img");
        let recipe = config.render_containerfile();
        assert!(!recipe.contains("apt-get"));
    }

    #[test]
    fn persist_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.yaml");

        let mut config = ImageConfig::for_image("img");
        config.add_install("zip");
        config.persist(&path).unwrap();

        let loaded = ImageConfig::load_or_init(&path, || unreachable!()).unwrap();
        assert_eq!(loaded, config);

        // Missing file falls back to the booted probe
        let fresh = ImageConfig::load_or_init(&dir.path().join("none.yaml"), || Ok("probe".to_owned())).unwrap();
        assert_eq!(fresh.image, "probe");
    }
}
