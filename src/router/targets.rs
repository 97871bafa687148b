//! Target specifier resolution
//!
//! Turns the configured slider bindings into indices over one generation of
//! live sessions. Everything except `deej.current` is resolved here once per
//! generation; the foreground process changes between moves, so the router
//! resolves that one on every apply.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::config::AppConfig;
use crate::session::{
    AudioSession, Direction, SessionKind, CURRENT_TARGET, MASTER_TARGET, MIC_TARGET,
    SYSTEM_TARGET, UNMAPPED_TARGET,
};

/// One parsed target specifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Master,
    Mic,
    System,
    Unmapped,
    Current,
    /// Process name, group name, or device friendly name (lowercased)
    Named(String),
}

impl Target {
    pub fn parse(raw: &str) -> Self {
        let name = raw.trim().to_lowercase();
        match name.as_str() {
            MASTER_TARGET => Target::Master,
            MIC_TARGET => Target::Mic,
            SYSTEM_TARGET => Target::System,
            UNMAPPED_TARGET => Target::Unmapped,
            CURRENT_TARGET => Target::Current,
            _ => Target::Named(name),
        }
    }
}

/// Slider bindings resolved against one session generation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Bindings {
    /// Slider index to session indices, without `deej.current`
    pub by_slider: BTreeMap<usize, Vec<usize>>,
    /// Sliders bound to `deej.current`
    pub current: BTreeSet<usize>,
    /// Session indices in the unmapped bucket
    pub unmapped: Vec<usize>,
}

impl Bindings {
    pub fn sessions_for(&self, slider: usize) -> &[usize] {
        self.by_slider.get(&slider).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn follows_foreground(&self, slider: usize) -> bool {
        self.current.contains(&slider)
    }
}

/// Expand a named target through the config's groups
fn expand_named(config: &AppConfig, name: &str) -> Vec<String> {
    match config.group(name) {
        Some(members) => members.iter().map(|m| m.to_lowercase()).collect(),
        None => vec![name.to_string()],
    }
}

/// Every lowercase name some slider binds explicitly
pub fn claimed_names(config: &AppConfig) -> HashSet<String> {
    let mut claimed = HashSet::new();
    for targets in config.slider_mapping.values() {
        for target in targets.targets() {
            if let Target::Named(name) = Target::parse(target) {
                claimed.extend(expand_named(config, &name));
            }
        }
    }
    claimed
}

/// Resolve every configured binding against `sessions`
pub fn resolve(config: &AppConfig, sessions: &[AudioSession]) -> Bindings {
    let claimed = claimed_names(config);
    let ignored: HashSet<String> = config
        .ignore_unmapped
        .iter()
        .map(|name| name.to_lowercase())
        .collect();

    let unmapped: Vec<usize> = sessions
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_process() && !claimed.contains(s.key()) && !ignored.contains(s.key()))
        .map(|(i, _)| i)
        .collect();

    let mut bindings = Bindings {
        unmapped,
        ..Bindings::default()
    };

    for (slider, targets) in &config.slider_mapping {
        let mut matched = BTreeSet::new();

        for target in targets.targets() {
            match Target::parse(target) {
                Target::Master => {
                    matched.extend(indices(sessions, |s| {
                        matches!(s.kind(), SessionKind::Master(Direction::Output))
                    }));
                },
                Target::Mic => {
                    matched.extend(indices(sessions, |s| {
                        matches!(s.kind(), SessionKind::Master(Direction::Input))
                    }));
                },
                Target::System => {
                    matched.extend(indices(sessions, |s| {
                        matches!(s.kind(), SessionKind::SystemSounds)
                    }));
                },
                Target::Unmapped => matched.extend(bindings.unmapped.iter().copied()),
                Target::Current => {
                    bindings.current.insert(*slider);
                },
                Target::Named(name) => {
                    for member in expand_named(config, &name) {
                        matched.extend(indices(sessions, |s| {
                            matches!(
                                s.kind(),
                                SessionKind::Process { .. } | SessionKind::Device { .. }
                            ) && s.key() == member
                        }));
                    }
                },
            }
        }

        if !matched.is_empty() {
            bindings.by_slider.insert(*slider, matched.into_iter().collect());
        }
    }

    bindings
}

fn indices(sessions: &[AudioSession], pred: impl Fn(&AudioSession) -> bool) -> Vec<usize> {
    sessions
        .iter()
        .enumerate()
        .filter(|(_, s)| pred(s))
        .map(|(i, _)| i)
        .collect()
}
