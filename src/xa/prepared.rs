use ahash::AHashSet as HashSet;

use crate::data_store::element::Key;

/// Outcome of one command executed at prepare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedCommand {
    key: Key,
    wrote: bool,
}

impl PreparedCommand {
    pub fn new(key: Key, wrote: bool) -> Self {
        Self { key, wrote }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Whether executing the command changed the real store.
    pub fn wrote(&self) -> bool {
        self.wrote
    }
}

/// A prepared XA branch and the outcome of each command it executed.
///
/// From prepare until commit or rollback, the branch holds the real store's
/// write locks of every updated key. Completing the branch drops the record,
/// so every record here is in doubt.
#[derive(Debug, Default)]
pub struct PreparedContext {
    commands: Vec<PreparedCommand>,
}

impl PreparedContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_command(&mut self, command: PreparedCommand) {
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[PreparedCommand] {
        &self.commands
    }

    /// Updated keys in order of first command, each paired with whether any
    /// command on it wrote.
    pub fn key_outcomes(&self) -> Vec<(Key, bool)> {
        let mut outcomes: Vec<(Key, bool)> = Vec::new();
        let mut seen = HashSet::new();
        for command in &self.commands {
            if seen.insert(command.key.clone()) {
                outcomes.push((command.key.clone(), command.wrote));
            } else if let Some(outcome) = outcomes.iter_mut().find(|(key, _)| key == &command.key) {
                outcome.1 |= command.wrote;
            }
        }
        outcomes
    }

    pub fn updated_keys(&self) -> Vec<Key> {
        self.key_outcomes().into_iter().map(|(key, _)| key).collect()
    }

    pub fn has_writes(&self) -> bool {
        self.commands.iter().any(PreparedCommand::wrote)
    }
}
