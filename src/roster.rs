//! Local projection of the arbiter's roster.
//!
//! The projection is never computed locally. It is replaced wholesale by
//! `players` pushes and reconciliation pulls, and single entries are
//! overwritten only with health values the arbiter reported.

use std::fmt;

use crate::protocol::RosterEntry;

/// Read-only snapshot of registered players and their health, in arbiter order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    entries: Vec<RosterEntry>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard the current projection and adopt `entries`.
    pub fn replace(&mut self, entries: Vec<RosterEntry>) {
        self.entries = entries;
    }

    /// Record the arbiter-reported health of `name`, appending the player if
    /// the projection has not seen them yet.
    pub fn set_health(&mut self, name: &str, hp: i64) {
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => entry.hp = hp,
            None => self.entries.push(RosterEntry::new(name, hp)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&RosterEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Vec<RosterEntry>> for Roster {
    fn from(entries: Vec<RosterEntry>) -> Self {
        Self { entries }
    }
}

/// Formats as `Alice(100), Bob(80)`, or `(none)` when empty.
impl fmt::Display for Roster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return f.write_str("(none)");
        }
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}({})", entry.name, entry.hp)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn replace_drops_players_missing_from_snapshot() {
        let mut roster = Roster::from(vec![RosterEntry::new("Alice", 100), RosterEntry::new("Bob", 90)]);
        roster.replace(vec![RosterEntry::new("Alice", 70)]);

        assert_eq!(roster.len(), 1);
        assert!(roster.get("Bob").is_none());
        assert_eq!(roster.get("Alice").unwrap().hp, 70);
    }

    #[test]
    fn set_health_updates_in_place_or_appends() {
        let mut roster = Roster::from(vec![RosterEntry::new("Alice", 100), RosterEntry::new("Bob", 100)]);
        roster.set_health("Alice", 80);
        roster.set_health("Carol", 60);

        assert_eq!(
            roster.entries(),
            &[
                RosterEntry::new("Alice", 80),
                RosterEntry::new("Bob", 100),
                RosterEntry::new("Carol", 60),
            ]
        );
    }

    #[test]
    fn display_lists_players_or_none() {
        assert_eq!(Roster::new().to_string(), "(none)");
        let roster = Roster::from(vec![RosterEntry::new("Alice", 100), RosterEntry::new("Bob", 80)]);
        assert_eq!(roster.to_string(), "Alice(100), Bob(80)");
    }
}
