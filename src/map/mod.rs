//! Replicated Map Module
//!
//! A key/value store spread over the members of a channel. Writes make the writer the
//! primary of the key and push the value to a small, stable set of backups.
//!
//! ## Core Mechanisms
//! - **Roles**: primary (owner), backup (holds a copy), proxy (knows the owner).
//! - **Backup Selection**: sorted map members, starting at `hash(key) % n`.
//! - **Reads**: served locally when possible, otherwise by RPC to backups, then the primary,
//!   then everybody (newest version wins).
//! - **Failover**: when a primary leaves, its first surviving backup promotes itself and
//!   replicates again.
//! - **State Transfer**: a starting member copies the entry table of an existing one.
//! - **Conflicts**: last writer wins on `(timestamp, counter, writer)`.

pub mod replicated;
pub mod types;

#[cfg(test)]
mod tests;
