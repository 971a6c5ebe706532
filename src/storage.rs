//! Storage subsystem
//!
//! SQLite persistence through SeaORM.
//!
//! Components:
//! - `database`: connection setup and schema creation.
//! - `db_entities`: SeaORM entity models.
//! - `inventory`: read contract for targets and credentials.
//! - `history_store`: append-only execution history rows.
//! - `types`: target and credential records.

pub mod database;
pub mod db_entities;
pub mod history_store;
pub mod inventory;
pub mod types;

pub use history_store::HistoryStore;
pub use inventory::{Inventory, SqliteInventory};
pub use types::{Credential, Target};
