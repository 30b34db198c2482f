//! Embedded schema bundle for the outbox table

use relaybox_migration::Step;

pub(crate) const STATE_TABLE: &str = "outbox_schema";

pub(crate) fn steps() -> Vec<Step> {
    vec![Step {
        version: 1,
        name: "create_outbox_table",
        up: include_str!("../migrations/0001_create_outbox_table.up.sql"),
        down: include_str!("../migrations/0001_create_outbox_table.down.sql"),
    }]
}
