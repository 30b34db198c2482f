//! Embedded schema bundle for the inbox table

use relaybox_migration::Step;

pub(crate) const STATE_TABLE: &str = "inbox_schema";

pub(crate) fn steps() -> Vec<Step> {
    vec![
        Step {
            version: 1,
            name: "create_inbox_table",
            up: include_str!("../migrations/0001_create_inbox_table.up.sql"),
            down: include_str!("../migrations/0001_create_inbox_table.down.sql"),
        },
        Step {
            version: 2,
            name: "add_retry_columns",
            up: include_str!("../migrations/0002_add_retry_columns.up.sql"),
            down: include_str!("../migrations/0002_add_retry_columns.down.sql"),
        },
    ]
}
