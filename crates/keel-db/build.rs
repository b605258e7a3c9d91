//! Rebuild when migrations change.
//!
//! `sqlx::migrate!` embeds the migration files at compile time, so cargo has
//! to know to recompile the crate when one is added or edited.

fn main() {
    println!("cargo:rerun-if-changed=migrations/");
}
