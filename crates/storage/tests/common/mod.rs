pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{content_sha256, seeded_bytes};
