//! Multi-node fixtures.

pub mod two_node;

pub use two_node::TwoNodeFixture;
