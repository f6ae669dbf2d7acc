//! End-to-end tests for the mirror engine
//!
//! These run the full registry, informers, queues and workers against
//! in-memory clusters and tell the story of an object travelling from a
//! source cluster to its followers.
//!
//! ```bash
//! cargo test -p mirror-controller --test mirror
//! ```

mod fake_cluster;
mod scenarios;
