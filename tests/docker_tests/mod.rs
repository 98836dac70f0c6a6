//! Docker-backed cluster stories
//!
//! - `bootstrap`: a cluster is brought up from nothing and every node agrees
//!   on the leader; a caller can talk to it with the handed-out credentials
//! - `membership`: static membership through retry_join and client-auth
//!   enforcement on the listener

mod bootstrap;
mod helpers;
mod membership;
