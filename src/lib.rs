//! Operator toolkit for privacy-preserving polls.
//!
//! The crate drives a poll through its full lifecycle against an external
//! zero-knowledge voting protocol and independently checks the published
//! results. `config` resolves raw poll parameters into an immutable spec,
//! `registrar` keeps verifying-key registration idempotent, `vote` builds
//! signed nonce-ordered command batches, and `sequencer`/`orchestrator`
//! compose the lifecycle steps. `verification` recomputes expected tallies
//! from the raw ballots and diffs them against the on-chain state and the
//! persisted tally artifact.
//!
//! Applications typically depend on [`config::OperatorConfig`] to describe a
//! poll, [`orchestrator::RunContext`] and [`orchestrator::Orchestrator`] to
//! drive it, and [`verification`] to re-check results after the fact. The
//! external protocol is reached only through the traits in [`interfaces`];
//! [`devnet`] provides an in-process implementation for rehearsals.

pub mod config;
pub mod crypto;
pub mod devnet;
pub mod errors;
pub mod interfaces;
pub mod orchestrator;
pub mod poll;
pub mod registrar;
pub mod repository;
pub mod sequencer;
pub mod verification;
pub mod vote;
