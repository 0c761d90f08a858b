// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # IBFT Protocol: Consensus Core
//!
//! The finality engine for a sharded chain: a round-based IBFT state machine
//! that turns one proposal per height into a block carrying a quorum of
//! committed seals. It keeps agreeing as long as fewer than a third of the
//! voting power misbehaves.
//!
//! The engine does not know how blocks look, how keys work, or how bytes
//! travel. It asks a [`consensus::Backend`] and a [`consensus::Transport`],
//! and everything else stays on the host's side of that seam.
//!
//! ## Architecture
//!
//! - **consensus**: The state machine, validation rules, quorum math, and
//!   round timers.
//! - **messages**: Message types, the message store, and quorum-triggered
//!   subscriptions.
//! - **crypto**: Ed25519 identities and BLAKE3 digests for the reference
//!   backend.
//! - **local**: An in-process backend, transport, and cluster harness.
//! - **metrics**: Prometheus instrumentation, opt-in.
//! - **config**: Timing constants and the engine configuration.
//!
//! ## Design Philosophy
//!
//! 1. Safety first. Two honest nodes never finalize different blocks at the
//!    same height, no matter how the network behaves.
//! 2. Liveness through timeouts: a stuck round always ends, and the next one
//!    lasts twice as long.
//! 3. Nothing is stubbed. Signatures, seals, and validator membership are
//!    checked for real, even in the reference backend.

pub mod config;
pub mod consensus;
pub mod crypto;
pub mod local;
pub mod messages;
pub mod metrics;
