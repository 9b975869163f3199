//! storeman-mpc: threshold Schnorr over secp256k1 for a group of storeman peers.
//!
//! ## Description
//!
//! A group of mutually-distrusting peers jointly generates a group public key (GPK) and
//! later produces Schnorr signatures under it. No peer ever holds the full private key;
//! `threshold` honest peers are enough to sign.
//!
//! ## Protocol Summary
//!
//! Every run is led by the group leader. The leader assigns each peer a seed (its
//! x-coordinate for the run) and opens the run with a Request. From then on every peer
//! walks the same list of steps: share a random polynomial, publish the matching point,
//! reconstruct with Lagrange interpolation at zero, and cross-check the result with
//! everybody else.
//!
//! Signing adds a zero-constant blinding polynomial on top of the nonce polynomial, so
//! the published signature shares `s_i = k_i + e·x_i + b_i` leak nothing about `x_i`.
//! Every share travels with a commitment to its polynomial and a provenance signature
//! from its sender; a peer that receives a share not matching the commitment raises a
//! dispute that the judge step settles for the whole group.
//!
//! > ⚠ This implementation has not been reviewed or audited.
//!
//! ## Usage Notes
//!
//! A node wraps a [`GroupDirectory`] and a [`Transport`] in a [`Distributor`], and feeds
//! every packet it receives to [`Distributor::handle_packet`]. The leader calls
//! [`Distributor::request_key_generation`] and [`Distributor::request_signing`];
//! followers join automatically when the leader's Request reaches them.
//!
//! [`LocalNetwork`] joins the distributors of one process, which is how the demo binary
//! and the tests run.

pub mod approval;
pub mod config;
pub mod context;
pub mod crypto;
pub mod distributor;
pub mod error;
pub mod group;
pub mod keyshare;
pub mod logging;
pub mod message;
pub mod parking;
pub mod protocol;
pub mod slash;
pub mod step;
pub mod store;
pub mod transport;

pub use approval::{ApprovalStore, MemoryApprovalStore};
pub use config::{GroupConfig, MpcConfig};
pub use distributor::{Distributor, Presets, RunOutcome, RunOutput, SignatureParts};
pub use error::{MpcError, Result};
pub use group::GroupDirectory;
pub use keyshare::KeyShare;
pub use message::NodeId;
pub use transport::{LocalNetwork, Transport};
