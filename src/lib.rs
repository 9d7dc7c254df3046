//! [`conclave`](crate) is the membership and messaging core of a clustered
//! database node. A set of processes on different hosts agree on who is in
//! the cluster, exchange typed messages between named endpoints, and react to
//! peers joining or dying.
//!
//! # How a cluster forms
//! A node starts either as a *founder* ([`Cluster::start`]) or as a *joiner*
//! ([`Cluster::join`]). The founder opens a listening socket and is the sole
//! initial member. A joiner contacts any live member, which admits it with a
//! two-phase protocol: the contact proposes the newcomer to every existing
//! member, and once all of them accept, makes the admission official and
//! hands the newcomer a welcome listing the whole membership. The newcomer
//! then connects to every live member and consumes an application-defined
//! introduction stream before the join completes. Eviction of a dead peer is
//! the mirror image: propose the kill to every live member, then make it
//! official. Peer ids are never reused; killed peers remain in the
//! membership map as tombstones.
//!
//! # Mailboxes
//! Endpoints are [`Mailbox`](core::Mailbox)es: process-local handlers with
//! small integer ids, addressable from any peer through a
//! [`ClusterAddress`](core::ClusterAddress) of `(peer id, mailbox id)`.
//! Sends to a local mailbox short-circuit without touching the wire; remote
//! sends travel as a header frame plus payload bytes on the one connection
//! maintained per peer pair.
//!
//! # Modules
//! - [`core`]: addresses, framing, wire messages, mailboxes, signals.
//! - [`cluster`]: peers, membership, the admission/eviction protocols, and
//!   the [`Cluster`](cluster::Cluster) handle itself.
//! - [`testkit`]: logging and helpers used by the test suites.
//!
//! [`Cluster::start`]: cluster::Cluster::start
//! [`Cluster::join`]: cluster::Cluster::join

pub mod cluster;
pub mod core;
pub mod testkit;
