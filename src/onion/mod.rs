//! v3 onion service client (§4.9): address codec, descriptor validation,
//! HSDir ring selection, and the rendezvous handshake.

mod address;
mod descriptor;
mod hsdir;
mod rendezvous;

pub use address::OnionAddress;
pub use descriptor::{IntroPoint, OnionDescriptor};
pub use hsdir::{blinded_public_key, descriptor_id, select_hsdirs, time_period};
pub use rendezvous::{HsNtorClient, Introduce1, RendezvousCookie, RendezvousState};
