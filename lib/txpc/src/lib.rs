//! Point-to-point TinyXPC session handling: wire codec, the relay state
//! machines, the per-output message queue and the channel router. All IO is
//! performed through injected adapters so the crate can be embedded into any
//! readiness-based event system.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod crc;
pub mod logging;
pub mod negotiation;
pub mod queue;
pub mod relay;
pub mod router;
pub mod support;
pub mod wire;
