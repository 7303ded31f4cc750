//! CRTP packet framing and the dispatcher/device layer above it.

pub mod device;
pub mod dispatcher;
pub mod packet;

pub use device::Device;
pub use dispatcher::Dispatcher;
pub use packet::{Packet, Port};
