mod flags;
mod interfaces;
mod item;
pub mod keys;

pub use flags::ItemFlags;
pub use interfaces::{
    Adapter, Endpoint, Link, Linkable, PortDescriptor, PortsState, RegistrationInfo, Stream,
    StreamAcquisition, StreamRegistration, ready,
};
pub use item::{
    AssociatedProxy, ItemId, ItemImpl, ProxyKind, STEP_VERIFY_CONFIG, SessionItem,
    verify_configured,
};
