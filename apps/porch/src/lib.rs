pub mod config;
pub mod media;
pub mod negotiation;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod transport;

pub use media::{MediaConstraints, MediaEvent, MediaStack, MediaStreamHandle};
pub use negotiation::peer::{NegotiationRole, NegotiationState, PeerObserver};
pub use protocol::{CandidateBlob, Envelope, Inbound, Payload, SessionDescriptor};
pub use session::{RoomEvent, RoomSession, SessionOptions};
pub use transport::RoomChannel;
