pub mod error;
mod events;
pub mod orchestrator;

pub use error::RoomsError;
pub use orchestrator::{QueryHandle, QueryKind, QueryTicket, RoomQueryOrchestrator};
