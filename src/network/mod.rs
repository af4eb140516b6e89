//! Socket layer: command channel, broadcast channel and shared framing.

pub mod broadcast;
pub mod command;
pub mod protocol;
pub mod session;
pub mod viewer;

pub use broadcast::{BroadcastServer, Broadcaster};
pub use command::{CommandClient, CommandServer, RequestHandler};
pub use protocol::{Event, NewRun, Request, Response, StatusReport, VarValue, Vars};
pub use session::ViewerSessions;
pub use viewer::{ViewerClient, ViewerHandle};
