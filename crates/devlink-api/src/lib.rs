// devlink-api: transport layer for the devlink connector runtime
//
// WebSocket session (connect, auth handshake, send, receive loop),
// the JSON message envelope, a retrying HTTP helper, and hub
// registration against the platform's REST API.

pub mod error;
pub mod hub;
pub mod message;
pub mod session;
pub mod transport;

pub use error::Error;
pub use hub::{HubApi, HubInfo, HubSync};
pub use message::{ContentType, Message, MessageKind, Method};
pub use session::{CloseReason, Credentials, Session, SessionConfig, SessionEvent};
pub use transport::{HttpClient, HttpRequest, HttpResponse, RetryPolicy, TlsMode, TransportConfig};
