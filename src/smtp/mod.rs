//! SMTP server implementation

pub mod commands;
pub mod data;
pub mod error;
pub mod response;
pub mod server;
pub mod session;
pub mod state;

pub use data::DataReader;
pub use error::{SmtpError, SmtpLimits};
pub use response::SmtpResponse;
pub use server::{ServerHandle, ServerLimits, SmtpServer};
pub use session::{Backend, BodyType, MailOptions, RcptOptions, Session};
pub use state::{ProtocolState, SmtpState};
