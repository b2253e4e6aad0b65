pub mod crypto;
pub mod error;
pub mod forwarding;
pub mod logging;
pub mod session;
pub mod topology;
pub mod transport;

pub use error::{ErrorKind, SshCoreError, SshResult};
