pub mod config;
pub mod controls;
pub mod decoder;
pub mod error;
pub mod filter;
pub mod ldap_protocol;
pub mod ldif;
pub mod result_code;
pub mod session;
pub mod tls;

pub use config::Config;
pub use controls::{ControlsContext, ResponseControls};
pub use decoder::{decode_batch, fetch_results, Entry, LdapResult, MessageId, MessageSource, ResultItem, WaitMode};
pub use error::{LdapError, Result};
pub use session::{ConnectOptions, LdapStream, Session};
