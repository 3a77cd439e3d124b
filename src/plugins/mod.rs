//! Built-in listener types.

mod anonymous;
mod oauth2;
mod signed;

pub use anonymous::AnonymousListener;
pub use oauth2::{OAuth2Listener, OAuth2Options};
pub use signed::{SignedListener, SignedOptions};

/// Location of the pass-through plugin.
pub const ANONYMOUS_LOCATION: &str = "plugins/anonymous";

/// Location of the OAuth2 client-credentials plugin.
pub const OAUTH2_LOCATION: &str = "plugins/oauth2";

/// Location of the HMAC-signing plugin.
pub const SIGNED_LOCATION: &str = "plugins/signed";
