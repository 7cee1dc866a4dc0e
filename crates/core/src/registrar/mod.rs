//! Registration of a finished install with the host launcher.
//!
//! Registration makes the launcher treat the app as owned and installed:
//! an ownership entry, depot decryption keys, cached manifests and an app
//! manifest next to the library.

mod edits;
mod error;
mod library;
mod traits;
mod types;

pub use edits::{
    add_app_token, add_decryption_keys, add_owned_app, existing_depot_ids, render_app_manifest,
};
pub use error::RegistrationError;
pub use library::LibraryRegistrar;
pub use traits::Registrar;
pub use types::RegistrationStatus;
