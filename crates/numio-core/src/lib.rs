pub mod activation;
pub mod constants;
pub mod error;
pub mod offer;
pub mod outbox;
pub mod state;
pub mod types;

pub use activation::*;
pub use constants::*;
pub use error::{NumioError, PurchaseErrorCode};
pub use offer::*;
pub use outbox::*;
pub use state::{check_transition, ActivationState};
pub use types::*;
