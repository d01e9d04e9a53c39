pub mod scripted;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use scripted::ScriptedModel;

#[cfg(feature = "backend-tract")]
pub use tract::{TractLoader, TractModel};
